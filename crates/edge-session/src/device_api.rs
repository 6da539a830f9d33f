//! Calls to the device's `/webrtc/*` endpoints.

use std::sync::Arc;

use edge_link::{DeviceConnection, DeviceRequest, content_format, status};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AuthError, ProtocolError, SessionError};

pub const INFO_PATH: &str = "/webrtc/info";
pub const OAUTH_PATH: &str = "/webrtc/oauth";
pub const TRACKS_PATH: &str = "/webrtc/tracks";

/// Stream ports advertised by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcInfo {
    #[serde(rename = "FileStreamPort")]
    pub file_stream_port: u32,
    #[serde(rename = "SignalingStreamPort")]
    pub signaling_stream_port: u32,
}

#[derive(Serialize)]
struct TrackRequest<'a> {
    tracks: &'a [String],
}

#[derive(Clone)]
pub struct DeviceApi {
    connection: Arc<dyn DeviceConnection>,
}

impl DeviceApi {
    pub fn new(connection: Arc<dyn DeviceConnection>) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Arc<dyn DeviceConnection> {
        &self.connection
    }

    /// `GET /webrtc/info`, which must answer 2.05 with a CBOR body.
    pub async fn rtc_info(&self) -> Result<RtcInfo, SessionError> {
        let response = self.connection.request(DeviceRequest::get(INFO_PATH)).await?;
        if response.status != status::CONTENT {
            return Err(ProtocolError::UnexpectedStatus {
                path: INFO_PATH,
                status: response.status,
            }
            .into());
        }
        let info: RtcInfo =
            serde_cbor::from_slice(&response.payload).map_err(ProtocolError::InfoPayload)?;
        debug!(
            target = "edge_session",
            signaling_port = info.signaling_stream_port,
            file_port = info.file_stream_port,
            "device rtc info"
        );
        Ok(info)
    }

    /// Presents an access token to the device; anything but 2.01 is a
    /// rejection.
    pub async fn authorize(&self, access_token: &str) -> Result<(), AuthError> {
        let request = DeviceRequest::post(
            OAUTH_PATH,
            content_format::TEXT_PLAIN,
            access_token.as_bytes().to_vec(),
        );
        let response = self.connection.request(request).await?;
        if response.status != status::CREATED {
            return Err(AuthError::Rejected {
                status: response.status,
            });
        }
        debug!(target = "edge_session", "device accepted access token");
        Ok(())
    }

    /// Asks the device to start feeding the named tracks.
    pub async fn register_tracks(&self, tracks: &[String]) -> Result<(), SessionError> {
        let body = serde_json::to_vec(&TrackRequest { tracks })
            .map_err(|err| ProtocolError::Signal(err.into()))?;
        let request = DeviceRequest::post(TRACKS_PATH, content_format::JSON, body);
        let response = self.connection.request(request).await?;
        if response.status != status::CREATED {
            return Err(ProtocolError::UnexpectedStatus {
                path: TRACKS_PATH,
                status: response.status,
            }
            .into());
        }
        Ok(())
    }
}
