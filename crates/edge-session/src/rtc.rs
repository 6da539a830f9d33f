//! [`MediaEngine`] backed by webrtc-rs.

use std::sync::Arc;

use async_trait::async_trait;
use edge_signal::{SdpKind, SessionDescription};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as CodecRegistry;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;

use crate::config::SessionConfig;
use crate::error::MediaError;
use crate::media::{MediaEngine, MediaPeer, RemoteTrack, TrackKind};

pub struct RtcMediaEngine {
    api: API,
}

impl RtcMediaEngine {
    pub fn new() -> Result<Self, MediaError> {
        Ok(Self { api: build_api()? })
    }
}

fn build_api() -> Result<API, MediaError> {
    let mut codecs = CodecRegistry::default();
    codecs.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut codecs)?;

    Ok(APIBuilder::new()
        .with_media_engine(codecs)
        .with_interceptor_registry(registry)
        .build())
}

#[async_trait]
impl MediaEngine for RtcMediaEngine {
    async fn create_peer(&self, config: &SessionConfig) -> Result<Arc<dyn MediaPeer>, MediaError> {
        let mut rtc_config = RTCConfiguration::default();
        if !config.ice_servers.is_empty() {
            rtc_config.ice_servers = vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }];
        }
        let pc = Arc::new(self.api.new_peer_connection(rtc_config).await?);

        // The device only sends; the video and audio transceivers are both receive-only.
        for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: Vec::new(),
                }),
            )
            .await?;
        }

        let (tracks_tx, tracks_rx) = mpsc::unbounded_channel();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                _ => TrackKind::Video,
            };
            let remote = RemoteTrack {
                id: track.id(),
                kind,
                track: Some(track),
            };
            info!(target = "edge_session::rtc", track = %remote.id, kind = ?kind, "remote track");
            let _ = tracks_tx.send(remote);
            Box::pin(async {})
        }));
        pc.on_peer_connection_state_change(Box::new(|state| {
            debug!(target = "edge_session::rtc", state = %state, "peer connection state changed");
            Box::pin(async {})
        }));

        Ok(Arc::new(RtcPeer {
            pc,
            gather: Mutex::new(None),
            tracks: Mutex::new(Some(tracks_rx)),
        }))
    }
}

struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    gather: Mutex<Option<mpsc::Receiver<()>>>,
    tracks: Mutex<Option<mpsc::UnboundedReceiver<RemoteTrack>>>,
}

#[async_trait]
impl MediaPeer for RtcPeer {
    async fn create_offer(&self) -> Result<(), MediaError> {
        let offer = self.pc.create_offer(None).await?;
        // Subscribe before gathering starts so completion cannot be missed.
        let gather = self.pc.gathering_complete_promise().await;
        *self.gather.lock() = Some(gather);
        self.pc.set_local_description(offer).await?;
        trace!(target = "edge_session::rtc", "local offer applied, gathering");
        Ok(())
    }

    async fn gathering_complete(&self) -> Result<SessionDescription, MediaError> {
        let gather = self.gather.lock().take();
        if let Some(mut gather) = gather {
            let _ = gather.recv().await;
        }
        let local = self
            .pc
            .local_description()
            .await
            .ok_or(MediaError::MissingLocalDescription)?;
        Ok(SessionDescription::new(SdpKind::Offer, local.sdp))
    }

    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), MediaError> {
        let answer = RTCSessionDescription::answer(answer.sdp)?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    fn take_remote_tracks(&self) -> Option<mpsc::UnboundedReceiver<RemoteTrack>> {
        self.tracks.lock().take()
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.pc.close().await?;
        Ok(())
    }
}
