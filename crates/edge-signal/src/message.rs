use serde::{Deserialize, Serialize, Serializer};

use crate::SignalError;

/// Kind of a signaling frame, carried as an integer on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SignalMessageType {
    Offer = 0,
    Answer = 1,
    IceCandidate = 2,
    TurnRequest = 3,
    TurnResponse = 4,
}

impl SignalMessageType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_wire(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Offer),
            1 => Some(Self::Answer),
            2 => Some(Self::IceCandidate),
            3 => Some(Self::TurnRequest),
            4 => Some(Self::TurnResponse),
            _ => None,
        }
    }
}

impl Serialize for SignalMessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataTrack {
    pub mid: String,
    #[serde(rename = "trackId")]
    pub track_id: String,
}

impl MetadataTrack {
    pub fn new(mid: impl Into<String>, track_id: impl Into<String>) -> Self {
        Self {
            mid: mid.into(),
            track_id: track_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMetadata {
    pub tracks: Vec<MetadataTrack>,
    #[serde(rename = "noTrickle")]
    pub no_trickle: bool,
}

/// One signaling frame.
///
/// Absent `data`/`metadata` are written as explicit JSON nulls and accepted
/// either as null or missing when read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalMessageType,
    pub data: Option<String>,
    pub metadata: Option<SignalMetadata>,
}

impl SignalMessage {
    pub fn new(kind: SignalMessageType) -> Self {
        Self {
            kind,
            data: None,
            metadata: None,
        }
    }

    /// Offer frame for a fully gathered local description. ICE candidates
    /// are embedded in the SDP, so `noTrickle` is always set.
    pub fn offer(sdp: impl Into<String>, tracks: Vec<MetadataTrack>) -> Result<Self, SignalError> {
        let description = SessionDescription::new(SdpKind::Offer, sdp);
        Ok(Self {
            kind: SignalMessageType::Offer,
            data: Some(serde_json::to_string(&description)?),
            metadata: Some(SignalMetadata {
                tracks,
                no_trickle: true,
            }),
        })
    }

    pub fn answer(sdp: impl Into<String>) -> Result<Self, SignalError> {
        let description = SessionDescription::new(SdpKind::Answer, sdp);
        Ok(Self {
            kind: SignalMessageType::Answer,
            data: Some(serde_json::to_string(&description)?),
            metadata: None,
        })
    }

    /// Parses the session description embedded in `data`.
    pub fn session_description(&self) -> Result<SessionDescription, SignalError> {
        let data = self
            .data
            .as_deref()
            .ok_or(SignalError::MissingData(self.kind))?;
        Ok(serde_json::from_str(data)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(kind: SdpKind, sdp: impl Into<String>) -> Self {
        Self {
            kind,
            sdp: sdp.into(),
        }
    }
}

#[derive(Deserialize)]
pub(crate) struct RawSignalMessage {
    #[serde(rename = "type")]
    kind: i64,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    metadata: Option<SignalMetadata>,
}

impl TryFrom<RawSignalMessage> for SignalMessage {
    type Error = SignalError;

    fn try_from(raw: RawSignalMessage) -> Result<Self, Self::Error> {
        let kind =
            SignalMessageType::from_wire(raw.kind).ok_or(SignalError::UnknownType(raw.kind))?;
        Ok(Self {
            kind,
            data: raw.data,
            metadata: raw.metadata,
        })
    }
}
