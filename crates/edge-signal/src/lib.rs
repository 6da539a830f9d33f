//! Length-prefixed JSON framing for the device signaling stream.
//!
//! Each frame is a `u32` little-endian byte count followed by that many
//! bytes of UTF-8 JSON describing one [`SignalMessage`].

use std::fmt;

use thiserror::Error;

pub mod frame;
pub mod message;

pub use frame::{MAX_FRAME_LEN, decode, encode, read_message, write_message};
pub use message::{
    MetadataTrack, SdpKind, SessionDescription, SignalMessage, SignalMessageType, SignalMetadata,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSection {
    LengthPrefix,
    Payload,
}

impl fmt::Display for FrameSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameSection::LengthPrefix => f.write_str("length prefix"),
            FrameSection::Payload => f.write_str("payload"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("signaling stream io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stream ended inside frame {section}: expected {expected} bytes, got {received}")]
    Truncated {
        section: FrameSection,
        expected: usize,
        received: usize,
    },
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error("{0} unexpected bytes after frame payload")]
    TrailingBytes(usize),
    #[error("unknown signal message type {0}")]
    UnknownType(i64),
    #[error("{0:?} message carries no data")]
    MissingData(SignalMessageType),
    #[error("malformed signal message: {0}")]
    Malformed(#[from] serde_json::Error),
}
