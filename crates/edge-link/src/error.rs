use thiserror::Error;

use crate::identity::DeviceIdentity;
use crate::state::ChannelErrors;

#[derive(Debug, Error)]
pub enum LinkError {
    /// The handle was released (or its record destroyed). Using it again is a
    /// bug in the caller, not a runtime condition to retry.
    #[error("handle #{generation} for {identity} was already released")]
    HandleReleased {
        identity: DeviceIdentity,
        generation: u64,
    },
    #[error("no open connection to {0}")]
    NotConnected(DeviceIdentity),
    #[error("failed to connect to {identity}: {errors}")]
    ConnectFailed {
        identity: DeviceIdentity,
        errors: ChannelErrors,
    },
    #[error("connection to {0} closed before it was established")]
    Closed(DeviceIdentity),
}

/// Failure reported by a [`crate::DeviceConnector`] while dialing.
#[derive(Debug, Clone, Error)]
#[error("dial failed: {message} ({channels})")]
pub struct DialError {
    pub message: String,
    pub channels: ChannelErrors,
}

impl DialError {
    pub fn new(message: impl Into<String>, channels: ChannelErrors) -> Self {
        Self {
            message: message.into(),
            channels,
        }
    }
}

/// Errors from requests and streams on an open device connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("device request {method} {path} failed: {reason}")]
    Request {
        method: &'static str,
        path: String,
        reason: String,
    },
    #[error("failed to open stream on port {port}: {reason}")]
    Stream { port: u32, reason: String },
    #[error("device connection closed")]
    Closed,
    #[error("device rejected the password")]
    PasswordRejected,
    #[error("{0} is not supported by this transport")]
    Unsupported(&'static str),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
