use std::time::Duration;

use edge_cloud::CloudError;
use edge_link::TransportError;
use edge_signal::{SignalError, SignalMessageType};
use thiserror::Error;

/// Stage of session establishment, used to label timeouts and failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    Authorize,
    DiscoverEndpoint,
    GatherIce,
    SendOffer,
    AwaitAnswer,
    RegisterTracks,
}

impl SessionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionPhase::Authorize => "authorize",
            SessionPhase::DiscoverEndpoint => "discover_endpoint",
            SessionPhase::GatherIce => "gather_ice",
            SessionPhase::SendOffer => "send_offer",
            SessionPhase::AwaitAnswer => "await_answer",
            SessionPhase::RegisterTracks => "register_tracks",
        }
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The device or the cloud refused our credentials.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("device rejected access token with status {status}")]
    Rejected { status: u16 },
    #[error("authorization request failed: {0}")]
    Transport(#[from] TransportError),
    #[error("token exchange failed: {0}")]
    Cloud(#[from] CloudError),
}

/// The peer deviated from the signaling protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unexpected status {status} from {path}")]
    UnexpectedStatus { path: &'static str, status: u16 },
    #[error("invalid CBOR payload from /webrtc/info: {0}")]
    InfoPayload(#[from] serde_cbor::Error),
    #[error("expected {expected:?} frame, received {received:?}")]
    UnexpectedMessage {
        expected: SignalMessageType,
        received: SignalMessageType,
    },
    #[error("answer frame carries a {0} description")]
    UnexpectedDescription(&'static str),
    #[error(transparent)]
    Signal(#[from] SignalError),
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),
    #[error("media engine error: {0}")]
    Engine(String),
    #[error("local description unavailable after ICE gathering")]
    MissingLocalDescription,
}

/// Everything that can end a session attempt.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("{phase} timed out after {after:?}")]
    Timeout { phase: SessionPhase, after: Duration },
    #[error("session attempt was cancelled")]
    Cancelled,
    #[error("session attempt already started")]
    AlreadyStarted,
}

impl SessionError {
    /// Whether the caller should send the user back to re-authenticate.
    pub fn is_auth(&self) -> bool {
        matches!(self, SessionError::Auth(_))
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            SessionError::Auth(_) => FailureKind::Auth,
            SessionError::Transport(_) => FailureKind::Transport,
            SessionError::Protocol(_) => FailureKind::Protocol,
            SessionError::Media(_) => FailureKind::Media,
            SessionError::Timeout { .. } => FailureKind::Timeout,
            SessionError::Cancelled | SessionError::AlreadyStarted => FailureKind::Cancelled,
        }
    }
}

impl From<SignalError> for SessionError {
    fn from(err: SignalError) -> Self {
        match err {
            SignalError::Io(io) => SessionError::Transport(TransportError::Io(io)),
            other => SessionError::Protocol(ProtocolError::Signal(other)),
        }
    }
}

/// Coarse classification carried by [`crate::SessionState::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Auth,
    Transport,
    Protocol,
    Media,
    Timeout,
    Cancelled,
}
