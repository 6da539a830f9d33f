//! WebRTC session establishment over a pooled device connection.
//!
//! The [`SessionOrchestrator`] discovers the device's signaling port,
//! gathers ICE up front, exchanges one offer/answer pair over the signaling
//! stream and then asks the device for its tracks.

pub mod auth;
pub mod config;
pub mod device_api;
pub mod error;
pub mod media;
pub mod orchestrator;
pub mod rtc;

pub use auth::DeviceAuthorizer;
pub use config::SessionConfig;
pub use device_api::{DeviceApi, RtcInfo};
pub use error::{AuthError, FailureKind, MediaError, ProtocolError, SessionError, SessionPhase};
pub use media::{
    MediaEngine, MediaPeer, RemoteTrack, TrackKind, VideoSink, ViewId, ViewRegistry,
};
pub use orchestrator::{SessionOrchestrator, SessionReport, SessionState};
pub use rtc::RtcMediaEngine;
