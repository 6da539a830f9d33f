//! Media engine seam and the non-owning registry of video views.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use edge_signal::SessionDescription;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;
use webrtc::track::track_remote::TrackRemote;

use crate::config::SessionConfig;
use crate::error::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Video,
    Audio,
}

/// A track the remote peer started sending.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    /// Engine handle for reading RTP, absent for engines without one.
    pub track: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            track: None,
        }
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("has_engine_track", &self.track.is_some())
            .finish()
    }
}

/// Creates peers. Injected into the orchestrator, never looked up globally.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_peer(&self, config: &SessionConfig) -> Result<Arc<dyn MediaPeer>, MediaError>;
}

/// One peer connection, driven offer-first with ICE gathered up front.
#[async_trait]
pub trait MediaPeer: Send + Sync {
    /// Creates the local offer, applies it and starts ICE gathering.
    async fn create_offer(&self) -> Result<(), MediaError>;

    /// Resolves once gathering finished, with candidates embedded in the SDP.
    async fn gathering_complete(&self) -> Result<SessionDescription, MediaError>;

    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), MediaError>;

    /// Incoming tracks. Yields the receiver once; later calls get `None`.
    fn take_remote_tracks(&self) -> Option<mpsc::UnboundedReceiver<RemoteTrack>>;

    async fn close(&self) -> Result<(), MediaError>;
}

/// Something able to render video, typically owned by the UI layer.
pub trait VideoSink: Send + Sync {
    fn attach(&self, track: RemoteTrack);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewId(pub u64);

/// Maps view ids to weakly held sinks so sessions never keep a view alive.
#[derive(Clone, Default)]
pub struct ViewRegistry {
    views: Arc<RwLock<HashMap<ViewId, Weak<dyn VideoSink>>>>,
    next_id: Arc<AtomicU64>,
}

impl ViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S>(&self, sink: &Arc<S>) -> ViewId
    where
        S: VideoSink + 'static,
    {
        let id = ViewId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let weak = Arc::downgrade(sink);
        let weak: Weak<dyn VideoSink> = weak;
        self.views.write().insert(id, weak);
        id
    }

    pub fn unregister(&self, id: ViewId) {
        self.views.write().remove(&id);
    }

    pub fn resolve(&self, id: ViewId) -> Option<Arc<dyn VideoSink>> {
        let sink = self.views.read().get(&id).and_then(Weak::upgrade);
        if sink.is_none() {
            self.views.write().remove(&id);
        }
        sink
    }

    /// Hands `track` to the view if it still exists. Returns whether it did.
    pub fn attach(&self, id: ViewId, track: RemoteTrack) -> bool {
        match self.resolve(id) {
            Some(sink) => {
                debug!(target = "edge_session", view = id.0, track = %track.id, "attaching track");
                sink.attach(track);
                true
            }
            None => {
                debug!(target = "edge_session", view = id.0, "view gone, track not attached");
                false
            }
        }
    }
}
