use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use edge_link::{DeviceConnection, DeviceStream};
use edge_signal::{
    SdpKind, SessionDescription, SignalMessage, SignalMessageType, read_message, write_message,
};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::device_api::{DeviceApi, RtcInfo};
use crate::error::{FailureKind, ProtocolError, SessionError, SessionPhase};
use crate::media::{MediaEngine, MediaPeer, TrackKind, ViewId, ViewRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    DiscoveringEndpoint,
    GatheringIce,
    OfferSent,
    AwaitingAnswer,
    Established,
    Failed(FailureKind),
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Established | SessionState::Failed(_))
    }
}

/// Outcome of a successful attempt.
#[derive(Debug)]
pub struct SessionReport {
    pub rtc_info: RtcInfo,
    pub local: SessionDescription,
    pub remote: SessionDescription,
    /// `/webrtc/tracks` outcome. A failure here leaves media running.
    pub track_registration: Result<(), SessionError>,
}

/// Brings up one media session over an open device connection.
///
/// An instance is a single attempt: [`SessionOrchestrator::start`] runs at
/// most once, and [`SessionOrchestrator::stop`] ends the attempt from any
/// state, including before it started.
pub struct SessionOrchestrator {
    api: DeviceApi,
    engine: Arc<dyn MediaEngine>,
    config: SessionConfig,
    view: Option<(ViewRegistry, ViewId)>,
    state_tx: watch::Sender<SessionState>,
    cancel_tx: watch::Sender<bool>,
    started: AtomicBool,
    peer: Mutex<Option<Arc<dyn MediaPeer>>>,
    signaling: AsyncMutex<Option<DeviceStream>>,
    track_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionOrchestrator {
    pub fn new(
        connection: Arc<dyn DeviceConnection>,
        engine: Arc<dyn MediaEngine>,
        config: SessionConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let (cancel_tx, _) = watch::channel(false);
        Self {
            api: DeviceApi::new(connection),
            engine,
            config,
            view: None,
            state_tx,
            cancel_tx,
            started: AtomicBool::new(false),
            peer: Mutex::new(None),
            signaling: AsyncMutex::new(None),
            track_task: Mutex::new(None),
        }
    }

    /// Remote video tracks are attached to `view` while it is alive.
    pub fn with_view(mut self, registry: ViewRegistry, view: ViewId) -> Self {
        self.view = Some((registry, view));
        self
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub async fn start(&self) -> Result<SessionReport, SessionError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyStarted);
        }
        let mut cancel = self.cancel_tx.subscribe();
        let outcome = tokio::select! {
            biased;
            _ = cancel.wait_for(|stopped| *stopped) => Err(SessionError::Cancelled),
            result = self.establish() => result,
        };
        let (rtc_info, local, remote) = match outcome {
            Ok(established) => established,
            Err(err) => {
                warn!(
                    target = "edge_session",
                    state = ?self.state(),
                    error = %err,
                    "session attempt failed"
                );
                if !self.state().is_terminal() {
                    self.set_state(SessionState::Failed(err.kind()));
                }
                self.teardown().await;
                return Err(err);
            }
        };

        // Established is terminal: a stop from here on only cancels the
        // track request.
        let track_registration = tokio::select! {
            biased;
            _ = cancel.wait_for(|stopped| *stopped) => Err(SessionError::Cancelled),
            result = self.api.register_tracks(&self.config.requested_tracks) => result,
        };
        if let Err(err) = &track_registration {
            warn!(target = "edge_session", error = %err, "track registration failed");
        }

        Ok(SessionReport {
            rtc_info,
            local,
            remote,
            track_registration,
        })
    }

    /// Closes the peer and the signaling stream and cancels a running
    /// `start`. Safe to call repeatedly and before `start`.
    pub async fn stop(&self) {
        self.cancel_tx.send_replace(true);
        self.teardown().await;
        debug!(target = "edge_session", "session stopped");
    }

    async fn establish(
        &self,
    ) -> Result<(RtcInfo, SessionDescription, SessionDescription), SessionError> {
        if let Some(token) = self.config.access_token.as_deref() {
            bounded(
                SessionPhase::Authorize,
                self.config.discovery_timeout,
                self.api.authorize(token),
            )
            .await?;
        }

        self.set_state(SessionState::DiscoveringEndpoint);
        let (rtc_info, mut stream) = bounded(
            SessionPhase::DiscoverEndpoint,
            self.config.discovery_timeout,
            async {
                let info = self.api.rtc_info().await?;
                let stream = self
                    .api
                    .connection()
                    .open_stream(info.signaling_stream_port)
                    .await?;
                Ok::<_, SessionError>((info, stream))
            },
        )
        .await?;

        self.set_state(SessionState::GatheringIce);
        let peer = self.engine.create_peer(&self.config).await?;
        *self.peer.lock() = Some(peer.clone());
        peer.create_offer().await?;
        let local = peer.gathering_complete().await?;

        let offer = SignalMessage::offer(local.sdp.clone(), self.config.offer_tracks.clone())?;
        write_message(&mut stream, &offer).await?;
        self.set_state(SessionState::OfferSent);

        self.set_state(SessionState::AwaitingAnswer);
        let reply = bounded(
            SessionPhase::AwaitAnswer,
            self.config.answer_timeout,
            read_message(&mut stream),
        )
        .await?;
        if reply.kind != SignalMessageType::Answer {
            return Err(ProtocolError::UnexpectedMessage {
                expected: SignalMessageType::Answer,
                received: reply.kind,
            }
            .into());
        }
        let remote = reply.session_description()?;
        if remote.kind != SdpKind::Answer {
            return Err(ProtocolError::UnexpectedDescription("offer").into());
        }
        peer.apply_answer(remote.clone()).await?;

        *self.signaling.lock().await = Some(stream);
        self.attach_remote_tracks(peer.as_ref());
        self.set_state(SessionState::Established);
        info!(
            target = "edge_session",
            signaling_port = rtc_info.signaling_stream_port,
            "session established"
        );

        Ok((rtc_info, local, remote))
    }

    fn attach_remote_tracks(&self, peer: &dyn MediaPeer) {
        let Some((registry, view)) = self.view.clone() else {
            return;
        };
        let Some(mut tracks) = peer.take_remote_tracks() else {
            return;
        };
        let task = tokio::spawn(async move {
            while let Some(track) = tracks.recv().await {
                if track.kind == TrackKind::Video {
                    registry.attach(view, track);
                }
            }
        });
        *self.track_task.lock() = Some(task);
    }

    async fn teardown(&self) {
        let task = self.track_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        let peer = self.peer.lock().take();
        if let Some(peer) = peer {
            if let Err(err) = peer.close().await {
                warn!(target = "edge_session", error = %err, "failed to close peer");
            }
        }
        let stream = self.signaling.lock().await.take();
        if let Some(mut stream) = stream {
            let _ = stream.shutdown().await;
        }
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state_tx.send_replace(next);
        debug!(target = "edge_session", from = ?previous, to = ?next, "session state");
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        if let Some(task) = self.track_task.get_mut().take() {
            task.abort();
        }
        if let Some(peer) = self.peer.get_mut().take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = peer.close().await;
                });
            }
        }
    }
}

async fn bounded<T, E, F>(phase: SessionPhase, limit: Duration, fut: F) -> Result<T, SessionError>
where
    F: Future<Output = Result<T, E>>,
    SessionError: From<E>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(SessionError::from),
        Err(_) => Err(SessionError::Timeout {
            phase,
            after: limit,
        }),
    }
}
