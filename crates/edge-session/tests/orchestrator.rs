use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use edge_link::mock::{MockConnection, MockConnector, MockDevice};
use edge_link::{
    ConnectionManager, DeviceConnection, DeviceIdentity, DeviceRequest, DeviceResponse,
    DeviceStream, Method, TransportError, content_format, status,
};
use edge_session::device_api::{INFO_PATH, OAUTH_PATH, TRACKS_PATH};
use edge_session::{
    FailureKind, MediaEngine, MediaError, MediaPeer, ProtocolError, RemoteTrack, RtcInfo,
    SessionConfig, SessionError, SessionOrchestrator, SessionPhase, SessionState, TrackKind,
    VideoSink, ViewRegistry,
};
use edge_signal::{
    SdpKind, SessionDescription, SignalMessage, SignalMessageType, read_message, write_message,
};
use parking_lot::Mutex;
use test_timeout::tokio_timeout_test;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{Notify, mpsc};

const SIGNALING_PORT: u32 = 655;
const OFFER_SDP: &str = "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\na=candidate:host\r\n";
const ANSWER_SDP: &str = "v=0\r\no=- 2 2 IN IP4 0.0.0.0\r\n";

struct ScriptedPeer {
    offers: AtomicUsize,
    answers: Mutex<Vec<SessionDescription>>,
    closed: AtomicBool,
    tracks_tx: mpsc::UnboundedSender<RemoteTrack>,
    tracks_rx: Mutex<Option<mpsc::UnboundedReceiver<RemoteTrack>>>,
}

impl ScriptedPeer {
    fn new() -> Self {
        let (tracks_tx, tracks_rx) = mpsc::unbounded_channel();
        Self {
            offers: AtomicUsize::new(0),
            answers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            tracks_tx,
            tracks_rx: Mutex::new(Some(tracks_rx)),
        }
    }
}

#[async_trait]
impl MediaPeer for ScriptedPeer {
    async fn create_offer(&self) -> Result<(), MediaError> {
        self.offers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn gathering_complete(&self) -> Result<SessionDescription, MediaError> {
        Ok(SessionDescription::new(SdpKind::Offer, OFFER_SDP))
    }

    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), MediaError> {
        self.answers.lock().push(answer);
        Ok(())
    }

    fn take_remote_tracks(&self) -> Option<mpsc::UnboundedReceiver<RemoteTrack>> {
        self.tracks_rx.lock().take()
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct ScriptedEngine {
    peers: Mutex<Vec<Arc<ScriptedPeer>>>,
}

impl ScriptedEngine {
    fn peer(&self) -> Option<Arc<ScriptedPeer>> {
        self.peers.lock().first().cloned()
    }

    fn created(&self) -> usize {
        self.peers.lock().len()
    }
}

#[async_trait]
impl MediaEngine for ScriptedEngine {
    async fn create_peer(&self, _config: &SessionConfig) -> Result<Arc<dyn MediaPeer>, MediaError> {
        let peer = Arc::new(ScriptedPeer::new());
        self.peers.lock().push(peer.clone());
        Ok(peer)
    }
}

struct Fixture {
    device: Arc<MockDevice>,
    connection: Arc<dyn DeviceConnection>,
    engine: Arc<ScriptedEngine>,
}

impl Fixture {
    fn new() -> Self {
        let connector = MockConnector::new();
        let device = connector.device(&DeviceIdentity::new("pr-1", "de-1"));
        serve_rtc_info(&device);
        device.respond(
            Method::Post,
            TRACKS_PATH,
            DeviceResponse::new(status::CREATED),
        );
        Self {
            connection: Arc::new(MockConnection::new(device.clone())),
            device,
            engine: Arc::new(ScriptedEngine::default()),
        }
    }

    fn orchestrator(&self, config: SessionConfig) -> SessionOrchestrator {
        SessionOrchestrator::new(self.connection.clone(), self.engine.clone(), config)
    }
}

fn serve_rtc_info(device: &MockDevice) {
    let info = RtcInfo {
        file_stream_port: 1000,
        signaling_stream_port: SIGNALING_PORT,
    };
    device.respond(
        Method::Get,
        INFO_PATH,
        DeviceResponse::new(status::CONTENT)
            .with_payload(content_format::CBOR, serde_cbor::to_vec(&info).unwrap()),
    );
}

fn quick_config() -> SessionConfig {
    SessionConfig::default()
        .with_discovery_timeout(Duration::from_secs(2))
        .with_answer_timeout(Duration::from_secs(2))
}

/// Reads the offer off the signaling stream and replies with `reply`.
async fn answer_with(device: Arc<MockDevice>, reply: SignalMessage) -> (SignalMessage, DuplexStream) {
    let (port, mut stream) = device.accept_stream().await.unwrap();
    assert_eq!(port, SIGNALING_PORT);
    let offer = read_message(&mut stream).await.unwrap();
    write_message(&mut stream, &reply).await.unwrap();
    (offer, stream)
}

#[tokio_timeout_test(secs = 10, trace)]
async fn establishes_session_over_pooled_connection() {
    let connector = MockConnector::new();
    let manager = ConnectionManager::new(connector.clone());
    let identity = DeviceIdentity::new("pr-1", "de-1");
    let device = connector.device(&identity);
    serve_rtc_info(&device);
    device.respond(
        Method::Post,
        TRACKS_PATH,
        DeviceResponse::new(status::CREATED),
    );

    let handle = manager.request_connection(identity);
    let connection = manager.wait_connected(&handle).await.unwrap();
    let engine = Arc::new(ScriptedEngine::default());
    let orchestrator = SessionOrchestrator::new(connection, engine.clone(), quick_config());

    let script = tokio::spawn(answer_with(
        device.clone(),
        SignalMessage::answer(ANSWER_SDP).unwrap(),
    ));
    let report = orchestrator.start().await.unwrap();
    let (offer, _stream) = script.await.unwrap();

    assert_eq!(orchestrator.state(), SessionState::Established);
    assert_eq!(report.rtc_info.signaling_stream_port, SIGNALING_PORT);
    assert_eq!(report.remote.sdp, ANSWER_SDP);
    assert!(report.track_registration.is_ok());

    assert_eq!(offer.kind, SignalMessageType::Offer);
    let metadata = offer.metadata.clone().unwrap();
    assert!(metadata.no_trickle);
    assert_eq!(metadata.tracks[0].mid, "0");
    assert_eq!(metadata.tracks[0].track_id, "frontdoor-video");
    let sent = offer.session_description().unwrap();
    assert_eq!(sent.kind, SdpKind::Offer);
    assert_eq!(sent.sdp, OFFER_SDP);

    let peer = engine.peer().unwrap();
    assert_eq!(peer.answers.lock().len(), 1);
    assert_eq!(peer.answers.lock()[0].sdp, ANSWER_SDP);

    let paths: Vec<_> = device.requests().into_iter().map(|r| r.path).collect();
    assert_eq!(paths, vec![INFO_PATH.to_string(), TRACKS_PATH.to_string()]);

    orchestrator.stop().await;
    assert!(peer.closed.load(Ordering::SeqCst));
    manager.release_handle(&handle).await;
}

#[tokio_timeout_test(secs = 10)]
async fn info_failure_never_creates_an_offer() {
    let fixture = Fixture::new();
    fixture
        .device
        .respond(Method::Get, INFO_PATH, DeviceResponse::new(404));
    let orchestrator = fixture.orchestrator(quick_config());

    let err = orchestrator.start().await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Protocol(ProtocolError::UnexpectedStatus { status: 404, .. })
    ));
    assert_eq!(fixture.engine.created(), 0);
    assert_eq!(
        orchestrator.state(),
        SessionState::Failed(FailureKind::Protocol)
    );
}

#[tokio_timeout_test(secs = 10)]
async fn wrong_reply_type_fails_without_applying_answer() {
    let fixture = Fixture::new();
    let orchestrator = fixture.orchestrator(quick_config());
    let mut reply = SignalMessage::new(SignalMessageType::IceCandidate);
    reply.data = Some("candidate:1 1 udp 1 10.0.0.1 5000 typ host".into());
    let script = tokio::spawn(answer_with(fixture.device.clone(), reply));

    let err = orchestrator.start().await.unwrap_err();
    let _ = script.await.unwrap();

    assert!(matches!(
        err,
        SessionError::Protocol(ProtocolError::UnexpectedMessage {
            expected: SignalMessageType::Answer,
            received: SignalMessageType::IceCandidate,
        })
    ));
    let peer = fixture.engine.peer().unwrap();
    assert_eq!(peer.offers.load(Ordering::SeqCst), 1);
    assert!(peer.answers.lock().is_empty());
    assert!(peer.closed.load(Ordering::SeqCst));
    assert_eq!(
        orchestrator.state(),
        SessionState::Failed(FailureKind::Protocol)
    );
}

#[tokio_timeout_test(secs = 10)]
async fn truncated_answer_is_a_protocol_error() {
    let fixture = Fixture::new();
    let orchestrator = fixture.orchestrator(quick_config());
    let device = fixture.device.clone();
    let script = tokio::spawn(async move {
        let (_, mut stream) = device.accept_stream().await.unwrap();
        read_message(&mut stream).await.unwrap();
        stream.write_all(&64u32.to_le_bytes()).await.unwrap();
        stream.write_all(br#"{"type":1,"#).await.unwrap();
    });

    let err = orchestrator.start().await.unwrap_err();
    script.await.unwrap();
    assert!(matches!(err, SessionError::Protocol(ProtocolError::Signal(_))));
    assert!(fixture.engine.peer().unwrap().answers.lock().is_empty());
}

#[tokio_timeout_test(secs = 10)]
async fn silent_device_times_out_awaiting_answer() {
    let fixture = Fixture::new();
    let orchestrator =
        fixture.orchestrator(quick_config().with_answer_timeout(Duration::from_millis(100)));
    let device = fixture.device.clone();
    let script = tokio::spawn(async move {
        let (_, mut stream) = device.accept_stream().await.unwrap();
        read_message(&mut stream).await.unwrap();
        stream
    });

    let err = orchestrator.start().await.unwrap_err();
    let _stream = script.await.unwrap();
    assert!(matches!(
        err,
        SessionError::Timeout {
            phase: SessionPhase::AwaitAnswer,
            ..
        }
    ));
    assert_eq!(
        orchestrator.state(),
        SessionState::Failed(FailureKind::Timeout)
    );
}

#[tokio_timeout_test(secs = 10)]
async fn rejected_token_fails_before_media() {
    let fixture = Fixture::new();
    fixture
        .device
        .respond(Method::Post, OAUTH_PATH, DeviceResponse::new(403));
    let orchestrator = fixture.orchestrator(quick_config().with_access_token("expired"));

    let err = orchestrator.start().await.unwrap_err();
    assert!(err.is_auth());
    assert_eq!(fixture.engine.created(), 0);
    assert_eq!(fixture.device.requests().len(), 1);
    assert_eq!(orchestrator.state(), SessionState::Failed(FailureKind::Auth));
}

#[tokio_timeout_test(secs = 10)]
async fn accepted_token_precedes_discovery() {
    let fixture = Fixture::new();
    fixture.device.respond(
        Method::Post,
        OAUTH_PATH,
        DeviceResponse::new(status::CREATED),
    );
    let orchestrator = fixture.orchestrator(quick_config().with_access_token("fresh"));
    let script = tokio::spawn(answer_with(
        fixture.device.clone(),
        SignalMessage::answer(ANSWER_SDP).unwrap(),
    ));

    orchestrator.start().await.unwrap();
    let _ = script.await.unwrap();
    let paths: Vec<_> = fixture
        .device
        .requests()
        .into_iter()
        .map(|r| r.path)
        .collect();
    assert_eq!(paths[0], OAUTH_PATH);
    assert_eq!(paths[1], INFO_PATH);
}

#[tokio_timeout_test(secs = 10)]
async fn track_registration_failure_keeps_media_up() {
    let fixture = Fixture::new();
    fixture
        .device
        .respond(Method::Post, TRACKS_PATH, DeviceResponse::new(500));
    let orchestrator = fixture.orchestrator(quick_config());
    let script = tokio::spawn(answer_with(
        fixture.device.clone(),
        SignalMessage::answer(ANSWER_SDP).unwrap(),
    ));

    let report = orchestrator.start().await.unwrap();
    let _ = script.await.unwrap();
    assert!(matches!(
        report.track_registration,
        Err(SessionError::Protocol(ProtocolError::UnexpectedStatus { status: 500, .. }))
    ));
    assert_eq!(orchestrator.state(), SessionState::Established);
    assert!(!fixture.engine.peer().unwrap().closed.load(Ordering::SeqCst));
}

#[tokio_timeout_test(secs = 10)]
async fn start_runs_once() {
    let fixture = Fixture::new();
    let orchestrator = fixture.orchestrator(quick_config());
    let script = tokio::spawn(answer_with(
        fixture.device.clone(),
        SignalMessage::answer(ANSWER_SDP).unwrap(),
    ));
    orchestrator.start().await.unwrap();
    let _ = script.await.unwrap();

    assert!(matches!(
        orchestrator.start().await,
        Err(SessionError::AlreadyStarted)
    ));
    assert_eq!(fixture.engine.created(), 1);
}

#[tokio_timeout_test(secs = 10, flavor = "multi_thread")]
async fn stop_cancels_pending_answer_and_closes_stream() {
    let fixture = Fixture::new();
    let orchestrator = Arc::new(fixture.orchestrator(quick_config()));
    let device = fixture.device.clone();
    let script = tokio::spawn(async move {
        let (_, mut stream) = device.accept_stream().await.unwrap();
        read_message(&mut stream).await.unwrap();
        let mut buf = [0u8; 1];
        stream.read(&mut buf).await.unwrap()
    });

    let mut states = orchestrator.subscribe_state();
    let starter = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.start().await }
    });
    states
        .wait_for(|state| *state == SessionState::AwaitingAnswer)
        .await
        .unwrap();

    orchestrator.stop().await;
    orchestrator.stop().await;

    assert!(matches!(
        starter.await.unwrap(),
        Err(SessionError::Cancelled)
    ));
    assert_eq!(script.await.unwrap(), 0, "signaling stream should be closed");
    assert!(fixture.engine.peer().unwrap().closed.load(Ordering::SeqCst));
    assert_eq!(
        orchestrator.state(),
        SessionState::Failed(FailureKind::Cancelled)
    );
}

#[tokio_timeout_test(secs = 10)]
async fn stop_before_start_is_harmless() {
    let fixture = Fixture::new();
    let orchestrator = fixture.orchestrator(quick_config());
    orchestrator.stop().await;

    assert!(matches!(
        orchestrator.start().await,
        Err(SessionError::Cancelled)
    ));
    assert!(fixture.device.requests().is_empty());
    assert_eq!(fixture.engine.created(), 0);
}

#[derive(Default)]
struct RecordingView {
    tracks: Mutex<Vec<String>>,
}

impl VideoSink for RecordingView {
    fn attach(&self, track: RemoteTrack) {
        self.tracks.lock().push(track.id);
    }
}

#[tokio_timeout_test(secs = 10)]
async fn remote_video_reaches_registered_view() {
    let fixture = Fixture::new();
    let registry = ViewRegistry::new();
    let view = Arc::new(RecordingView::default());
    let view_id = registry.register(&view);
    let orchestrator = fixture
        .orchestrator(quick_config())
        .with_view(registry, view_id);
    let script = tokio::spawn(answer_with(
        fixture.device.clone(),
        SignalMessage::answer(ANSWER_SDP).unwrap(),
    ));
    orchestrator.start().await.unwrap();
    let _ = script.await.unwrap();

    let peer = fixture.engine.peer().unwrap();
    peer.tracks_tx
        .send(RemoteTrack::new("frontdoor-audio", TrackKind::Audio))
        .unwrap();
    peer.tracks_tx
        .send(RemoteTrack::new("frontdoor-video", TrackKind::Video))
        .unwrap();

    for _ in 0..100 {
        if !view.tracks.lock().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(view.tracks.lock().as_slice(), ["frontdoor-video".to_string()]);
}

/// Device connection whose `/webrtc/tracks` call never completes.
struct StalledTracks {
    inner: MockConnection,
    entered: Notify,
}

#[async_trait]
impl DeviceConnection for StalledTracks {
    fn device_fingerprint(&self) -> Option<String> {
        self.inner.device_fingerprint()
    }

    async fn request(&self, request: DeviceRequest) -> Result<DeviceResponse, TransportError> {
        if request.path == TRACKS_PATH {
            self.entered.notify_one();
            std::future::pending::<()>().await;
        }
        self.inner.request(request).await
    }

    async fn open_stream(&self, port: u32) -> Result<DeviceStream, TransportError> {
        self.inner.open_stream(port).await
    }

    async fn closed(&self) {
        self.inner.closed().await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

#[tokio_timeout_test(secs = 10, flavor = "multi_thread")]
async fn stop_during_track_registration_keeps_established_session() {
    let fixture = Fixture::new();
    let connection = Arc::new(StalledTracks {
        inner: MockConnection::new(fixture.device.clone()),
        entered: Notify::new(),
    });
    let orchestrator = Arc::new(SessionOrchestrator::new(
        connection.clone(),
        fixture.engine.clone(),
        quick_config(),
    ));
    let script = tokio::spawn(answer_with(
        fixture.device.clone(),
        SignalMessage::answer(ANSWER_SDP).unwrap(),
    ));
    let starter = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.start().await }
    });

    connection.entered.notified().await;
    assert_eq!(orchestrator.state(), SessionState::Established);
    orchestrator.stop().await;

    let report = starter.await.unwrap().unwrap();
    let _ = script.await.unwrap();
    assert!(matches!(
        report.track_registration,
        Err(SessionError::Cancelled)
    ));
    assert_eq!(report.remote.sdp, ANSWER_SDP);
    assert_eq!(orchestrator.state(), SessionState::Established);
    assert!(fixture.engine.peer().unwrap().closed.load(Ordering::SeqCst));
}
