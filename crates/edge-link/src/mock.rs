//! Scripted transport for tests: a connector whose dials can be held,
//! released or failed, and in-memory devices that answer routed requests and
//! hand stream peers to the test.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::{Semaphore, mpsc, watch};

use crate::error::{DialError, TransportError};
use crate::identity::DeviceIdentity;
use crate::state::ChannelErrors;
use crate::transport::{
    DeviceConnection, DeviceConnector, DeviceRequest, DeviceResponse, DeviceStream, Method,
};

const STREAM_BUFFER: usize = 64 * 1024;

#[derive(Default)]
pub struct MockConnector {
    devices: Mutex<HashMap<DeviceIdentity, Arc<MockDevice>>>,
    failures: Mutex<HashMap<DeviceIdentity, ChannelErrors>>,
    dials: Mutex<HashMap<DeviceIdentity, usize>>,
    total_dials: AtomicUsize,
    gate: Mutex<Option<Arc<Semaphore>>>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The device answering for `identity`, created on first use.
    pub fn device(&self, identity: &DeviceIdentity) -> Arc<MockDevice> {
        self.devices
            .lock()
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(MockDevice::new()))
            .clone()
    }

    /// Makes dials for `identity` fail with `errors` until cleared.
    pub fn fail_device(&self, identity: &DeviceIdentity, errors: ChannelErrors) {
        self.failures.lock().insert(identity.clone(), errors);
    }

    pub fn clear_failure(&self, identity: &DeviceIdentity) {
        self.failures.lock().remove(identity);
    }

    /// Parks every subsequent dial until [`MockConnector::release_dials`].
    pub fn hold_dials(&self) {
        *self.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_dials(&self, count: usize) {
        if let Some(gate) = self.gate.lock().as_ref() {
            gate.add_permits(count);
        }
    }

    pub fn dial_count(&self) -> usize {
        self.total_dials.load(Ordering::SeqCst)
    }

    pub fn dials_for(&self, identity: &DeviceIdentity) -> usize {
        self.dials.lock().get(identity).copied().unwrap_or(0)
    }

    /// Connections handed out so far, oldest first.
    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections.lock().clone()
    }

    pub fn last_connection(&self) -> Option<Arc<MockConnection>> {
        self.connections.lock().last().cloned()
    }
}

#[async_trait]
impl DeviceConnector for MockConnector {
    async fn dial(
        &self,
        identity: &DeviceIdentity,
    ) -> Result<Arc<dyn DeviceConnection>, DialError> {
        self.total_dials.fetch_add(1, Ordering::SeqCst);
        *self.dials.lock().entry(identity.clone()).or_default() += 1;

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            let permit = gate
                .acquire_owned()
                .await
                .map_err(|_| DialError::new("dial gate closed", ChannelErrors::default()))?;
            permit.forget();
        }

        if let Some(errors) = self.failures.lock().get(identity).cloned() {
            return Err(DialError::new("scripted failure", errors));
        }

        let connection = Arc::new(MockConnection::new(self.device(identity)));
        self.connections.lock().push(connection.clone());
        Ok(connection)
    }
}

/// In-memory device: routed request responses plus a queue of stream peers.
pub struct MockDevice {
    fingerprint: Mutex<Option<String>>,
    password: Mutex<Option<String>>,
    authenticated: Mutex<Vec<String>>,
    routes: Mutex<HashMap<(Method, String), DeviceResponse>>,
    queued: Mutex<HashMap<(Method, String), VecDeque<DeviceResponse>>>,
    requests: Mutex<Vec<DeviceRequest>>,
    streams_tx: mpsc::UnboundedSender<(u32, DuplexStream)>,
    streams_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(u32, DuplexStream)>>,
}

impl MockDevice {
    fn new() -> Self {
        let (streams_tx, streams_rx) = mpsc::unbounded_channel();
        Self {
            fingerprint: Mutex::new(None),
            password: Mutex::new(None),
            authenticated: Mutex::new(Vec::new()),
            routes: Mutex::new(HashMap::new()),
            queued: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            streams_tx,
            streams_rx: tokio::sync::Mutex::new(streams_rx),
        }
    }

    pub fn set_fingerprint(&self, fingerprint: impl Into<String>) {
        *self.fingerprint.lock() = Some(fingerprint.into());
    }

    /// Answers `method path` with `response`. Unrouted requests get 404.
    pub fn respond(&self, method: Method, path: impl Into<String>, response: DeviceResponse) {
        self.routes.lock().insert((method, path.into()), response);
    }

    /// Answers the next `method path` with `response`, ahead of the route
    /// set by [`MockDevice::respond`]. Queued answers are used in order.
    pub fn respond_once(&self, method: Method, path: impl Into<String>, response: DeviceResponse) {
        self.queued
            .lock()
            .entry((method, path.into()))
            .or_default()
            .push_back(response);
    }

    pub fn set_password(&self, password: impl Into<String>) {
        *self.password.lock() = Some(password.into());
    }

    /// Usernames that passed password authentication, in order.
    pub fn authenticated(&self) -> Vec<String> {
        self.authenticated.lock().clone()
    }

    pub fn requests(&self) -> Vec<DeviceRequest> {
        self.requests.lock().clone()
    }

    /// Device end of the next stream opened by a client.
    pub async fn accept_stream(&self) -> Option<(u32, DuplexStream)> {
        self.streams_rx.lock().await.recv().await
    }

    fn handle(&self, request: DeviceRequest) -> DeviceResponse {
        let key = (request.method, request.path.clone());
        self.requests.lock().push(request);
        if let Some(response) = self
            .queued
            .lock()
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
        {
            return response;
        }
        self.routes
            .lock()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| DeviceResponse::new(404))
    }
}

pub struct MockConnection {
    device: Arc<MockDevice>,
    closed: watch::Sender<bool>,
}

impl MockConnection {
    pub fn new(device: Arc<MockDevice>) -> Self {
        let (closed, _) = watch::channel(false);
        Self { device, closed }
    }

    pub fn device(&self) -> &Arc<MockDevice> {
        &self.device
    }

    /// Simulates the device dropping the connection.
    pub fn drop_remote(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl DeviceConnection for MockConnection {
    fn device_fingerprint(&self) -> Option<String> {
        self.device.fingerprint.lock().clone()
    }

    async fn request(&self, request: DeviceRequest) -> Result<DeviceResponse, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(self.device.handle(request))
    }

    async fn open_stream(&self, port: u32) -> Result<DeviceStream, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let (client, device) = tokio::io::duplex(STREAM_BUFFER);
        self.device
            .streams_tx
            .send((port, device))
            .map_err(|_| TransportError::Stream {
                port,
                reason: "device stopped accepting streams".into(),
            })?;
        Ok(Box::new(client))
    }

    async fn password_authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.device.password.lock().as_deref() != Some(password) {
            return Err(TransportError::PasswordRejected);
        }
        self.device.authenticated.lock().push(username.to_string());
        Ok(())
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn close(&self) {
        self.closed.send_replace(true);
    }
}
