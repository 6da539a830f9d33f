use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::LinkError;
use crate::identity::DeviceIdentity;
use crate::state::{ConnectionEvent, ConnectionState};
use crate::transport::{DeviceConnection, DeviceConnector};

/// Capability to use (and release one share of) the pooled connection for
/// an identity.
///
/// Clones carry the same generation and therefore the same share: releasing
/// any of them releases it, later releases are no-ops.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    identity: DeviceIdentity,
    generation: u64,
}

impl ConnectionHandle {
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Pools device connections by identity and reference-counts the handles
/// that share them.
///
/// One record exists per identity while at least one handle is live; the
/// record owns the transport connection, the lifecycle state and the
/// subscriber channels. Transitions are published while the record lock is
/// held so every observer sees them in the same order.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn DeviceConnector>,
    records: Mutex<HashMap<DeviceIdentity, Arc<Record>>>,
    next_handle: AtomicU64,
    next_listener: AtomicU64,
}

struct Record {
    identity: DeviceIdentity,
    state: Mutex<RecordState>,
}

struct RecordState {
    handles: HashSet<u64>,
    state: ConnectionState,
    connection: Option<Arc<dyn DeviceConnection>>,
    attempt: u64,
    dial_task: Option<JoinHandle<()>>,
    watch_task: Option<JoinHandle<()>>,
    state_watchers: Vec<mpsc::UnboundedSender<ConnectionState>>,
    listeners: HashMap<u64, mpsc::UnboundedSender<ConnectionEvent>>,
    destroyed: bool,
}

impl Record {
    fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            state: Mutex::new(RecordState {
                handles: HashSet::new(),
                state: ConnectionState::Closed,
                connection: None,
                attempt: 0,
                dial_task: None,
                watch_task: None,
                state_watchers: Vec::new(),
                listeners: HashMap::new(),
                destroyed: false,
            }),
        }
    }
}

impl RecordState {
    fn set_state(&mut self, next: ConnectionState) {
        self.state = next;
        self.state_watchers.retain(|tx| tx.send(next).is_ok());
    }

    fn emit(&self, event: ConnectionEvent) {
        for tx in self.listeners.values() {
            let _ = tx.send(event.clone());
        }
    }

    /// Invalidates the current attempt and detaches the connection. The
    /// caller closes the returned connection once the lock is dropped.
    fn teardown(&mut self) -> Option<Arc<dyn DeviceConnection>> {
        self.attempt += 1;
        if let Some(task) = self.dial_task.take() {
            task.abort();
        }
        if let Some(task) = self.watch_task.take() {
            task.abort();
        }
        let connection = self.connection.take();
        if self.state != ConnectionState::Closed {
            self.set_state(ConnectionState::Closed);
            self.emit(ConnectionEvent::Closed);
        }
        connection
    }
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn DeviceConnector>) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                records: Mutex::new(HashMap::new()),
                next_handle: AtomicU64::new(1),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    /// Returns a new handle for `identity`, creating the shared record on
    /// first use. Nothing is dialed until [`ConnectionManager::connect`].
    pub fn request_connection(&self, identity: DeviceIdentity) -> ConnectionHandle {
        let generation = self.inner.next_handle.fetch_add(1, Ordering::Relaxed);
        let mut records = self.inner.records.lock();
        let record = records
            .entry(identity.clone())
            .or_insert_with(|| {
                debug!(target = "edge_link", device = %identity, "creating connection record");
                Arc::new(Record::new(identity.clone()))
            })
            .clone();
        let mut state = record.state.lock();
        state.handles.insert(generation);
        debug!(
            target = "edge_link",
            device = %identity,
            generation,
            refcount = state.handles.len(),
            "handle issued"
        );
        ConnectionHandle {
            identity,
            generation,
        }
    }

    /// Starts dialing when the record is `Closed`. The record is `Connecting`
    /// by the time this returns; calls made while a dial is in flight or the
    /// connection is up are no-ops.
    pub fn connect(&self, handle: &ConnectionHandle) -> Result<(), LinkError> {
        let connector = self.inner.connector.clone();
        self.with_live(handle, move |record, state| {
            if state.state != ConnectionState::Closed {
                debug!(
                    target = "edge_link",
                    device = %record.identity,
                    state = ?state.state,
                    "connect coalesced"
                );
                return;
            }
            state.attempt += 1;
            let attempt = state.attempt;
            state.set_state(ConnectionState::Connecting);
            info!(target = "edge_link", device = %record.identity, attempt, "dialing device");
            state.dial_task = Some(tokio::spawn(run_dial(connector, record.clone(), attempt)));
        })
    }

    /// Tears the connection down for every handle sharing it. Handles stay
    /// valid and may connect again.
    pub async fn disconnect(&self, handle: &ConnectionHandle) -> Result<(), LinkError> {
        let connection = self.with_live(handle, |record, state| {
            info!(target = "edge_link", device = %record.identity, "disconnecting");
            state.teardown()
        })?;
        if let Some(connection) = connection {
            connection.close().await;
        }
        Ok(())
    }

    /// Disconnects only when `handle` is the sole live handle for its
    /// identity. Returns whether the connection was torn down.
    pub async fn request_disconnect(&self, handle: &ConnectionHandle) -> Result<bool, LinkError> {
        let outcome = self.with_live(handle, |record, state| {
            if state.handles.len() > 1 {
                debug!(
                    target = "edge_link",
                    device = %record.identity,
                    refcount = state.handles.len(),
                    "disconnect declined, connection is shared"
                );
                return None;
            }
            Some(state.teardown())
        })?;
        match outcome {
            Some(connection) => {
                if let Some(connection) = connection {
                    connection.close().await;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Releases the share held by `handle`. The last release closes the
    /// connection and destroys the record, which ends every state stream
    /// and event subscription for it.
    pub async fn release_handle(&self, handle: &ConnectionHandle) {
        let connection = {
            let mut records = self.inner.records.lock();
            let Some(record) = records.get(&handle.identity).cloned() else {
                debug!(
                    target = "edge_link",
                    device = %handle.identity,
                    generation = handle.generation,
                    "release of unknown handle ignored"
                );
                return;
            };
            let mut state = record.state.lock();
            if !state.handles.remove(&handle.generation) {
                debug!(
                    target = "edge_link",
                    device = %handle.identity,
                    generation = handle.generation,
                    "handle already released"
                );
                return;
            }
            if !state.handles.is_empty() {
                debug!(
                    target = "edge_link",
                    device = %handle.identity,
                    refcount = state.handles.len(),
                    "handle released"
                );
                return;
            }
            records.remove(&handle.identity);
            let connection = state.teardown();
            state.destroyed = true;
            state.state_watchers.clear();
            state.listeners.clear();
            info!(target = "edge_link", device = %handle.identity, "last handle released, record destroyed");
            connection
        };
        if let Some(connection) = connection {
            connection.close().await;
        }
    }

    /// Stream of state values: the current one first, then every transition
    /// until the record is destroyed.
    pub fn connection_state(&self, handle: &ConnectionHandle) -> Result<StateStream, LinkError> {
        self.with_live(handle, |_, state| {
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(state.state);
            state.state_watchers.push(tx);
            StateStream { rx }
        })
    }

    pub fn current_state(&self, handle: &ConnectionHandle) -> Result<ConnectionState, LinkError> {
        self.with_live(handle, |_, state| state.state)
    }

    pub fn get_connection(
        &self,
        handle: &ConnectionHandle,
    ) -> Result<Arc<dyn DeviceConnection>, LinkError> {
        self.with_live(handle, |_, state| state.connection.clone())?
            .ok_or_else(|| LinkError::NotConnected(handle.identity.clone()))
    }

    /// Registers for lifecycle events. The registration lasts until the
    /// returned guard is dropped or unsubscribed, across any number of
    /// disconnects and reconnects.
    pub fn subscribe(&self, handle: &ConnectionHandle) -> Result<EventSubscription, LinkError> {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.with_live(handle, |record, state| {
            let (tx, rx) = mpsc::unbounded_channel();
            state.listeners.insert(id, tx);
            EventSubscription {
                id,
                rx,
                record: Arc::downgrade(record),
            }
        })
    }

    /// Connects if needed and resolves once the connection is up, or with
    /// the channel errors of the failed dial.
    pub async fn wait_connected(
        &self,
        handle: &ConnectionHandle,
    ) -> Result<Arc<dyn DeviceConnection>, LinkError> {
        let mut events = self.subscribe(handle)?;
        self.connect(handle)?;
        let mut states = self.connection_state(handle)?;
        while let Some(state) = states.recv().await {
            match state {
                ConnectionState::Connecting => continue,
                ConnectionState::Connected => return self.get_connection(handle),
                ConnectionState::Closed => {
                    while let Ok(event) = events.rx.try_recv() {
                        if let ConnectionEvent::FailedToConnect(errors) = event {
                            return Err(LinkError::ConnectFailed {
                                identity: handle.identity.clone(),
                                errors,
                            });
                        }
                    }
                    return Err(LinkError::Closed(handle.identity.clone()));
                }
            }
        }
        Err(self.released(handle))
    }

    /// Live handle count for `identity`; zero means no record exists.
    pub fn refcount(&self, identity: &DeviceIdentity) -> usize {
        let record = self.inner.records.lock().get(identity).cloned();
        record.map_or(0, |record| record.state.lock().handles.len())
    }

    pub fn is_tracked(&self, identity: &DeviceIdentity) -> bool {
        self.inner.records.lock().contains_key(identity)
    }

    fn with_live<R>(
        &self,
        handle: &ConnectionHandle,
        f: impl FnOnce(&Arc<Record>, &mut RecordState) -> R,
    ) -> Result<R, LinkError> {
        let record = self.inner.records.lock().get(&handle.identity).cloned();
        let Some(record) = record else {
            return Err(self.released(handle));
        };
        let mut state = record.state.lock();
        if state.destroyed || !state.handles.contains(&handle.generation) {
            drop(state);
            return Err(self.released(handle));
        }
        Ok(f(&record, &mut state))
    }

    fn released(&self, handle: &ConnectionHandle) -> LinkError {
        error!(
            target = "edge_link",
            device = %handle.identity,
            generation = handle.generation,
            "operation on released handle"
        );
        LinkError::HandleReleased {
            identity: handle.identity.clone(),
            generation: handle.generation,
        }
    }
}

async fn run_dial(connector: Arc<dyn DeviceConnector>, record: Arc<Record>, attempt: u64) {
    let result = connector.dial(&record.identity).await;
    let stale = {
        let mut state = record.state.lock();
        if state.destroyed || state.attempt != attempt {
            debug!(target = "edge_link", device = %record.identity, attempt, "discarding stale dial result");
            result.ok()
        } else {
            state.dial_task = None;
            match result {
                Ok(connection) => {
                    state.connection = Some(connection.clone());
                    state.set_state(ConnectionState::Connected);
                    state.emit(ConnectionEvent::Connected);
                    info!(target = "edge_link", device = %record.identity, attempt, "device connected");
                    state.watch_task = Some(tokio::spawn(watch_remote(
                        record.clone(),
                        connection,
                        attempt,
                    )));
                }
                Err(err) => {
                    warn!(
                        target = "edge_link",
                        device = %record.identity,
                        attempt,
                        error = %err,
                        "dial failed"
                    );
                    state.set_state(ConnectionState::Closed);
                    state.emit(ConnectionEvent::FailedToConnect(err.channels));
                }
            }
            None
        }
    };
    if let Some(connection) = stale {
        connection.close().await;
    }
}

async fn watch_remote(record: Arc<Record>, connection: Arc<dyn DeviceConnection>, attempt: u64) {
    connection.closed().await;
    let mut state = record.state.lock();
    if state.destroyed || state.attempt != attempt || state.state != ConnectionState::Connected {
        return;
    }
    state.connection = None;
    state.watch_task = None;
    state.set_state(ConnectionState::Closed);
    state.emit(ConnectionEvent::Disconnected);
    warn!(target = "edge_link", device = %record.identity, "device dropped the connection");
}

/// Ordered state values for one subscriber.
pub struct StateStream {
    rx: mpsc::UnboundedReceiver<ConnectionState>,
}

impl StateStream {
    /// Next value, or `None` once the record has been destroyed.
    pub async fn recv(&mut self) -> Option<ConnectionState> {
        self.rx.recv().await
    }
}

impl Stream for StateStream {
    type Item = ConnectionState;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Scoped event registration; dropping it unsubscribes.
pub struct EventSubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    record: Weak<Record>,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ConnectionEvent> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Stream for EventSubscription {
    type Item = ConnectionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(record) = self.record.upgrade() {
            record.state.lock().listeners.remove(&self.id);
        }
    }
}
