//! Tracks the reachability of every device registered to the account.
//!
//! Each bookmark holds one [`ConnectionHandle`] in the shared
//! [`ConnectionManager`] and a follower task that turns the connection's
//! state stream into a [`BookmarkStatus`].

use std::sync::Arc;

use edge_cloud::CloudDevice;
use edge_link::{ConnectionHandle, ConnectionManager, ConnectionState, DeviceIdentity};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BookmarkStatus {
    Online,
    Connecting,
    Offline,
    /// Connected, but the device presented a different fingerprint than
    /// the one recorded with the bookmark.
    WrongFingerprint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bookmark {
    pub device: CloudDevice,
    pub status: BookmarkStatus,
}

struct Entry {
    identity: DeviceIdentity,
    device: CloudDevice,
    handle: ConnectionHandle,
    status: BookmarkStatus,
    follower: JoinHandle<()>,
}

struct Shared {
    manager: ConnectionManager,
    entries: Mutex<Vec<Entry>>,
    snapshot: watch::Sender<Vec<Bookmark>>,
}

impl Shared {
    fn publish(&self, entries: &[Entry]) {
        let bookmarks = entries
            .iter()
            .map(|entry| Bookmark {
                device: entry.device.clone(),
                status: entry.status,
            })
            .collect();
        self.snapshot.send_replace(bookmarks);
    }

    fn set_status(&self, handle: &ConnectionHandle, status: BookmarkStatus) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.iter_mut().find(|entry| &entry.handle == handle) else {
            return;
        };
        if entry.status == status {
            return;
        }
        debug!(
            target = "edge_monitor",
            device = %entry.identity,
            ?status,
            "bookmark status changed"
        );
        entry.status = status;
        self.publish(&entries);
    }
}

/// Keeps one pooled connection per bookmarked device.
pub struct BookmarkMonitor {
    shared: Arc<Shared>,
}

impl BookmarkMonitor {
    pub fn new(manager: ConnectionManager) -> Self {
        let (snapshot, _) = watch::channel(Vec::new());
        Self {
            shared: Arc::new(Shared {
                manager,
                entries: Mutex::new(Vec::new()),
                snapshot,
            }),
        }
    }

    /// Replaces the bookmark list with `devices`.
    ///
    /// Devices no longer listed have their handles released; new devices get
    /// a handle and a connection attempt. Devices present in both keep their
    /// handle and current status.
    pub async fn sync(&self, devices: Vec<CloudDevice>) {
        let (removed, added) = {
            let mut entries = self.shared.entries.lock();
            let mut previous = std::mem::take(&mut *entries);
            let mut added = Vec::new();

            for device in devices {
                let identity = device.identity();
                if entries.iter().any(|entry| entry.identity == identity) {
                    continue;
                }
                match previous.iter().position(|entry| entry.identity == identity) {
                    Some(index) => {
                        let mut entry = previous.remove(index);
                        entry.device = device;
                        entries.push(entry);
                    }
                    None => {
                        let handle = self.shared.manager.request_connection(identity.clone());
                        let follower = spawn_follower(&self.shared, handle.clone(), &device);
                        added.push(handle.clone());
                        entries.push(Entry {
                            identity,
                            device,
                            handle,
                            status: BookmarkStatus::Offline,
                            follower,
                        });
                    }
                }
            }
            self.shared.publish(&entries);
            (previous, added)
        };

        for entry in removed {
            self.release(entry).await;
        }
        for handle in added {
            if let Err(err) = self.shared.manager.connect(&handle) {
                warn!(target = "edge_monitor", device = %handle.identity(), error = %err, "connect failed");
            }
        }
        info!(
            target = "edge_monitor",
            bookmarks = self.shared.entries.lock().len(),
            "bookmarks synced"
        );
    }

    /// Starts a connection attempt for every bookmark that is not online.
    pub fn refresh(&self) {
        let handles: Vec<_> = self
            .shared
            .entries
            .lock()
            .iter()
            .filter(|entry| entry.status != BookmarkStatus::Online)
            .map(|entry| entry.handle.clone())
            .collect();
        for handle in handles {
            if let Err(err) = self.shared.manager.connect(&handle) {
                warn!(target = "edge_monitor", device = %handle.identity(), error = %err, "reconnect failed");
            }
        }
    }

    /// Drops every bookmark except `keep`, releasing their handles.
    pub async fn release_all_except(&self, keep: &DeviceIdentity) {
        let removed = {
            let mut entries = self.shared.entries.lock();
            let (kept, removed): (Vec<Entry>, Vec<Entry>) = std::mem::take(&mut *entries)
                .into_iter()
                .partition(|entry| &entry.identity == keep);
            *entries = kept;
            self.shared.publish(&entries);
            removed
        };
        for entry in removed {
            self.release(entry).await;
        }
    }

    /// Force-closes the connections of every bookmark not in `keep`. The
    /// bookmarks stay listed, go offline and reconnect on [`Self::refresh`].
    pub async fn disconnect_all_except(&self, keep: &[DeviceIdentity]) {
        let handles: Vec<_> = self
            .shared
            .entries
            .lock()
            .iter()
            .filter(|entry| !keep.contains(&entry.identity))
            .map(|entry| entry.handle.clone())
            .collect();
        for handle in handles {
            if let Err(err) = self.shared.manager.disconnect(&handle).await {
                warn!(target = "edge_monitor", device = %handle.identity(), error = %err, "disconnect failed");
            }
        }
    }

    pub async fn release_all(&self) {
        let removed = {
            let mut entries = self.shared.entries.lock();
            let removed = std::mem::take(&mut *entries);
            self.shared.publish(&entries);
            removed
        };
        for entry in removed {
            self.release(entry).await;
        }
    }

    /// Status of `identity`; unknown devices are offline.
    pub fn status(&self, identity: &DeviceIdentity) -> BookmarkStatus {
        self.shared
            .entries
            .lock()
            .iter()
            .find(|entry| &entry.identity == identity)
            .map(|entry| entry.status)
            .unwrap_or(BookmarkStatus::Offline)
    }

    pub fn bookmarks(&self) -> Vec<Bookmark> {
        self.shared.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Bookmark>> {
        self.shared.snapshot.subscribe()
    }

    async fn release(&self, entry: Entry) {
        entry.follower.abort();
        self.shared.manager.release_handle(&entry.handle).await;
        debug!(target = "edge_monitor", device = %entry.identity, "bookmark released");
    }
}

impl Drop for BookmarkMonitor {
    fn drop(&mut self) {
        let entries = std::mem::take(&mut *self.shared.entries.lock());
        for entry in &entries {
            entry.follower.abort();
        }
        // Without a runtime the handles stay registered; call `release_all`
        // first in that case.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let manager = self.shared.manager.clone();
        runtime.spawn(async move {
            for entry in entries {
                manager.release_handle(&entry.handle).await;
            }
        });
    }
}

/// Display label for a device: its name, or `product.device` when unnamed.
pub fn friendly_name(identity: &DeviceIdentity) -> String {
    match identity.display_name() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => format!("{}.{}", identity.product_id(), identity.device_id()),
    }
}

fn spawn_follower(
    shared: &Arc<Shared>,
    handle: ConnectionHandle,
    device: &CloudDevice,
) -> JoinHandle<()> {
    let shared = Arc::clone(shared);
    let expected = device.fingerprint.clone();
    let stream = shared.manager.connection_state(&handle);
    tokio::spawn(async move {
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                warn!(target = "edge_monitor", device = %handle.identity(), error = %err, "no state stream");
                return;
            }
        };
        while let Some(state) = stream.recv().await {
            let status = match state {
                ConnectionState::Closed => BookmarkStatus::Offline,
                ConnectionState::Connecting => BookmarkStatus::Connecting,
                ConnectionState::Connected => {
                    match connected_status(&shared.manager, &handle, expected.as_deref()) {
                        Some(status) => status,
                        None => continue,
                    }
                }
            };
            shared.set_status(&handle, status);
        }
    })
}

fn connected_status(
    manager: &ConnectionManager,
    handle: &ConnectionHandle,
    expected: Option<&str>,
) -> Option<BookmarkStatus> {
    // The connection may already be gone; the stream will report Closed next.
    let connection = manager.get_connection(handle).ok()?;
    match (expected, connection.device_fingerprint()) {
        (Some(expected), Some(actual)) if !expected.eq_ignore_ascii_case(&actual) => {
            warn!(
                target = "edge_monitor",
                device = %handle.identity(),
                expected,
                actual = %actual,
                "device fingerprint mismatch"
            );
            Some(BookmarkStatus::WrongFingerprint)
        }
        _ => Some(BookmarkStatus::Online),
    }
}
