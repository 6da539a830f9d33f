//! Device bookmarks backed by the account's cloud device list, device
//! pairing, and the configuration and logging used by the `edge-monitor`
//! binary.

pub mod bookmarks;
pub mod config;
pub mod logging;
pub mod pairing;

pub use bookmarks::{Bookmark, BookmarkMonitor, BookmarkStatus, friendly_name};
pub use config::MonitorConfig;
pub use pairing::{PairedDevice, PairingRequest, PairingResult, pair_device};
