//! Pooled, reference-counted connections to remote devices.
//!
//! Consumers ask the [`ConnectionManager`] for a [`ConnectionHandle`] per
//! device identity; all handles for one identity share a single underlying
//! transport connection whose lifecycle is observable as a state stream and
//! as discrete [`ConnectionEvent`]s.

pub mod error;
pub mod identity;
pub mod manager;
#[cfg(feature = "test-util")]
pub mod mock;
pub mod state;
pub mod transport;

pub use error::{DialError, LinkError, TransportError};
pub use identity::DeviceIdentity;
pub use manager::{ConnectionHandle, ConnectionManager, EventSubscription, StateStream};
pub use state::{ChannelErrorCode, ChannelErrors, ConnectionEvent, ConnectionState};
pub use transport::{
    ByteStream, DeviceConnection, DeviceConnector, DeviceRequest, DeviceResponse, DeviceStream,
    Method, content_format, status,
};
