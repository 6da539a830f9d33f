//! Seams to the encrypted device transport.
//!
//! The manager never talks to the network itself: a [`DeviceConnector`]
//! dials devices and hands back [`DeviceConnection`]s, which expose the two
//! capabilities the rest of the workspace relies on, CoAP-style
//! request/response calls and multiplexed byte streams.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{DialError, TransportError};
use crate::identity::DeviceIdentity;

/// Response status codes used by the device API (CoAP class * 100 + detail).
pub mod status {
    pub const CREATED: u16 = 201;
    pub const CONTENT: u16 = 205;
}

/// Content formats understood by device endpoints.
pub mod content_format {
    pub const TEXT_PLAIN: u16 = 0;
    pub const JSON: u16 = 50;
    pub const CBOR: u16 = 60;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRequest {
    pub method: Method,
    pub path: String,
    pub content_format: Option<u16>,
    pub payload: Bytes,
}

impl DeviceRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            content_format: None,
            payload: Bytes::new(),
        }
    }

    pub fn post(path: impl Into<String>, content_format: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            content_format: Some(content_format),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceResponse {
    pub status: u16,
    pub content_format: Option<u16>,
    pub payload: Bytes,
}

impl DeviceResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            content_format: None,
            payload: Bytes::new(),
        }
    }

    pub fn with_payload(mut self, content_format: u16, payload: impl Into<Bytes>) -> Self {
        self.content_format = Some(content_format);
        self.payload = payload.into();
        self
    }
}

/// Reliable, ordered byte stream multiplexed over a device connection.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type DeviceStream = Box<dyn ByteStream>;

/// An open, authenticated connection to one device.
#[async_trait]
pub trait DeviceConnection: Send + Sync {
    /// Fingerprint presented by the device during the handshake.
    fn device_fingerprint(&self) -> Option<String>;

    async fn request(&self, request: DeviceRequest) -> Result<DeviceResponse, TransportError>;

    async fn open_stream(&self, port: u32) -> Result<DeviceStream, TransportError>;

    /// Password authentication on the open connection, needed before
    /// password-based pairing. Transports without it report `Unsupported`.
    async fn password_authenticate(
        &self,
        _username: &str,
        _password: &str,
    ) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("password authentication"))
    }

    /// Resolves once the connection is gone, whichever side closed it.
    async fn closed(&self);

    async fn close(&self);
}

/// Factory for device connections, injected into the manager.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    async fn dial(&self, identity: &DeviceIdentity)
    -> Result<Arc<dyn DeviceConnection>, DialError>;
}
