//! Pairing a user with a device through the device's IAM endpoints.
//!
//! [`pair_device`] connects through the shared [`ConnectionManager`],
//! checks whether the caller is already paired and otherwise pairs with the
//! best mode the device offers. Every outcome, including connection
//! failures, is reported as a [`PairingResult`].

use std::sync::Arc;

use edge_link::{
    ChannelErrors, ConnectionEvent, ConnectionHandle, ConnectionManager, DeviceConnection,
    DeviceIdentity, DeviceRequest, EventSubscription, LinkError, Method, TransportError,
    content_format, status,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const PAIRING_PATH: &str = "/iam/pairing";
pub const ME_PATH: &str = "/iam/me";
pub const LOCAL_INITIAL_PATH: &str = "/iam/pairing/local-initial";
pub const LOCAL_OPEN_PATH: &str = "/iam/pairing/local-open";
pub const PASSWORD_OPEN_PATH: &str = "/iam/pairing/password-open";

const NOT_FOUND: u16 = 404;
const CONFLICT: u16 = 409;
const CHANGED: u16 = 204;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairingMode {
    LocalInitial,
    LocalOpen,
    PasswordOpen,
    PasswordInvite,
}

/// `GET /iam/pairing` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DeviceDetails {
    pub modes: Vec<String>,
    pub app_name: Option<String>,
    pub app_version: Option<String>,
    pub product_id: String,
    pub device_id: String,
}

impl DeviceDetails {
    /// Modes this client knows; unknown names are skipped.
    pub fn pairing_modes(&self) -> Vec<PairingMode> {
        self.modes
            .iter()
            .filter_map(|mode| match mode.as_str() {
                "LocalInitial" => Some(PairingMode::LocalInitial),
                "LocalOpen" => Some(PairingMode::LocalOpen),
                "PasswordOpen" => Some(PairingMode::PasswordOpen),
                "PasswordInvite" => Some(PairingMode::PasswordInvite),
                _ => None,
            })
            .collect()
    }
}

/// `GET /iam/me` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct CurrentUser {
    username: String,
    sct: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct UsernameBody<'a> {
    username: &'a str,
}

#[derive(Debug, Clone, Default)]
pub struct PairingRequest {
    /// Lowercase letters and digits only.
    pub username: String,
    pub friendly_name: String,
    /// Name the device keeps for this user; defaults to `username`.
    pub display_name: Option<String>,
    /// Required for password-open pairing.
    pub password: Option<String>,
    /// When set, devices reporting another app name are refused.
    pub expected_app_name: Option<String>,
}

/// A device the user is now paired with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairedDevice {
    pub product_id: String,
    pub device_id: String,
    pub friendly_name: String,
    pub username: String,
    pub app_name: Option<String>,
    pub fingerprint: Option<String>,
    pub sct: Option<String>,
}

impl PairedDevice {
    pub fn identity(&self) -> DeviceIdentity {
        let mut identity = DeviceIdentity::new(&self.product_id, &self.device_id)
            .with_display_name(&self.friendly_name);
        if let Some(fingerprint) = &self.fingerprint {
            identity = identity.with_fingerprint(fingerprint);
        }
        if let Some(sct) = &self.sct {
            identity = identity.with_pairing_token(sct);
        }
        identity
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingResult {
    Paired {
        already_paired: bool,
        device: PairedDevice,
    },
    InvalidUsername,
    IncorrectApp {
        expected: String,
        found: Option<String>,
    },
    UsernameExists,
    InvalidPairingMode,
    NoPassword,
    WrongPassword,
    /// The dial failed without any channel reporting an error.
    NoChannels,
    ConnectFailed(ChannelErrors),
    DeviceDisconnected,
    DeviceClosed,
    Failed(String),
}

impl PairingResult {
    pub fn is_success(&self) -> bool {
        matches!(self, PairingResult::Paired { .. })
    }
}

#[derive(Debug, thiserror::Error)]
enum IamError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{path} answered {status}")]
    Status { path: &'static str, status: u16 },
    #[error("invalid CBOR payload from {path}: {source}")]
    Payload {
        path: &'static str,
        source: serde_cbor::Error,
    },
}

/// Pairs `request.username` with the device behind `identity`.
///
/// The flow holds its own handle for its whole duration and releases it
/// before returning, so other holders of the same identity are unaffected.
pub async fn pair_device(
    manager: &ConnectionManager,
    identity: DeviceIdentity,
    request: &PairingRequest,
) -> PairingResult {
    if !valid_username(&request.username) {
        return PairingResult::InvalidUsername;
    }

    let guard = HandleGuard::new(manager.clone(), identity);
    let result = run(manager, guard.handle(), request).await;
    match &result {
        PairingResult::Paired { already_paired, .. } => info!(
            target = "edge_monitor",
            device = %guard.handle().identity(),
            already_paired,
            "device paired"
        ),
        other => warn!(
            target = "edge_monitor",
            device = %guard.handle().identity(),
            result = ?other,
            "pairing failed"
        ),
    }
    guard.release().await;
    result
}

pub fn valid_username(username: &str) -> bool {
    !username.is_empty()
        && username
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

async fn run(
    manager: &ConnectionManager,
    handle: &ConnectionHandle,
    request: &PairingRequest,
) -> PairingResult {
    let mut events = match manager.subscribe(handle) {
        Ok(events) => events,
        Err(err) => return PairingResult::Failed(err.to_string()),
    };
    let connection = match manager.wait_connected(handle).await {
        Ok(connection) => connection,
        Err(LinkError::ConnectFailed { errors, .. }) if errors.is_empty() => {
            return PairingResult::NoChannels;
        }
        Err(LinkError::ConnectFailed { errors, .. }) => {
            return PairingResult::ConnectFailed(errors);
        }
        Err(LinkError::Closed(_)) => return PairingResult::DeviceClosed,
        Err(err) => return PairingResult::Failed(err.to_string()),
    };

    tokio::select! {
        biased;
        event = connection_lost(&mut events) => match event {
            ConnectionEvent::Closed => PairingResult::DeviceClosed,
            _ => PairingResult::DeviceDisconnected,
        },
        result = pair(connection, request) => match result {
            Ok(result) => result,
            Err(IamError::Transport(TransportError::Closed)) => PairingResult::DeviceDisconnected,
            Err(IamError::Transport(TransportError::PasswordRejected)) => {
                PairingResult::WrongPassword
            }
            Err(err) => PairingResult::Failed(err.to_string()),
        },
    }
}

async fn connection_lost(events: &mut EventSubscription) -> ConnectionEvent {
    loop {
        match events.recv().await {
            Some(event @ (ConnectionEvent::Disconnected | ConnectionEvent::Closed)) => {
                return event;
            }
            Some(_) => continue,
            // The record is gone, which only happens once it is closed.
            None => return ConnectionEvent::Closed,
        }
    }
}

async fn pair(
    connection: Arc<dyn DeviceConnection>,
    request: &PairingRequest,
) -> Result<PairingResult, IamError> {
    let details: DeviceDetails = get_cbor(connection.as_ref(), PAIRING_PATH).await?;
    debug!(
        target = "edge_monitor",
        modes = ?details.modes,
        app = ?details.app_name,
        "device pairing details"
    );
    if let Some(expected) = &request.expected_app_name {
        if details.app_name.as_ref() != Some(expected) {
            return Ok(PairingResult::IncorrectApp {
                expected: expected.clone(),
                found: details.app_name,
            });
        }
    }

    if let Some(user) = current_user(connection.as_ref()).await? {
        let device = paired_device(connection.as_ref(), &details, request, user);
        return Ok(PairingResult::Paired {
            already_paired: true,
            device,
        });
    }

    let modes = details.pairing_modes();
    let username = UsernameBody {
        username: &request.username,
    };
    let outcome = if modes.contains(&PairingMode::LocalInitial) {
        post(connection.as_ref(), LOCAL_INITIAL_PATH, None).await?
    } else if modes.contains(&PairingMode::PasswordOpen) {
        let Some(password) = request.password.as_deref() else {
            return Ok(PairingResult::NoPassword);
        };
        connection.password_authenticate("", password).await?;
        post(connection.as_ref(), PASSWORD_OPEN_PATH, Some(&username)).await?
    } else if modes.contains(&PairingMode::LocalOpen) {
        post(connection.as_ref(), LOCAL_OPEN_PATH, Some(&username)).await?
    } else {
        return Ok(PairingResult::InvalidPairingMode);
    };
    match outcome {
        status::CREATED => {}
        CONFLICT => return Ok(PairingResult::UsernameExists),
        other => return Ok(PairingResult::Failed(format!("pairing answered {other}"))),
    }

    let Some(user) = current_user(connection.as_ref()).await? else {
        return Ok(PairingResult::Failed("device forgot the new pairing".into()));
    };
    let display_name = request
        .display_name
        .clone()
        .unwrap_or_else(|| user.username.clone());
    update_display_name(connection.as_ref(), &user.username, &display_name).await?;
    let device = paired_device(connection.as_ref(), &details, request, user);
    Ok(PairingResult::Paired {
        already_paired: false,
        device,
    })
}

fn paired_device(
    connection: &dyn DeviceConnection,
    details: &DeviceDetails,
    request: &PairingRequest,
    user: CurrentUser,
) -> PairedDevice {
    PairedDevice {
        product_id: details.product_id.clone(),
        device_id: details.device_id.clone(),
        friendly_name: request.friendly_name.clone(),
        username: user.username,
        app_name: details.app_name.clone(),
        fingerprint: connection.device_fingerprint(),
        sct: user.sct,
    }
}

/// `None` when the connection's client is not paired (404).
async fn current_user(connection: &dyn DeviceConnection) -> Result<Option<CurrentUser>, IamError> {
    let response = connection.request(DeviceRequest::get(ME_PATH)).await?;
    match response.status {
        status::CONTENT => decode(ME_PATH, &response.payload).map(Some),
        NOT_FOUND => Ok(None),
        other => Err(IamError::Status {
            path: ME_PATH,
            status: other,
        }),
    }
}

async fn get_cbor<T>(connection: &dyn DeviceConnection, path: &'static str) -> Result<T, IamError>
where
    T: for<'de> Deserialize<'de>,
{
    let response = connection.request(DeviceRequest::get(path)).await?;
    if response.status != status::CONTENT {
        return Err(IamError::Status {
            path,
            status: response.status,
        });
    }
    decode(path, &response.payload)
}

/// Posts an optional CBOR body and returns the status for the caller to
/// interpret.
async fn post(
    connection: &dyn DeviceConnection,
    path: &'static str,
    body: Option<&UsernameBody<'_>>,
) -> Result<u16, IamError> {
    let request = match body {
        Some(body) => DeviceRequest::post(path, content_format::CBOR, encode(path, body)?),
        None => DeviceRequest {
            method: Method::Post,
            path: path.to_string(),
            content_format: None,
            payload: Default::default(),
        },
    };
    Ok(connection.request(request).await?.status)
}

async fn update_display_name(
    connection: &dyn DeviceConnection,
    username: &str,
    display_name: &str,
) -> Result<(), IamError> {
    const PATH: &str = "/iam/users/{username}/display-name";
    let request = DeviceRequest {
        method: Method::Put,
        path: format!("/iam/users/{username}/display-name"),
        content_format: Some(content_format::CBOR),
        payload: encode(PATH, &display_name)?.into(),
    };
    let response = connection.request(request).await?;
    if response.status != CHANGED {
        return Err(IamError::Status {
            path: PATH,
            status: response.status,
        });
    }
    Ok(())
}

fn encode<T: Serialize>(path: &'static str, value: &T) -> Result<Vec<u8>, IamError> {
    serde_cbor::to_vec(value).map_err(|source| IamError::Payload { path, source })
}

fn decode<T>(path: &'static str, payload: &[u8]) -> Result<T, IamError>
where
    T: for<'de> Deserialize<'de>,
{
    serde_cbor::from_slice(payload).map_err(|source| IamError::Payload { path, source })
}

/// Releases its handle when dropped, so an abandoned pairing future does not
/// keep the record alive.
struct HandleGuard {
    manager: ConnectionManager,
    handle: ConnectionHandle,
    armed: bool,
}

impl HandleGuard {
    fn new(manager: ConnectionManager, identity: DeviceIdentity) -> Self {
        let handle = manager.request_connection(identity);
        Self {
            manager,
            handle,
            armed: true,
        }
    }

    fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    async fn release(mut self) {
        self.armed = false;
        self.manager.release_handle(&self.handle).await;
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let manager = self.manager.clone();
            let handle = self.handle.clone();
            runtime.spawn(async move {
                manager.release_handle(&handle).await;
            });
        }
    }
}
