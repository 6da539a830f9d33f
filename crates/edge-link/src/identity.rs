use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Names a remote device.
///
/// Two identities are equal when their `(product_id, device_id)` pair matches;
/// fingerprint, pairing token and display name are metadata carried along for
/// consumers and never take part in equality or hashing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    product_id: String,
    device_id: String,
    #[serde(default)]
    fingerprint: Option<String>,
    #[serde(default)]
    pairing_token: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
}

impl DeviceIdentity {
    pub fn new(product_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            product_id: product_id.into(),
            device_id: device_id.into(),
            fingerprint: None,
            pairing_token: None,
            display_name: None,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    pub fn with_pairing_token(mut self, token: impl Into<String>) -> Self {
        self.pairing_token = Some(token.into());
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    pub fn pairing_token(&self) -> Option<&str> {
        self.pairing_token.as_deref()
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }
}

impl PartialEq for DeviceIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.product_id == other.product_id && self.device_id == other.device_id
    }
}

impl Eq for DeviceIdentity {}

impl Hash for DeviceIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.product_id.hash(state);
        self.device_id.hash(state);
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.product_id, self.device_id)
    }
}
