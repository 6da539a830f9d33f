use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of the shared connection for one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Closed,
    Connecting,
    Connected,
}

/// Discrete lifecycle notifications delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    /// The device side dropped an established connection.
    Disconnected,
    FailedToConnect(ChannelErrors),
    /// The connection was closed locally (disconnect or last release).
    Closed,
}

/// Error code reported by the device transport for one channel, passed
/// through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelErrorCode {
    pub code: i32,
    pub name: String,
}

impl ChannelErrorCode {
    pub fn new(code: i32, name: impl Into<String>) -> Self {
        Self {
            code,
            name: name.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(0, "OK")
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

impl Default for ChannelErrorCode {
    fn default() -> Self {
        Self::ok()
    }
}

/// Per-channel outcome of a failed dial: local network, remote relay and
/// direct candidates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelErrors {
    pub local: ChannelErrorCode,
    pub remote: ChannelErrorCode,
    pub direct_candidates: ChannelErrorCode,
}

impl ChannelErrors {
    pub fn is_empty(&self) -> bool {
        self.local.is_ok() && self.remote.is_ok() && self.direct_candidates.is_ok()
    }
}

impl fmt::Display for ChannelErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("no channel errors reported");
        }
        let mut first = true;
        for (label, code) in [
            ("local", &self.local),
            ("remote", &self.remote),
            ("direct candidates", &self.direct_candidates),
        ] {
            if code.is_ok() {
                continue;
            }
            if !first {
                f.write_str("; ")?;
            }
            write!(f, "{label} error: {} ({})", code.name, code.code)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_lists_only_failing_channels() {
        let errors = ChannelErrors {
            local: ChannelErrorCode::new(-3, "NOT_FOUND"),
            remote: ChannelErrorCode::ok(),
            direct_candidates: ChannelErrorCode::new(-7, "TIMEOUT"),
        };
        assert_eq!(
            errors.to_string(),
            "local error: NOT_FOUND (-3); direct candidates error: TIMEOUT (-7)"
        );
        assert!(ChannelErrors::default().is_empty());
    }
}
