use std::env;
use std::time::Duration;

use edge_signal::MetadataTrack;

pub const DEFAULT_ICE_SERVER: &str = "stun:stun.nabto.net";
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_ANSWER_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-attempt session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ice_servers: Vec<String>,
    /// Bounds `/webrtc/info` plus opening the signaling stream.
    pub discovery_timeout: Duration,
    /// Bounds the wait for the device's answer frame.
    pub answer_timeout: Duration,
    /// Sent to `/webrtc/oauth` before discovery when present.
    pub access_token: Option<String>,
    /// Track mapping announced in the offer metadata.
    pub offer_tracks: Vec<MetadataTrack>,
    /// Track ids requested through `/webrtc/tracks` once established.
    pub requested_tracks: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            answer_timeout: DEFAULT_ANSWER_TIMEOUT,
            access_token: None,
            offer_tracks: vec![MetadataTrack::new("0", "frontdoor-video")],
            requested_tracks: vec!["frontdoor-video".into(), "frontdoor-audio".into()],
        }
    }
}

impl SessionConfig {
    /// Defaults overridden by `EDGE_ICE_SERVERS` (comma separated),
    /// `EDGE_DISCOVERY_TIMEOUT_MS` and `EDGE_ANSWER_TIMEOUT_MS`. Unparsable
    /// values fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let ice_servers = env::var("EDGE_ICE_SERVERS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(str::to_owned)
                    .collect::<Vec<_>>()
            })
            .filter(|servers| !servers.is_empty())
            .unwrap_or(defaults.ice_servers);
        let discovery_timeout = env_millis("EDGE_DISCOVERY_TIMEOUT_MS")
            .unwrap_or(defaults.discovery_timeout);
        let answer_timeout =
            env_millis("EDGE_ANSWER_TIMEOUT_MS").unwrap_or(defaults.answer_timeout);
        Self {
            ice_servers,
            discovery_timeout,
            answer_timeout,
            ..defaults
        }
    }

    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    pub fn with_answer_timeout(mut self, timeout: Duration) -> Self {
        self.answer_timeout = timeout;
        self
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_offer_tracks(mut self, tracks: Vec<MetadataTrack>) -> Self {
        self.offer_tracks = tracks;
        self
    }

    pub fn with_requested_tracks(mut self, tracks: Vec<String>) -> Self {
        self.requested_tracks = tracks;
        self
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}
