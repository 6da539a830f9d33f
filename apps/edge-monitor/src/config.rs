use std::env;

use edge_cloud::DEFAULT_CLOUD_URL;

/// Cloud settings for the monitor, read from the environment (a `.env`
/// file is honoured by the binary) and overridable from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    pub cloud_url: String,
    pub client_id: Option<String>,
    pub access_token: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            cloud_url: DEFAULT_CLOUD_URL.to_string(),
            client_id: None,
            access_token: None,
        }
    }
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        let cloud_url = env::var("EDGE_CLOUD_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CLOUD_URL.to_string());
        Self {
            cloud_url,
            client_id: non_empty("EDGE_CLIENT_ID"),
            access_token: non_empty("EDGE_ACCESS_TOKEN"),
        }
    }

    /// Replaces fields with the values given explicitly.
    pub fn with_overrides(
        mut self,
        cloud_url: Option<String>,
        client_id: Option<String>,
        access_token: Option<String>,
    ) -> Self {
        if let Some(url) = cloud_url {
            self.cloud_url = url;
        }
        if client_id.is_some() {
            self.client_id = client_id;
        }
        if access_token.is_some() {
            self.access_token = access_token;
        }
        self
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}
