//! Client for the device cloud service: the account's device list and the
//! token exchange that turns a login token into a device-scoped one.

use edge_link::DeviceIdentity;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const DEFAULT_CLOUD_URL: &str = "https://smarthome.as.dev.nabto.com";

const TOKEN_EXCHANGE_GRANT: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

/// A device registered to the signed-in account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudDevice {
    pub id: String,
    pub owner: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(rename = "nabtoProductId")]
    pub product_id: String,
    #[serde(rename = "nabtoDeviceId")]
    pub device_id: String,
    #[serde(rename = "nabtoSCT", default)]
    pub sct: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
}

impl CloudDevice {
    pub fn identity(&self) -> DeviceIdentity {
        let mut identity =
            DeviceIdentity::new(&self.product_id, &self.device_id).with_display_name(&self.name);
        if let Some(fingerprint) = &self.fingerprint {
            identity = identity.with_fingerprint(fingerprint);
        }
        if let Some(sct) = &self.sct {
            identity = identity.with_pairing_token(sct);
        }
        identity
    }
}

/// Device-scoped token issued by the token exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
    #[serde(default)]
    pub issued_token_type: Option<String>,
}

#[derive(Serialize)]
struct TokenExchangeForm<'a> {
    client_id: &'a str,
    grant_type: &'a str,
    subject_token: &'a str,
    subject_token_type: &'a str,
    resource: String,
}

#[derive(Clone)]
pub struct CloudClient {
    http: Client,
    base_url: String,
    client_id: String,
}

impl CloudClient {
    pub fn new(base_url: &str, client_id: impl Into<String>) -> Result<Self, CloudError> {
        Url::parse(base_url)?;
        Ok(Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id: client_id.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn list_devices(&self, bearer: &str) -> Result<Vec<CloudDevice>, CloudError> {
        let url = format!("{}/webrtc/devices", self.base_url);
        let res = self.http.get(url).bearer_auth(bearer).send().await?;
        let devices: Vec<CloudDevice> = decode(res).await?;
        debug!(target = "edge_cloud", count = devices.len(), "listed cloud devices");
        Ok(devices)
    }

    /// Exchanges `subject_token` for a token scoped to `identity`.
    pub async fn exchange_token(
        &self,
        subject_token: &str,
        identity: &DeviceIdentity,
    ) -> Result<AccessToken, CloudError> {
        let url = format!("{}/sts/token", self.base_url);
        let form = TokenExchangeForm {
            client_id: &self.client_id,
            grant_type: TOKEN_EXCHANGE_GRANT,
            subject_token,
            subject_token_type: ACCESS_TOKEN_TYPE,
            resource: device_resource(identity)?,
        };
        let res = self.http.post(url).form(&form).send().await?;
        let token: AccessToken = decode(res).await?;
        debug!(
            target = "edge_cloud",
            device = %identity,
            expires_in = token.expires_in,
            "token exchanged"
        );
        Ok(token)
    }
}

/// `nabto://device?productId=..&deviceId=..`
pub fn device_resource(identity: &DeviceIdentity) -> Result<String, CloudError> {
    let url = Url::parse_with_params(
        "nabto://device",
        &[
            ("productId", identity.product_id()),
            ("deviceId", identity.device_id()),
        ],
    )?;
    Ok(url.to_string())
}

async fn decode<T>(res: Response) -> Result<T, CloudError>
where
    T: DeserializeOwned,
{
    if res.status().is_success() {
        Ok(res.json::<T>().await?)
    } else {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        Err(CloudError::UnexpectedStatus { status, body })
    }
}
