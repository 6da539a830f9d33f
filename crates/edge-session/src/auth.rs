use std::sync::Arc;

use edge_cloud::{AccessToken, CloudClient};
use edge_link::{DeviceConnection, DeviceIdentity};
use tracing::info;

use crate::device_api::DeviceApi;
use crate::error::AuthError;

/// Obtains a device-scoped token from the cloud and presents it to the
/// device over an open connection.
#[derive(Clone)]
pub struct DeviceAuthorizer {
    cloud: CloudClient,
}

impl DeviceAuthorizer {
    pub fn new(cloud: CloudClient) -> Self {
        Self { cloud }
    }

    pub async fn authorize(
        &self,
        connection: Arc<dyn DeviceConnection>,
        identity: &DeviceIdentity,
        subject_token: &str,
    ) -> Result<AccessToken, AuthError> {
        let token = self.cloud.exchange_token(subject_token, identity).await?;
        DeviceApi::new(connection)
            .authorize(&token.access_token)
            .await?;
        info!(target = "edge_session", device = %identity, "device authorized");
        Ok(token)
    }
}
