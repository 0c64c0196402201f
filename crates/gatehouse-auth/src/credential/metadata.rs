//! Credential minting through the instance metadata server.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use url::Url;

use super::{CredentialError, CredentialMinter, ServiceCredential};

/// Default metadata server base URL.
pub const DEFAULT_METADATA_URL: &str = "http://metadata.google.internal";

const IDENTITY_PATH: &str = "computeMetadata/v1/instance/service-accounts/default/identity";

/// Mints ID tokens from the metadata server of the instance the gateway runs on.
pub struct MetadataServerMinter {
    http_client: Client,
    base_url: Url,
}

impl MetadataServerMinter {
    /// Creates a minter against the given metadata base URL.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(base_url: Url, request_timeout: Duration) -> Result<Self, CredentialError> {
        let http_client = Client::builder()
            .timeout(request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| CredentialError::Mint(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            base_url,
        })
    }

    fn identity_url(&self, audience: &str) -> Result<Url, CredentialError> {
        let mut url = self
            .base_url
            .join(IDENTITY_PATH)
            .map_err(|e| CredentialError::Mint(format!("Invalid metadata URL: {e}")))?;
        url.query_pairs_mut()
            .append_pair("audience", audience)
            .append_pair("format", "full");
        Ok(url)
    }
}

#[async_trait]
impl CredentialMinter for MetadataServerMinter {
    async fn mint(&self, audience: &str) -> Result<ServiceCredential, CredentialError> {
        let url = self.identity_url(audience)?;

        let response = self
            .http_client
            .get(url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| CredentialError::Mint(format!("Metadata server unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(
                status = status.as_u16(),
                body = %body,
                "Metadata server rejected credential request"
            );
            return Err(CredentialError::Mint(format!(
                "Metadata server returned HTTP {}",
                status.as_u16()
            )));
        }

        let token = response
            .text()
            .await
            .map_err(|e| CredentialError::Mint(format!("Failed to read metadata response: {e}")))?;

        ServiceCredential::from_jwt(token.trim(), audience)
    }
}
