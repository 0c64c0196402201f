//! Credential minting with a service account key file.
//!
//! The minter signs a short-lived JWT assertion with the account's private key
//! and exchanges it at the account's token endpoint for an ID token whose
//! audience is the downstream service.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{CredentialError, CredentialMinter, ServiceCredential};

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Lifetime of the signed assertion.
const ASSERTION_LIFETIME: Duration = Duration::from_secs(3600);

/// The fields of a service account key file the minter needs.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    /// Account email; issuer and subject of the assertion.
    pub client_email: String,

    /// PEM-encoded RSA private key.
    pub private_key: String,

    /// Key ID placed in the assertion header.
    #[serde(default)]
    pub private_key_id: Option<String>,

    /// Token exchange endpoint.
    pub token_uri: String,

    /// Project the account belongs to.
    #[serde(default)]
    pub project_id: Option<String>,
}

impl ServiceAccountKey {
    /// Parses a key from its JSON form.
    ///
    /// # Errors
    /// Returns an error if the JSON is malformed or lacks required fields.
    pub fn from_json(json: &str) -> Result<Self, CredentialError> {
        serde_json::from_str(json)
            .map_err(|e| CredentialError::ServiceAccount(format!("Invalid key file: {e}")))
    }

    /// Reads a key file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, CredentialError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            CredentialError::ServiceAccount(format!("{}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key", &"[REDACTED]")
            .field("private_key_id", &self.private_key_id)
            .field("token_uri", &self.token_uri)
            .field("project_id", &self.project_id)
            .finish()
    }
}

#[derive(Serialize)]
struct Assertion<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    target_audience: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    id_token: String,
}

/// Mints ID tokens by exchanging a signed service account assertion.
pub struct ServiceAccountMinter {
    http_client: Client,
    key: ServiceAccountKey,
    signing_key: EncodingKey,
}

impl ServiceAccountMinter {
    /// Creates a minter for the given account.
    ///
    /// # Errors
    /// Returns an error if the private key is not a valid RSA PEM or the HTTP client
    /// cannot be created.
    pub fn new(key: ServiceAccountKey, request_timeout: Duration) -> Result<Self, CredentialError> {
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| CredentialError::ServiceAccount(format!("Invalid private key: {e}")))?;

        let http_client = Client::builder()
            .timeout(request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| CredentialError::Mint(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            key,
            signing_key,
        })
    }

    fn sign_assertion(&self, audience: &str) -> Result<String, CredentialError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let claims = Assertion {
            iss: &self.key.client_email,
            sub: &self.key.client_email,
            aud: &self.key.token_uri,
            target_audience: audience,
            iat: now,
            exp: now + ASSERTION_LIFETIME.as_secs() as i64,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key.private_key_id.clone();

        encode(&header, &claims, &self.signing_key)
            .map_err(|e| CredentialError::ServiceAccount(format!("Failed to sign assertion: {e}")))
    }
}

#[async_trait]
impl CredentialMinter for ServiceAccountMinter {
    async fn mint(&self, audience: &str) -> Result<ServiceCredential, CredentialError> {
        let assertion = self.sign_assertion(audience)?;

        let response = self
            .http_client
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| CredentialError::Mint(format!("Token endpoint unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(
                status = status.as_u16(),
                body = %body,
                "Token endpoint rejected credential request"
            );
            return Err(CredentialError::Mint(format!(
                "Token endpoint returned HTTP {}",
                status.as_u16()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| CredentialError::InvalidCredential(format!("Bad token response: {e}")))?;

        ServiceCredential::from_jwt(body.id_token, audience)
    }
}
