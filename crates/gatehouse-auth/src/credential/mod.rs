//! Outbound service credentials.
//!
//! The gateway proves its own identity to the downstream service with a
//! short-lived credential minted for the downstream's audience. Minting is
//! done by a [`CredentialMinter`]; [`ServiceCredentialCache`] keeps one
//! credential per audience and makes sure concurrent callers share a single
//! mint when the cached credential is missing or stale.

pub mod cache;
pub mod metadata;
pub mod service_account;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use time::OffsetDateTime;

pub use cache::ServiceCredentialCache;
pub use metadata::MetadataServerMinter;
pub use service_account::{ServiceAccountKey, ServiceAccountMinter};

/// A bearer credential the gateway presents to the downstream service.
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceCredential {
    token: String,
    audience: String,
    expires_at: OffsetDateTime,
}

impl ServiceCredential {
    /// Creates a credential with an explicit expiry.
    #[must_use]
    pub fn new(
        token: impl Into<String>,
        audience: impl Into<String>,
        expires_at: OffsetDateTime,
    ) -> Self {
        Self {
            token: token.into(),
            audience: audience.into(),
            expires_at,
        }
    }

    /// Creates a credential from a signed ID token, reading the expiry from its `exp` claim.
    ///
    /// The signature is not checked; the token came straight from the issuer.
    ///
    /// # Errors
    /// Returns [`CredentialError::InvalidCredential`] if the token has no readable `exp`.
    pub fn from_jwt(
        token: impl Into<String>,
        audience: impl Into<String>,
    ) -> Result<Self, CredentialError> {
        let token = token.into();
        let expires_at = jwt_expiry(&token)?;
        Ok(Self::new(token, audience, expires_at))
    }

    /// The bearer token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The audience this credential was minted for.
    #[must_use]
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// When the credential stops being accepted.
    #[must_use]
    pub fn expires_at(&self) -> OffsetDateTime {
        self.expires_at
    }

    /// Whether the credential is still usable at `now` with at least `margin` to spare.
    #[must_use]
    pub fn is_fresh(&self, now: OffsetDateTime, margin: Duration) -> bool {
        now + margin < self.expires_at
    }

    /// The `Authorization` header value for this credential.
    #[must_use]
    pub fn authorization_value(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl fmt::Debug for ServiceCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCredential")
            .field("token", &"[REDACTED]")
            .field("audience", &self.audience)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Errors that can occur while acquiring a service credential.
///
/// Cloneable so that every caller joined on one mint receives the same outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    /// The issuer refused or failed to mint a credential.
    #[error("Credential minting failed: {0}")]
    Mint(String),

    /// Minting did not finish within the configured timeout.
    #[error("Credential minting timed out after {0:?}")]
    Timeout(Duration),

    /// The issuer returned something that is not a usable credential.
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    /// The service account key is unusable.
    #[error("Service account error: {0}")]
    ServiceAccount(String),
}

/// Obtains a fresh credential for a downstream audience.
#[async_trait]
pub trait CredentialMinter: Send + Sync {
    /// Mints a new credential for `audience`.
    async fn mint(&self, audience: &str) -> Result<ServiceCredential, CredentialError>;
}

#[derive(Deserialize)]
struct ExpiryClaim {
    exp: i64,
}

/// Reads the `exp` claim of a JWT without verifying it.
///
/// # Errors
/// Returns [`CredentialError::InvalidCredential`] if the token is not a JWT or has no `exp`.
pub fn jwt_expiry(token: &str) -> Result<OffsetDateTime, CredentialError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| CredentialError::InvalidCredential("Token is not a JWT".to_string()))?;

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| CredentialError::InvalidCredential(format!("Bad payload encoding: {e}")))?;

    let claim: ExpiryClaim = serde_json::from_slice(&bytes)
        .map_err(|e| CredentialError::InvalidCredential(format!("Missing exp claim: {e}")))?;

    OffsetDateTime::from_unix_timestamp(claim.exp)
        .map_err(|e| CredentialError::InvalidCredential(format!("Invalid exp claim: {e}")))
}
