//! Inbound identity verification.
//!
//! An [`IdentityVerifier`] turns the opaque bearer string presented by an
//! end-user client into a [`VerifiedIdentity`]. The verifier never performs
//! I/O of its own; key material comes from a [`KeySource`], which may keep a
//! short-lived cache of remote keys.
//!
//! Failures are split in two so the HTTP layer can keep the 401/403
//! distinction:
//!
//! - [`VerifyError::Unauthorized`] - no usable token was presented
//! - [`VerifyError::Forbidden`] - a token was presented but is invalid,
//!   expired, or minted for another audience

pub mod jwks;
pub mod jwt;
pub mod keys;

use async_trait::async_trait;
use serde_json::{Map, Value};
use time::OffsetDateTime;

pub use jwks::{JwksConfig, JwksError, JwksKeySource};
pub use jwt::JwtIdentityVerifier;
pub use keys::{KeyError, KeySource, StaticKeySource};

/// The verified identity of the caller for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedIdentity {
    /// Subject (`sub` claim) of the verified token.
    pub subject: String,

    /// All claims carried by the token.
    pub claims: Map<String, Value>,

    /// When the inbound token expires.
    pub expires_at: OffsetDateTime,
}

impl VerifiedIdentity {
    /// Returns a claim by name.
    #[must_use]
    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.claims.get(name)
    }
}

/// Errors returned by an [`IdentityVerifier`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    /// No usable token was presented.
    #[error("Unauthorized: {message}")]
    Unauthorized {
        /// Description of why the token is unusable.
        message: String,
    },

    /// The token was presented but failed verification.
    #[error("Forbidden: {message}")]
    Forbidden {
        /// Description of the verification failure.
        message: String,
    },
}

impl VerifyError {
    /// Creates a new `Unauthorized` error.
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    /// Creates a new `Forbidden` error.
    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    /// Returns the failure description.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Unauthorized { message } | Self::Forbidden { message } => message,
        }
    }
}

/// Validates an inbound bearer token and extracts the caller's identity.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Verifies `token` (the part after `Bearer `) and returns the identity it asserts.
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity, VerifyError>;
}
