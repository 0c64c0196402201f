//! JWT identity verification.
//!
//! Verifies the signature of an inbound JWT against a [`KeySource`] and checks
//! the standard claims: issuer, audience, expiry and not-before. Firebase ID
//! tokens are the primary target (see [`JwtIdentityVerifier::firebase`]), but
//! any issuer that publishes its keys works.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, Validation, decode, decode_header};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use super::keys::{KeyError, KeySource};
use super::{IdentityVerifier, VerifiedIdentity, VerifyError};

/// Issuer prefix for Firebase ID tokens; the project ID follows.
pub const FIREBASE_ISSUER_PREFIX: &str = "https://securetoken.google.com/";

/// Firebase rejects subjects longer than this.
const MAX_SUBJECT_LEN: usize = 128;

/// Default clock skew tolerance.
const DEFAULT_LEEWAY: Duration = Duration::from_secs(60);

/// Verifies inbound JWTs and extracts the caller identity.
pub struct JwtIdentityVerifier {
    keys: Arc<dyn KeySource>,
    issuer: String,
    audience: String,
    algorithms: Vec<Algorithm>,
    leeway: Duration,
}

impl JwtIdentityVerifier {
    /// Creates a verifier for tokens from `issuer` minted for `audience`.
    ///
    /// Only RS256 is accepted until [`with_algorithms`](Self::with_algorithms) says otherwise.
    pub fn new(
        keys: Arc<dyn KeySource>,
        issuer: impl Into<String>,
        audience: impl Into<String>,
    ) -> Self {
        Self {
            keys,
            issuer: issuer.into(),
            audience: audience.into(),
            algorithms: vec![Algorithm::RS256],
            leeway: DEFAULT_LEEWAY,
        }
    }

    /// Creates a verifier for Firebase ID tokens of the given project.
    pub fn firebase(keys: Arc<dyn KeySource>, project_id: &str) -> Self {
        Self::new(keys, firebase_issuer(project_id), project_id)
    }

    /// Sets the accepted signing algorithms.
    #[must_use]
    pub fn with_algorithms(mut self, algorithms: Vec<Algorithm>) -> Self {
        self.algorithms = algorithms;
        self
    }

    /// Sets the clock skew tolerance for `exp`, `nbf` and `auth_time`.
    #[must_use]
    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }

    /// Expected `iss` claim.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Expected `aud` claim.
    #[must_use]
    pub fn audience(&self) -> &str {
        &self.audience
    }

    fn validation(&self, alg: Algorithm) -> Validation {
        let mut validation = Validation::new(alg);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.leeway = self.leeway.as_secs();
        validation
    }
}

#[async_trait]
impl IdentityVerifier for JwtIdentityVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity, VerifyError> {
        if token.trim().is_empty() {
            return Err(VerifyError::unauthorized("Empty bearer token"));
        }

        let header = decode_header(token)
            .map_err(|e| VerifyError::forbidden(format!("Malformed token: {e}")))?;

        if !self.algorithms.contains(&header.alg) {
            return Err(VerifyError::forbidden(format!(
                "Algorithm {:?} is not accepted",
                header.alg
            )));
        }

        let key = self
            .keys
            .decoding_key(header.kid.as_deref(), header.alg)
            .await
            .map_err(|e| {
                if matches!(e, KeyError::Unavailable(_)) {
                    tracing::warn!(error = %e, "Verification keys unavailable");
                }
                VerifyError::forbidden(e.to_string())
            })?;

        let data = decode::<Map<String, Value>>(token, &key, &self.validation(header.alg))
            .map_err(|e| VerifyError::forbidden(describe_jwt_error(e.kind())))?;
        let claims = data.claims;

        let subject = match claims.get("sub").and_then(Value::as_str) {
            Some(sub) if !sub.is_empty() && sub.len() <= MAX_SUBJECT_LEN => sub.to_string(),
            _ => return Err(VerifyError::forbidden("Invalid subject claim")),
        };

        let now = OffsetDateTime::now_utc().unix_timestamp();
        if let Some(auth_time) = claims.get("auth_time").and_then(Value::as_i64)
            && auth_time > now + self.leeway.as_secs() as i64
        {
            return Err(VerifyError::forbidden("auth_time is in the future"));
        }

        let expires_at = claims
            .get("exp")
            .and_then(Value::as_i64)
            .and_then(|exp| OffsetDateTime::from_unix_timestamp(exp).ok())
            .ok_or_else(|| VerifyError::forbidden("Invalid exp claim"))?;

        Ok(VerifiedIdentity {
            subject,
            claims,
            expires_at,
        })
    }
}

/// Builds the Firebase issuer URL for a project.
#[must_use]
pub fn firebase_issuer(project_id: &str) -> String {
    format!("{FIREBASE_ISSUER_PREFIX}{project_id}")
}

fn describe_jwt_error(kind: &ErrorKind) -> String {
    match kind {
        ErrorKind::ExpiredSignature => "Token expired".to_string(),
        ErrorKind::ImmatureSignature => "Token not yet valid".to_string(),
        ErrorKind::InvalidSignature => "Invalid signature".to_string(),
        ErrorKind::InvalidAudience => "Token audience mismatch".to_string(),
        ErrorKind::InvalidIssuer => "Token issuer mismatch".to_string(),
        ErrorKind::MissingRequiredClaim(claim) => format!("Missing required claim: {claim}"),
        ErrorKind::InvalidAlgorithm => "Algorithm does not match key".to_string(),
        other => format!("Malformed token: {other:?}"),
    }
}
