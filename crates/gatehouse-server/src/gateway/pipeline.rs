//! Request orchestration: verify, acquire credential, forward.

use std::sync::Arc;

use axum::body::Bytes;
use axum::http::{HeaderMap, Method, header::AUTHORIZATION};
use gatehouse_auth::{IdentityVerifier, ServiceCredentialCache};
use tracing::{debug, error};
use url::Url;

use super::error::GatewayError;
use super::forwarder::Forwarder;
use super::outcome::ProxyOutcome;

/// Runs one inbound request through verification, credential acquisition and forwarding.
///
/// Constructed once at startup and shared by all requests; the credential cache
/// it holds is the only state that outlives a request.
pub struct RequestPipeline {
    verifier: Arc<dyn IdentityVerifier>,
    credentials: Arc<ServiceCredentialCache>,
    forwarder: Arc<dyn Forwarder>,
    target: Url,
    audience: String,
}

impl RequestPipeline {
    pub fn new(
        verifier: Arc<dyn IdentityVerifier>,
        credentials: Arc<ServiceCredentialCache>,
        forwarder: Arc<dyn Forwarder>,
        target: Url,
        audience: impl Into<String>,
    ) -> Self {
        Self {
            verifier,
            credentials,
            forwarder,
            target,
            audience: audience.into(),
        }
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Handles one request. Never fails: every failure is a [`ProxyOutcome`].
    pub async fn handle(&self, method: Method, headers: &HeaderMap, body: Bytes) -> ProxyOutcome {
        match self.run(method, headers, body).await {
            Ok(outcome) => outcome,
            Err(err) => {
                if err.is_client_error() {
                    debug!(error = %err, "Request rejected");
                } else {
                    error!(error = %err, "Request failed");
                }
                err.into()
            }
        }
    }

    async fn run(
        &self,
        method: Method,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<ProxyOutcome, GatewayError> {
        let token = extract_bearer(headers)?;

        let identity = self.verifier.verify(token).await?;
        debug!(subject = %identity.subject, "Token verified");

        let credential = self.credentials.get(&self.audience).await?;
        debug!(audience = %self.audience, "Service credential acquired");

        let outcome = self
            .forwarder
            .forward(method, &self.target, headers, body, &credential, &identity)
            .await;

        match outcome {
            ProxyOutcome::InternalFailure { cause } => Err(cause),
            other => Ok(other),
        }
    }
}

/// Extracts the token from an `Authorization: Bearer <token>` header.
///
/// The scheme match is exact and case-sensitive. A missing header, another
/// scheme, or a blank token is [`GatewayError::MissingToken`].
pub fn extract_bearer(headers: &HeaderMap) -> Result<&str, GatewayError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or(GatewayError::MissingToken)?
        .to_str()
        .map_err(|_| GatewayError::MissingToken)?;

    match value.strip_prefix("Bearer ") {
        Some(token) if !token.trim().is_empty() => Ok(token),
        _ => Err(GatewayError::MissingToken),
    }
}
