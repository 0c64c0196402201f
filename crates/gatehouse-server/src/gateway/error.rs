//! Gateway-specific error types.

use axum::http::StatusCode;
use gatehouse_auth::{CredentialError, VerifyError};

/// Client-facing reason for a missing or malformed `Authorization` header.
pub const MISSING_TOKEN_REASON: &str = "Unauthorized: No token provided or invalid format";

/// Client-facing reason for a token that failed verification.
pub const INVALID_TOKEN_REASON: &str = "Forbidden: Invalid or expired token";

/// Failures that end a gateway request early.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// No `Authorization: Bearer <token>` header.
    #[error("no bearer token provided or invalid format")]
    MissingToken,

    /// The verifier found no usable token.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The token was presented but failed verification.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// No service credential could be obtained for the downstream audience.
    #[error("credential acquisition failed: {0}")]
    CredentialAcquisitionFailed(#[from] CredentialError),

    /// The downstream call failed at the transport level.
    #[error("downstream unreachable: {0}")]
    DownstreamUnreachable(String),

    /// The outbound request could not be assembled.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Status code reported to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingToken | Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::InvalidToken(_) => StatusCode::FORBIDDEN,
            Self::CredentialAcquisitionFailed(_)
            | Self::DownstreamUnreachable(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the failure was caused by the client's input rather than the gateway.
    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }

    /// Fixed body sent for client errors. `None` for internal failures, whose
    /// cause is never shown to the client.
    pub fn client_reason(&self) -> Option<&'static str> {
        match self.status() {
            StatusCode::UNAUTHORIZED => Some(MISSING_TOKEN_REASON),
            StatusCode::FORBIDDEN => Some(INVALID_TOKEN_REASON),
            _ => None,
        }
    }
}

impl From<VerifyError> for GatewayError {
    fn from(err: VerifyError) -> Self {
        match err {
            VerifyError::Unauthorized { message } => Self::Unauthorized(message),
            VerifyError::Forbidden { message } => Self::InvalidToken(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(GatewayError::MissingToken.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            GatewayError::from(VerifyError::unauthorized("empty")).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::from(VerifyError::forbidden("expired")).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::from(CredentialError::Mint("down".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GatewayError::DownstreamUnreachable("refused".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_client_errors() {
        assert!(GatewayError::MissingToken.is_client_error());
        assert!(GatewayError::InvalidToken("bad".into()).is_client_error());
        assert!(!GatewayError::Internal("oops".into()).is_client_error());
    }
}
