//! Terminal result of a gateway request.

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};

use super::error::GatewayError;

/// Body sent for every internal failure; the cause is only logged.
pub const INTERNAL_ERROR_BODY: &str = "Internal Server Error";

/// How a gateway request ended.
#[derive(Debug)]
pub enum ProxyOutcome {
    /// Downstream answered with a 2xx; relayed as is.
    Forwarded {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },

    /// The request was refused before reaching downstream.
    Rejected { code: StatusCode, reason: String },

    /// Downstream answered with a non-2xx; relayed as is.
    UpstreamFailure {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },

    /// The gateway could not complete the request.
    InternalFailure { cause: GatewayError },
}

impl ProxyOutcome {
    /// Wraps a downstream response, choosing the variant by status class.
    pub fn relayed(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        if status.is_success() {
            Self::Forwarded {
                status,
                headers,
                body,
            }
        } else {
            Self::UpstreamFailure {
                status,
                headers,
                body,
            }
        }
    }

    /// Status code the client will see.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Forwarded { status, .. } | Self::UpstreamFailure { status, .. } => *status,
            Self::Rejected { code, .. } => *code,
            Self::InternalFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<GatewayError> for ProxyOutcome {
    fn from(err: GatewayError) -> Self {
        match err.client_reason() {
            Some(reason) => Self::Rejected {
                code: err.status(),
                reason: reason.to_string(),
            },
            None => Self::InternalFailure { cause: err },
        }
    }
}

impl IntoResponse for ProxyOutcome {
    fn into_response(self) -> Response {
        match self {
            Self::Forwarded {
                status,
                headers,
                body,
            }
            | Self::UpstreamFailure {
                status,
                headers,
                body,
            } => (status, headers, body).into_response(),
            Self::Rejected { code, reason } => {
                let mut response = (code, reason).into_response();
                if code == StatusCode::UNAUTHORIZED {
                    response
                        .headers_mut()
                        .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
                }
                response
            }
            Self::InternalFailure { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_BODY).into_response()
            }
        }
    }
}
