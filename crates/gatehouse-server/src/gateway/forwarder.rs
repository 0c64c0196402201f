//! Forwarding verified requests to the downstream service.

use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, header};
use gatehouse_auth::{ServiceCredential, VerifiedIdentity};
use tracing::{debug, warn};
use url::Url;

use super::error::GatewayError;
use super::outcome::ProxyOutcome;

/// Sends a verified request downstream and reports how it went.
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Forwards one request.
    ///
    /// Transport failures become [`ProxyOutcome::InternalFailure`]; any downstream
    /// response becomes [`ProxyOutcome::Forwarded`] or [`ProxyOutcome::UpstreamFailure`].
    async fn forward(
        &self,
        method: Method,
        target: &Url,
        headers: &HeaderMap,
        body: Bytes,
        credential: &ServiceCredential,
        identity: &VerifiedIdentity,
    ) -> ProxyOutcome;
}

/// HTTP forwarder backed by a shared `reqwest` client.
pub struct ProxyForwarder {
    http_client: reqwest::Client,
    timeout: Duration,
    identity_header: HeaderName,
}

impl ProxyForwarder {
    pub fn new(timeout: Duration, identity_header: HeaderName) -> Result<Self, GatewayError> {
        let http_client = reqwest::Client::builder()
            // 3xx from downstream is relayed, not followed.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::Internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            timeout,
            identity_header,
        })
    }

    /// Builds the outbound header set.
    ///
    /// Client headers are copied minus hop-by-hop ones (including any named in
    /// `Connection`) and the client's own `Authorization`. The service
    /// credential and the identity assertion are inserted last, replacing
    /// anything the client sent under those names.
    pub fn outbound_headers(
        &self,
        inbound: &HeaderMap,
        credential: &ServiceCredential,
        identity: &VerifiedIdentity,
    ) -> Result<HeaderMap, GatewayError> {
        let mut headers = HeaderMap::with_capacity(inbound.len() + 2);
        let connection = connection_tokens(inbound);

        for (name, value) in inbound {
            if is_hop_by_hop_header(name)
                || connection.contains(name)
                || is_request_only_header(name)
            {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        let authorization =
            HeaderValue::from_str(&credential.authorization_value()).map_err(|_| {
                GatewayError::Internal("service credential is not a valid header value".into())
            })?;
        headers.insert(header::AUTHORIZATION, authorization);

        let subject = HeaderValue::from_str(&identity.subject).map_err(|_| {
            GatewayError::Internal("verified subject is not a valid header value".into())
        })?;
        headers.insert(self.identity_header.clone(), subject);

        Ok(headers)
    }

    async fn send(
        &self,
        method: Method,
        target: &Url,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<ProxyOutcome, GatewayError> {
        let response = self
            .http_client
            .request(method, target.clone())
            .headers(headers)
            .body(body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                let reason = if e.is_timeout() {
                    format!("request timed out after {:?}", self.timeout)
                } else if e.is_connect() {
                    format!("failed to connect: {e}")
                } else {
                    format!("request failed: {e}")
                };
                GatewayError::DownstreamUnreachable(reason)
            })?;

        let status = response.status();
        let headers = relayed_headers(response.headers());
        let body = response.bytes().await.map_err(|e| {
            GatewayError::DownstreamUnreachable(format!("failed to read response body: {e}"))
        })?;

        debug!(status = %status, bytes = body.len(), "Downstream responded");
        Ok(ProxyOutcome::relayed(status, headers, body))
    }
}

#[async_trait]
impl Forwarder for ProxyForwarder {
    async fn forward(
        &self,
        method: Method,
        target: &Url,
        headers: &HeaderMap,
        body: Bytes,
        credential: &ServiceCredential,
        identity: &VerifiedIdentity,
    ) -> ProxyOutcome {
        let outbound = match self.outbound_headers(headers, credential, identity) {
            Ok(h) => h,
            Err(cause) => return ProxyOutcome::InternalFailure { cause },
        };

        match self.send(method, target, outbound, body).await {
            Ok(outcome) => outcome,
            Err(cause) => {
                warn!(target_url = %target, error = %cause, "Downstream call failed");
                ProxyOutcome::InternalFailure { cause }
            }
        }
    }
}

/// Response headers worth relaying to the client.
fn relayed_headers(downstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(downstream.len());
    let connection = connection_tokens(downstream);
    for (name, value) in downstream {
        // Length is recomputed from the relayed body.
        if is_hop_by_hop_header(name)
            || connection.contains(name)
            || name == header::CONTENT_LENGTH
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Checks if a header is a hop-by-hop header that should not be forwarded.
///
/// Hop-by-hop headers are defined in RFC 7230 Section 6.1.
fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Header names listed in `Connection`, which apply to this hop only.
fn connection_tokens(headers: &HeaderMap) -> Vec<HeaderName> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect()
}

/// Inbound headers that describe the client's connection to the gateway.
fn is_request_only_header(name: &HeaderName) -> bool {
    name == header::HOST || name == header::CONTENT_LENGTH || name == header::AUTHORIZATION
}
