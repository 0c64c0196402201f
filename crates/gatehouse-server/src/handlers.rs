use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode},
    response::IntoResponse,
};

use crate::gateway::ProxyOutcome;
use crate::server::AppState;

/// Liveness check; never touches auth or downstream.
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Verifies the caller and relays the request to the downstream service.
///
/// If the client disconnects, this future is dropped together with any
/// in-flight downstream call. A credential mint shared with other requests
/// keeps running for them.
pub async fn hello(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> ProxyOutcome {
    state.pipeline.handle(method, &headers, body).await
}
