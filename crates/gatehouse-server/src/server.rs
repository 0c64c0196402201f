use std::future::Future;
use std::{net::SocketAddr, sync::Arc};

use axum::{Router, middleware, routing::get};
use gatehouse_auth::ConfigError;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::gateway::{ProxyForwarder, RequestPipeline};
use crate::{config::AppConfig, handlers, middleware as app_middleware};

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<RequestPipeline>,
}

pub struct GatehouseServer {
    addr: SocketAddr,
    app: Router,
    target: String,
}

pub fn build_app(state: AppState, body_limit: usize) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/hello", get(handlers::hello))
        .with_state(state)
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    let req_id = req
                        .extensions()
                        .get::<axum::http::HeaderValue>()
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri().path(),
                        http.status_code = tracing::field::Empty,
                        request_id = %req_id
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &tracing::Span| {
                        span.record(
                            "http.status_code",
                            tracing::field::display(res.status().as_u16()),
                        );
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        // Outermost, so the trace span already sees the request id.
        .layer(middleware::from_fn(app_middleware::request_id))
}

/// Assembles the request pipeline described by `cfg`.
///
/// The credential cache is created here, once, and shared by every request.
pub fn build_pipeline(cfg: &AppConfig) -> Result<RequestPipeline, ConfigError> {
    let target = cfg.downstream_url()?;
    let audience = cfg.downstream_audience()?;
    let auth = cfg.auth.build()?;

    let forwarder = ProxyForwarder::new(cfg.downstream.timeout, cfg.identity_header()?)
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;

    Ok(RequestPipeline::new(
        auth.verifier,
        auth.credentials,
        Arc::new(forwarder),
        target,
        audience,
    ))
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
    pipeline: Option<Arc<RequestPipeline>>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
            pipeline: None,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    /// Uses a prebuilt pipeline instead of building one from the configuration.
    pub fn with_pipeline(mut self, pipeline: Arc<RequestPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn build(self) -> Result<GatehouseServer, ConfigError> {
        let pipeline = match self.pipeline {
            Some(p) => p,
            None => Arc::new(build_pipeline(&self.config)?),
        };
        let target = pipeline.target().to_string();
        let app = build_app(AppState { pipeline }, self.config.server.body_limit_bytes);

        Ok(GatehouseServer {
            addr: self.addr,
            app,
            target,
        })
    }
}

impl GatehouseServer {
    pub fn router(&self) -> Router {
        self.app.clone()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serves on an already-bound listener until `shutdown` resolves.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(downstream = %self.target, "listening on {}", addr);
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown)
            .await?;
        tracing::info!("server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
