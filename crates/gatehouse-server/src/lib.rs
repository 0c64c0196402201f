//! # gatehouse-server
//!
//! HTTP surface of the gatehouse authentication gateway: configuration
//! loading, logging, the `/hello` proxy route and the `/health` check.

pub mod config;
pub mod gateway;
pub mod handlers;
pub mod middleware;
pub mod observability;
pub mod server;

pub use config::AppConfig;
pub use gateway::{ProxyOutcome, RequestPipeline};
pub use server::{AppState, GatehouseServer, ServerBuilder, build_app, build_pipeline};
