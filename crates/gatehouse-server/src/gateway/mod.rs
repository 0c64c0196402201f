//! Authenticating reverse proxy.
//!
//! A request passes through three fallible stages, short-circuiting on the
//! first failure:
//!
//! 1. Bearer token extraction and verification ([`RequestPipeline`])
//! 2. Service credential acquisition (`ServiceCredentialCache`)
//! 3. Forwarding to the downstream service ([`ProxyForwarder`])
//!
//! Every path ends in a [`ProxyOutcome`], which is what the HTTP layer turns
//! into a response.

pub mod error;
pub mod forwarder;
pub mod outcome;
pub mod pipeline;

pub use error::GatewayError;
pub use forwarder::{Forwarder, ProxyForwarder};
pub use outcome::ProxyOutcome;
pub use pipeline::{RequestPipeline, extract_bearer};
