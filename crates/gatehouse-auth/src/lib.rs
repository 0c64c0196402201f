//! # gatehouse-auth
//!
//! Authentication building blocks for the gatehouse gateway.
//!
//! This crate provides:
//! - Inbound bearer token verification against injected key material
//! - Verification key sources (static keys and remote JWKS)
//! - Outbound service credential minting for a downstream audience
//! - A per-audience, single-flight credential cache
//!
//! ## Modules
//!
//! - [`identity`] - `IdentityVerifier`, JWT verification and key sources
//! - [`credential`] - `ServiceCredential`, minters and `ServiceCredentialCache`
//! - [`config`] - Configuration types that build the components above

pub mod config;
pub mod credential;
pub mod identity;

pub use config::{AuthConfig, ConfigError, CredentialConfig, IdentityConfig};
pub use credential::{
    CredentialError, CredentialMinter, MetadataServerMinter, ServiceAccountKey,
    ServiceAccountMinter, ServiceCredential, ServiceCredentialCache,
};
pub use identity::{
    IdentityVerifier, JwksKeySource, JwtIdentityVerifier, KeyError, KeySource, StaticKeySource,
    VerifiedIdentity, VerifyError,
};
