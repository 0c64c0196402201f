//! Authentication configuration.
//!
//! Deserializable settings for inbound verification (`[auth.identity]`) and
//! outbound credentials (`[auth.credentials]`), plus the builders that turn
//! them into ready-to-use components.
//!
//! # Example (TOML)
//!
//! ```toml
//! [auth.identity]
//! project_id = "my-project"
//! leeway = "60s"
//!
//! [auth.identity.keys]
//! type = "jwks"
//! url = "https://www.googleapis.com/service_accounts/v1/jwk/securetoken@system.gserviceaccount.com"
//!
//! [auth.credentials]
//! refresh_margin = "60s"
//! timeout = "10s"
//!
//! [auth.credentials.source]
//! type = "service_account"
//! path = "/secrets/gateway-sa.json"
//! ```

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::credential::cache::{DEFAULT_MINT_TIMEOUT, DEFAULT_REFRESH_MARGIN};
use crate::credential::metadata::DEFAULT_METADATA_URL;
use crate::credential::{
    CredentialMinter, MetadataServerMinter, ServiceAccountKey, ServiceAccountMinter,
    ServiceCredentialCache,
};
use crate::identity::jwks::FIREBASE_JWKS_URL;
use crate::identity::jwt::firebase_issuer;
use crate::identity::{
    IdentityVerifier, JwksConfig, JwksKeySource, JwtIdentityVerifier, KeySource, StaticKeySource,
};

/// Errors raised while validating configuration or building components from it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A setting the gateway cannot run without is absent.
    #[error("Missing required setting: {0}")]
    MissingRequiredSetting(String),

    /// A setting is present but unusable.
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// The configuration sources could not be read.
    #[error("Failed to load configuration: {0}")]
    Load(String),
}

/// Root authentication configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Inbound token verification.
    pub identity: IdentityConfig,

    /// Outbound service credentials.
    pub credentials: CredentialConfig,
}

/// Inbound token verification settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Firebase project; sets issuer and audience unless they are given explicitly.
    pub project_id: Option<String>,

    /// Expected `iss` claim.
    pub issuer: Option<String>,

    /// Expected `aud` claim.
    pub audience: Option<String>,

    /// Clock skew tolerance.
    #[serde(with = "humantime_serde")]
    pub leeway: Duration,

    /// Where verification keys come from.
    pub keys: KeySourceConfig,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            project_id: None,
            issuer: None,
            audience: None,
            leeway: Duration::from_secs(60),
            keys: KeySourceConfig::default(),
        }
    }
}

/// Verification key material.
#[derive(Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeySourceConfig {
    /// Remote JWKS document.
    Jwks {
        /// JWKS URL.
        #[serde(default = "default_jwks_url")]
        url: String,

        /// Permit plain HTTP (local testing only).
        #[serde(default)]
        allow_http: bool,
    },

    /// A single public key in a PEM file.
    Pem {
        /// Signing algorithm of the key.
        algorithm: Algorithm,

        /// Path to the PEM file.
        path: PathBuf,
    },

    /// A shared HMAC secret (HS256), for development setups.
    Secret {
        /// The secret.
        secret: String,
    },
}

impl Default for KeySourceConfig {
    fn default() -> Self {
        Self::Jwks {
            url: default_jwks_url(),
            allow_http: false,
        }
    }
}

impl fmt::Debug for KeySourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Jwks { url, allow_http } => f
                .debug_struct("Jwks")
                .field("url", url)
                .field("allow_http", allow_http)
                .finish(),
            Self::Pem { algorithm, path } => f
                .debug_struct("Pem")
                .field("algorithm", algorithm)
                .field("path", path)
                .finish(),
            Self::Secret { .. } => f
                .debug_struct("Secret")
                .field("secret", &"[REDACTED]")
                .finish(),
        }
    }
}

fn default_jwks_url() -> String {
    FIREBASE_JWKS_URL.to_string()
}

/// Outbound credential settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Where credentials are minted.
    pub source: CredentialSourceConfig,

    /// How long before expiry a cached credential is replaced.
    #[serde(with = "humantime_serde")]
    pub refresh_margin: Duration,

    /// Upper bound on a single mint, including the HTTP exchange.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            source: CredentialSourceConfig::default(),
            refresh_margin: DEFAULT_REFRESH_MARGIN,
            timeout: DEFAULT_MINT_TIMEOUT,
        }
    }
}

/// Credential minting backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialSourceConfig {
    /// The instance metadata server.
    Metadata {
        /// Metadata server base URL.
        #[serde(default = "default_metadata_url")]
        url: String,
    },

    /// A service account JSON key file.
    ServiceAccount {
        /// Path to the key file.
        path: PathBuf,
    },
}

impl Default for CredentialSourceConfig {
    fn default() -> Self {
        Self::Metadata {
            url: default_metadata_url(),
        }
    }
}

fn default_metadata_url() -> String {
    DEFAULT_METADATA_URL.to_string()
}

/// Components built from an [`AuthConfig`].
pub struct AuthComponents {
    /// Inbound token verifier.
    pub verifier: Arc<dyn IdentityVerifier>,

    /// Outbound credential cache.
    pub credentials: Arc<ServiceCredentialCache>,
}

impl AuthConfig {
    /// Checks the settings without touching the network or the filesystem.
    ///
    /// # Errors
    /// Returns an error if the identity issuer/audience cannot be resolved or a
    /// duration is unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let identity = &self.identity;
        let has_project = identity.project_id.as_deref().is_some_and(|p| !p.is_empty());
        let project_from_file = matches!(
            self.credentials.source,
            CredentialSourceConfig::ServiceAccount { .. }
        );

        if !has_project && !project_from_file {
            if identity.issuer.is_none() {
                return Err(ConfigError::MissingRequiredSetting(
                    "auth.identity.issuer (or auth.identity.project_id)".to_string(),
                ));
            }
            if identity.audience.is_none() {
                return Err(ConfigError::MissingRequiredSetting(
                    "auth.identity.audience (or auth.identity.project_id)".to_string(),
                ));
            }
        }

        if let KeySourceConfig::Secret { secret } = &identity.keys
            && secret.is_empty()
        {
            return Err(ConfigError::Invalid(
                "auth.identity.keys.secret must not be empty".to_string(),
            ));
        }

        if self.credentials.timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "auth.credentials.timeout must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Builds the verifier and the credential cache.
    ///
    /// A service account key file, if configured, is read once and also supplies
    /// the identity project when `auth.identity.project_id` is unset.
    ///
    /// # Errors
    /// Returns an error if key material cannot be loaded or a URL is invalid.
    pub fn build(&self) -> Result<AuthComponents, ConfigError> {
        self.validate()?;

        let service_account = match &self.credentials.source {
            CredentialSourceConfig::ServiceAccount { path } => Some(
                ServiceAccountKey::from_file(path)
                    .map_err(|e| ConfigError::Invalid(e.to_string()))?,
            ),
            CredentialSourceConfig::Metadata { .. } => None,
        };

        let fallback_project = service_account
            .as_ref()
            .and_then(|key| key.project_id.as_deref());
        let verifier = self.identity.build_verifier(fallback_project)?;

        let minter: Arc<dyn CredentialMinter> = match (&self.credentials.source, service_account)
        {
            (_, Some(key)) => Arc::new(
                ServiceAccountMinter::new(key, self.credentials.timeout)
                    .map_err(|e| ConfigError::Invalid(e.to_string()))?,
            ),
            (CredentialSourceConfig::Metadata { url }, None) => {
                let url = parse_url("auth.credentials.source.url", url)?;
                Arc::new(
                    MetadataServerMinter::new(url, self.credentials.timeout)
                        .map_err(|e| ConfigError::Invalid(e.to_string()))?,
                )
            }
            (CredentialSourceConfig::ServiceAccount { .. }, None) => {
                return Err(ConfigError::Invalid(
                    "service account key was not loaded".to_string(),
                ));
            }
        };

        let credentials = ServiceCredentialCache::new(minter)
            .with_refresh_margin(self.credentials.refresh_margin)
            .with_mint_timeout(self.credentials.timeout);

        Ok(AuthComponents {
            verifier,
            credentials: Arc::new(credentials),
        })
    }
}

impl IdentityConfig {
    /// Resolves the expected issuer and audience.
    ///
    /// Explicit `issuer`/`audience` win over the project preset; `fallback_project`
    /// is used when `project_id` is unset.
    ///
    /// # Errors
    /// Returns an error if either value cannot be determined.
    pub fn resolve(&self, fallback_project: Option<&str>) -> Result<(String, String), ConfigError> {
        let project = self
            .project_id
            .as_deref()
            .filter(|p| !p.is_empty())
            .or(fallback_project);

        let issuer = self
            .issuer
            .clone()
            .or_else(|| project.map(firebase_issuer))
            .ok_or_else(|| {
                ConfigError::MissingRequiredSetting(
                    "auth.identity.issuer (or auth.identity.project_id)".to_string(),
                )
            })?;

        let audience = self
            .audience
            .clone()
            .or_else(|| project.map(str::to_string))
            .ok_or_else(|| {
                ConfigError::MissingRequiredSetting(
                    "auth.identity.audience (or auth.identity.project_id)".to_string(),
                )
            })?;

        Ok((issuer, audience))
    }

    /// Builds the key source described by `keys`.
    ///
    /// # Errors
    /// Returns an error if the key material is invalid.
    pub fn build_key_source(&self) -> Result<(Arc<dyn KeySource>, Algorithm), ConfigError> {
        match &self.keys {
            KeySourceConfig::Jwks { url, allow_http } => {
                let url = parse_url("auth.identity.keys.url", url)?;
                let source = JwksKeySource::new(url, JwksConfig::new().with_allow_http(*allow_http))
                    .map_err(|e| ConfigError::Invalid(e.to_string()))?;
                Ok((Arc::new(source), Algorithm::RS256))
            }
            KeySourceConfig::Pem { algorithm, path } => {
                let source = StaticKeySource::from_pem_file(*algorithm, path)
                    .map_err(|e| ConfigError::Invalid(e.to_string()))?;
                Ok((Arc::new(source), *algorithm))
            }
            KeySourceConfig::Secret { secret } => Ok((
                Arc::new(StaticKeySource::hmac(secret.as_bytes())),
                Algorithm::HS256,
            )),
        }
    }

    /// Builds the inbound verifier.
    ///
    /// # Errors
    /// Returns an error if the issuer/audience cannot be resolved or key material is invalid.
    pub fn build_verifier(
        &self,
        fallback_project: Option<&str>,
    ) -> Result<Arc<dyn IdentityVerifier>, ConfigError> {
        let (issuer, audience) = self.resolve(fallback_project)?;
        let (keys, algorithm) = self.build_key_source()?;

        tracing::debug!(issuer = %issuer, audience = %audience, "Identity verifier configured");

        Ok(Arc::new(
            JwtIdentityVerifier::new(keys, issuer, audience)
                .with_algorithms(vec![algorithm])
                .with_leeway(self.leeway),
        ))
    }
}

fn parse_url(setting: &str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|e| ConfigError::Invalid(format!("{setting}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AuthConfig::default();
        assert_eq!(config.identity.leeway, Duration::from_secs(60));
        assert!(matches!(
            config.identity.keys,
            KeySourceConfig::Jwks { ref url, allow_http: false } if url == FIREBASE_JWKS_URL
        ));
        assert!(matches!(
            config.credentials.source,
            CredentialSourceConfig::Metadata { ref url } if url == DEFAULT_METADATA_URL
        ));
        assert_eq!(config.credentials.refresh_margin, Duration::from_secs(60));
        assert_eq!(config.credentials.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_project_preset() {
        let identity = IdentityConfig {
            project_id: Some("demo".to_string()),
            ..Default::default()
        };
        let (issuer, audience) = identity.resolve(None).unwrap();
        assert_eq!(issuer, "https://securetoken.google.com/demo");
        assert_eq!(audience, "demo");
    }

    #[test]
    fn test_explicit_overrides_preset() {
        let identity = IdentityConfig {
            project_id: Some("demo".to_string()),
            audience: Some("custom-aud".to_string()),
            ..Default::default()
        };
        let (issuer, audience) = identity.resolve(Some("ignored")).unwrap();
        assert_eq!(issuer, "https://securetoken.google.com/demo");
        assert_eq!(audience, "custom-aud");
    }

    #[test]
    fn test_fallback_project() {
        let (issuer, audience) = IdentityConfig::default().resolve(Some("from-file")).unwrap();
        assert_eq!(issuer, "https://securetoken.google.com/from-file");
        assert_eq!(audience, "from-file");
    }

    #[test]
    fn test_unresolvable_identity_fails_validation() {
        let err = AuthConfig::default().validate().unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequiredSetting(_)));
    }

    #[test]
    fn test_service_account_source_defers_project() {
        let config = AuthConfig {
            credentials: CredentialConfig {
                source: CredentialSourceConfig::ServiceAccount {
                    path: PathBuf::from("/secrets/sa.json"),
                },
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_secret_rejected() {
        let config = AuthConfig {
            identity: IdentityConfig {
                project_id: Some("demo".to_string()),
                keys: KeySourceConfig::Secret {
                    secret: String::new(),
                },
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_secret_is_redacted() {
        let keys = KeySourceConfig::Secret {
            secret: "hunter2".to_string(),
        };
        assert!(!format!("{keys:?}").contains("hunter2"));
    }

    #[test]
    fn test_build_with_secret_and_metadata() {
        let config = AuthConfig {
            identity: IdentityConfig {
                project_id: Some("demo".to_string()),
                keys: KeySourceConfig::Secret {
                    secret: "dev-secret".to_string(),
                },
                ..Default::default()
            },
            ..Default::default()
        };
        let components = config.build().unwrap();
        assert!(components.credentials.cached("anything").is_none());
    }

    #[test]
    fn test_build_rejects_http_jwks() {
        let config = AuthConfig {
            identity: IdentityConfig {
                project_id: Some("demo".to_string()),
                keys: KeySourceConfig::Jwks {
                    url: "http://keys.example.com/jwks".to_string(),
                    allow_http: false,
                },
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(config.build(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_deserialize_tagged_sources() {
        let config: AuthConfig = serde_json::from_str(
            r#"{
                "identity": {
                    "project_id": "demo",
                    "leeway": "30s",
                    "keys": { "type": "pem", "algorithm": "ES256", "path": "/keys/pub.pem" }
                },
                "credentials": {
                    "source": { "type": "service_account", "path": "/secrets/sa.json" },
                    "refresh_margin": "2m"
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.identity.leeway, Duration::from_secs(30));
        assert!(matches!(
            config.identity.keys,
            KeySourceConfig::Pem {
                algorithm: Algorithm::ES256,
                ..
            }
        ));
        assert!(matches!(
            config.credentials.source,
            CredentialSourceConfig::ServiceAccount { .. }
        ));
        assert_eq!(config.credentials.refresh_margin, Duration::from_secs(120));
        assert_eq!(config.credentials.timeout, Duration::from_secs(10));
    }
}
