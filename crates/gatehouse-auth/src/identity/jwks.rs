//! Remote JWKS key source.
//!
//! Fetches the JSON Web Key Set published by the token issuer and caches it
//! so that verification does not cost a network round trip per request.
//!
//! # Cache-Control Support
//!
//! The cache honours `Cache-Control: max-age=X` from the issuer (Google's
//! securetoken endpoint rotates keys and advertises how long they are valid).
//! The TTL is clamped to configurable minimum and maximum bounds.
//!
//! # Refresh Policy
//!
//! - An expired cache is refetched on the next lookup.
//! - A refetch happens at most once per `min_refresh_interval`, whatever the
//!   cache state, so forged key IDs or an unreachable endpoint cannot force a
//!   fetch per request. Callers inside the interval see the last fetch result.
//! - Concurrent refetches collapse into one request.
//! - While a refetch is failing, keys from the expired set are still served.
//!
//! # Example
//!
//! ```ignore
//! use gatehouse_auth::identity::{JwksConfig, JwksKeySource};
//!
//! let uri = Url::parse("https://www.googleapis.com/service_accounts/v1/jwk/securetoken@system.gserviceaccount.com")?;
//! let keys = JwksKeySource::new(uri, JwksConfig::default())?;
//! let key = keys.decoding_key(Some("kid-1"), Algorithm::RS256).await?;
//! ```

use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::jwk::{Jwk, JwkSet, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey};
use tokio::sync::{Mutex, RwLock};
use url::Url;

use super::keys::{KeyError, KeySource};

/// Google's JWKS endpoint for Firebase ID tokens.
pub const FIREBASE_JWKS_URL: &str =
    "https://www.googleapis.com/service_accounts/v1/jwk/securetoken@system.gserviceaccount.com";

/// Configuration for the JWKS key source.
#[derive(Debug, Clone)]
pub struct JwksConfig {
    /// Default TTL when Cache-Control header is absent (default: 1 hour).
    pub default_ttl: Duration,

    /// Maximum TTL regardless of Cache-Control (default: 24 hours).
    pub max_ttl: Duration,

    /// Minimum TTL regardless of Cache-Control (default: 5 minutes).
    pub min_ttl: Duration,

    /// HTTP request timeout (default: 10 seconds).
    pub request_timeout: Duration,

    /// Maximum response size in bytes (default: 1 MB).
    pub max_response_size: usize,

    /// Minimum time between refetches triggered by an unknown `kid` (default: 30 seconds).
    pub min_refresh_interval: Duration,

    /// Whether to allow HTTP (non-HTTPS) JWKS URIs.
    /// This should only be enabled for testing.
    pub allow_http: bool,
}

impl Default for JwksConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            max_ttl: Duration::from_secs(86400),
            min_ttl: Duration::from_secs(300),
            request_timeout: Duration::from_secs(10),
            max_response_size: 1024 * 1024,
            min_refresh_interval: Duration::from_secs(30),
            allow_http: false,
        }
    }
}

impl JwksConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default TTL (used when Cache-Control is absent).
    #[must_use]
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Sets the maximum TTL.
    #[must_use]
    pub fn with_max_ttl(mut self, ttl: Duration) -> Self {
        self.max_ttl = ttl;
        self
    }

    /// Sets the minimum TTL.
    #[must_use]
    pub fn with_min_ttl(mut self, ttl: Duration) -> Self {
        self.min_ttl = ttl;
        self
    }

    /// Sets the HTTP request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the maximum response size.
    #[must_use]
    pub fn with_max_response_size(mut self, size: usize) -> Self {
        self.max_response_size = size;
        self
    }

    /// Sets the minimum interval between unknown-`kid` refetches.
    #[must_use]
    pub fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    /// Allows HTTP (non-HTTPS) JWKS URIs. Testing only.
    #[must_use]
    pub fn with_allow_http(mut self, allow: bool) -> Self {
        self.allow_http = allow;
        self
    }
}

/// Errors that can occur while fetching a JWKS.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JwksError {
    /// A network error occurred while fetching the JWKS.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The HTTP request returned a non-success status code.
    #[error("HTTP error: status {0}")]
    HttpError(u16),

    /// The JWKS response could not be parsed as JSON.
    #[error("Failed to parse JWKS: {0}")]
    ParseError(String),

    /// The JWKS URI scheme is not allowed (must be HTTPS in production).
    #[error("Invalid URL scheme: only HTTPS is allowed")]
    InvalidScheme,

    /// The response exceeded the maximum allowed size.
    #[error("Response exceeds maximum size of {max_size} bytes")]
    ResponseTooLarge {
        /// The maximum allowed size.
        max_size: usize,
    },

    /// The HTTP client could not be created.
    #[error("HTTP client error: {0}")]
    Client(String),
}

impl From<JwksError> for KeyError {
    fn from(err: JwksError) -> Self {
        KeyError::Unavailable(err.to_string())
    }
}

/// Cached JWKS entry with metadata.
struct CachedJwks {
    jwks: JwkSet,
    expires_at: Instant,
}

/// Outcome of the most recent fetch attempt.
#[derive(Default)]
struct FetchState {
    at: Option<Instant>,
    error: Option<JwksError>,
}

/// Key source backed by a remote JWKS endpoint.
pub struct JwksKeySource {
    http_client: reqwest::Client,
    jwks_uri: Url,
    cache: RwLock<Option<CachedJwks>>,
    /// Serializes refetches and remembers how the last one went.
    last_fetch: Mutex<FetchState>,
    config: JwksConfig,
}

impl JwksKeySource {
    /// Creates a new JWKS key source.
    ///
    /// # Errors
    /// Returns an error if the URI scheme is not allowed or the HTTP client
    /// cannot be built.
    pub fn new(jwks_uri: Url, config: JwksConfig) -> Result<Self, JwksError> {
        validate_scheme(&jwks_uri, config.allow_http)?;

        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| JwksError::Client(e.to_string()))?;

        Ok(Self {
            http_client,
            jwks_uri,
            cache: RwLock::new(None),
            last_fetch: Mutex::new(FetchState::default()),
            config,
        })
    }

    /// Looks up a key in the cache without fetching.
    ///
    /// Expired entries are ignored unless `allow_stale` is set.
    async fn cached_key(
        &self,
        kid: Option<&str>,
        alg: Algorithm,
        allow_stale: bool,
    ) -> Option<DecodingKey> {
        let cache = self.cache.read().await;
        let cached = cache.as_ref()?;
        if !allow_stale && Instant::now() >= cached.expires_at {
            return None;
        }

        let mut candidates = cached.jwks.keys.iter().filter(|jwk| {
            !matches!(
                &jwk.common.public_key_use,
                Some(PublicKeyUse::Encryption)
            ) && jwk_algorithm(jwk).is_none_or(|a| a == alg)
        });

        let jwk = match kid {
            Some(kid) => candidates.find(|jwk| jwk.common.key_id.as_deref() == Some(kid)),
            // Without a kid only an unambiguous key set can be used.
            None => {
                let first = candidates.next();
                if candidates.next().is_some() {
                    None
                } else {
                    first
                }
            }
        }?;

        DecodingKey::from_jwk(jwk).ok()
    }

    /// Refetches the JWKS unless another task already tried recently.
    ///
    /// Inside `min_refresh_interval` the previous attempt's result is returned
    /// instead, so callers queued behind a failing fetch fail fast.
    async fn refresh_if_due(&self) -> Result<(), JwksError> {
        let mut last_fetch = self.last_fetch.lock().await;

        if let Some(at) = last_fetch.at
            && at.elapsed() < self.config.min_refresh_interval
        {
            tracing::trace!(uri = %self.jwks_uri, "Skipping JWKS refetch, fetched recently");
            return match &last_fetch.error {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            };
        }

        let result = self.refresh().await;
        last_fetch.at = Some(Instant::now());
        last_fetch.error = result.as_ref().err().cloned();
        result
    }

    /// Fetches the JWKS from the endpoint and replaces the cached copy.
    ///
    /// # Errors
    /// Returns an error if the request fails or the body is not a JWKS.
    pub async fn refresh(&self) -> Result<(), JwksError> {
        tracing::debug!(uri = %self.jwks_uri, "Fetching JWKS");

        let response = self
            .http_client
            .get(self.jwks_uri.as_str())
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(uri = %self.jwks_uri, error = %e, "Failed to fetch JWKS");
                JwksError::NetworkError(e.to_string())
            })?;

        if !response.status().is_success() {
            tracing::warn!(
                uri = %self.jwks_uri,
                status = %response.status(),
                "JWKS endpoint returned an error"
            );
            return Err(JwksError::HttpError(response.status().as_u16()));
        }

        if let Some(len) = response.content_length()
            && len as usize > self.config.max_response_size
        {
            return Err(JwksError::ResponseTooLarge {
                max_size: self.config.max_response_size,
            });
        }

        let ttl = self.parse_cache_control(response.headers());

        let body = response
            .bytes()
            .await
            .map_err(|e| JwksError::NetworkError(e.to_string()))?;
        if body.len() > self.config.max_response_size {
            return Err(JwksError::ResponseTooLarge {
                max_size: self.config.max_response_size,
            });
        }

        let jwks: JwkSet = serde_json::from_slice(&body).map_err(|e| {
            tracing::warn!(uri = %self.jwks_uri, error = %e, "Failed to parse JWKS");
            JwksError::ParseError(e.to_string())
        })?;

        tracing::debug!(
            uri = %self.jwks_uri,
            keys = jwks.keys.len(),
            ttl = ?ttl,
            "Cached JWKS"
        );

        *self.cache.write().await = Some(CachedJwks {
            jwks,
            expires_at: Instant::now() + ttl,
        });

        Ok(())
    }

    /// Parses Cache-Control header to determine TTL.
    ///
    /// Extracts `max-age` and clamps it between `min_ttl` and `max_ttl`.
    /// Returns `default_ttl` if no Cache-Control header or max-age is present.
    fn parse_cache_control(&self, headers: &reqwest::header::HeaderMap) -> Duration {
        let ttl = headers
            .get(reqwest::header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| {
                v.split(',').find_map(|directive| {
                    directive
                        .trim()
                        .strip_prefix("max-age=")
                        .and_then(|secs| secs.parse::<u64>().ok())
                })
            })
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_ttl);

        ttl.min(self.config.max_ttl).max(self.config.min_ttl)
    }
}

#[async_trait]
impl KeySource for JwksKeySource {
    async fn decoding_key(
        &self,
        kid: Option<&str>,
        alg: Algorithm,
    ) -> Result<DecodingKey, KeyError> {
        if let Some(key) = self.cached_key(kid, alg, false).await {
            tracing::trace!(kid = ?kid, "JWKS cache hit");
            return Ok(key);
        }

        tracing::debug!(kid = ?kid, uri = %self.jwks_uri, "JWKS cache miss");
        if let Err(err) = self.refresh_if_due().await {
            return match self.cached_key(kid, alg, true).await {
                Some(key) => {
                    tracing::debug!(kid = ?kid, error = %err, "Serving expired JWKS key");
                    Ok(key)
                }
                None => Err(err.into()),
            };
        }

        self.cached_key(kid, alg, false).await.ok_or_else(|| KeyError::KeyNotFound {
            kid: kid.map(ToString::to_string),
        })
    }
}

fn validate_scheme(uri: &Url, allow_http: bool) -> Result<(), JwksError> {
    match uri.scheme() {
        "https" => Ok(()),
        "http" if allow_http => Ok(()),
        _ => Err(JwksError::InvalidScheme),
    }
}

/// Extracts the algorithm from a JWK.
fn jwk_algorithm(jwk: &Jwk) -> Option<Algorithm> {
    use jsonwebtoken::jwk::KeyAlgorithm;

    jwk.common.key_algorithm.as_ref().and_then(|alg| match alg {
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        _ => None,
    })
}
