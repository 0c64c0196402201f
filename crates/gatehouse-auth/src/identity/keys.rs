//! Verification key sources.

use std::path::Path;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey};

/// Errors that can occur while resolving a verification key.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// No key matches the token's key ID.
    #[error("Key not found: {}", kid.as_deref().unwrap_or("<none>"))]
    KeyNotFound {
        /// The key ID from the token header, if any.
        kid: Option<String>,
    },

    /// The token's algorithm is not served by this key source.
    #[error("Algorithm {0:?} is not accepted by this key source")]
    AlgorithmMismatch(Algorithm),

    /// Key material could not be fetched.
    #[error("Key material unavailable: {0}")]
    Unavailable(String),

    /// Key data is invalid.
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

/// Supplies decoding keys for token verification.
#[async_trait]
pub trait KeySource: Send + Sync {
    /// Returns the key for the given key ID and algorithm.
    async fn decoding_key(&self, kid: Option<&str>, alg: Algorithm)
    -> Result<DecodingKey, KeyError>;
}

/// A single key loaded once at startup.
pub struct StaticKeySource {
    key: DecodingKey,
    algorithm: Algorithm,
}

impl StaticKeySource {
    /// Creates a key source from an already-built decoding key.
    #[must_use]
    pub fn new(key: DecodingKey, algorithm: Algorithm) -> Self {
        Self { key, algorithm }
    }

    /// Creates an HS256 key source from a shared secret.
    #[must_use]
    pub fn hmac(secret: &[u8]) -> Self {
        Self::new(DecodingKey::from_secret(secret), Algorithm::HS256)
    }

    /// Creates a key source from a PEM-encoded public key.
    ///
    /// # Errors
    /// Returns an error if the algorithm is symmetric or the PEM is invalid.
    pub fn from_pem(algorithm: Algorithm, pem: &[u8]) -> Result<Self, KeyError> {
        let key = match algorithm {
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => DecodingKey::from_rsa_pem(pem),
            Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(pem),
            Algorithm::EdDSA => DecodingKey::from_ed_pem(pem),
            other => {
                return Err(KeyError::InvalidKey(format!(
                    "{other:?} is not a public-key algorithm"
                )));
            }
        }
        .map_err(|e| KeyError::InvalidKey(e.to_string()))?;

        Ok(Self::new(key, algorithm))
    }

    /// Reads a PEM-encoded public key from a file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or holds an invalid key.
    pub fn from_pem_file(algorithm: Algorithm, path: &Path) -> Result<Self, KeyError> {
        let pem = std::fs::read(path)
            .map_err(|e| KeyError::InvalidKey(format!("{}: {e}", path.display())))?;
        Self::from_pem(algorithm, &pem)
    }

    /// The algorithm this key verifies.
    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }
}

#[async_trait]
impl KeySource for StaticKeySource {
    async fn decoding_key(
        &self,
        _kid: Option<&str>,
        alg: Algorithm,
    ) -> Result<DecodingKey, KeyError> {
        if alg != self.algorithm {
            return Err(KeyError::AlgorithmMismatch(alg));
        }
        Ok(self.key.clone())
    }
}
