use axum::http::HeaderName;
use gatehouse_auth::{AuthConfig, ConfigError};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use url::Url;

use crate::observability::LOG_LEVELS;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub downstream: DownstreamConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Inbound verification and outbound credential settings
    #[serde(default)]
    pub auth: AuthConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server.port must be > 0".into()));
        }
        if self.server.host.parse::<IpAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "server.host must be an IP address, got {:?}",
                self.server.host
            )));
        }
        if self.server.body_limit_bytes == 0 {
            return Err(ConfigError::Invalid(
                "server.body_limit_bytes must be > 0".into(),
            ));
        }

        self.downstream_url()?;
        if self.downstream.timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "downstream.timeout must be > 0".into(),
            ));
        }
        self.identity_header()?;

        let lvl = self.logging.level.to_ascii_lowercase();
        if !LOG_LEVELS.contains(&lvl.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "logging.level must be one of {LOG_LEVELS:?}"
            )));
        }

        self.auth.validate()
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::Ipv4Addr;
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        SocketAddr::from((host, self.server.port))
    }

    /// The downstream target URL.
    pub fn downstream_url(&self) -> Result<Url, ConfigError> {
        let raw = self
            .downstream
            .url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| {
                ConfigError::MissingRequiredSetting(
                    "downstream.url (or HELLO_SERVICE_URL)".into(),
                )
            })?;
        let url = Url::parse(raw)
            .map_err(|e| ConfigError::Invalid(format!("downstream.url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid(
                "downstream.url must be an http(s) URL".into(),
            ));
        }
        Ok(url)
    }

    /// Audience the service credential is minted for; defaults to the downstream URL.
    pub fn downstream_audience(&self) -> Result<String, ConfigError> {
        match self.downstream.audience.as_deref().filter(|a| !a.is_empty()) {
            Some(audience) => Ok(audience.to_string()),
            None => {
                let raw = self.downstream.url.as_deref().unwrap_or_default();
                // Use the URL as written; Url normalization would add a trailing slash.
                self.downstream_url()?;
                Ok(raw.to_string())
            }
        }
    }

    /// Header that carries the verified subject to the downstream service.
    pub fn identity_header(&self) -> Result<HeaderName, ConfigError> {
        HeaderName::from_bytes(self.downstream.identity_header.as_bytes()).map_err(|_| {
            ConfigError::Invalid(format!(
                "downstream.identity_header is not a valid header name: {:?}",
                self.downstream.identity_header
            ))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum accepted request body size
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_body_limit() -> usize {
    1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownstreamConfig {
    /// Base URL of the internal service
    #[serde(default)]
    pub url: Option<String>,
    /// Audience for the service credential (defaults to `url`)
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default = "default_downstream_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_identity_header")]
    pub identity_header: String,
}

fn default_downstream_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_identity_header() -> String {
    "x-user-id".into()
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            url: None,
            audience: None,
            timeout: default_downstream_timeout(),
            identity_header: default_identity_header(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use gatehouse_auth::ConfigError;
    use std::path::PathBuf;

    /// Plain variables from the original deployment, used only when nothing else sets them.
    const LEGACY_DEFAULTS: &[(&str, &str)] =
        &[("HELLO_SERVICE_URL", "downstream.url"), ("PORT", "server.port")];

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, ConfigError> {
        let mut builder = Config::builder();

        for (var, key) in LEGACY_DEFAULTS {
            if let Ok(value) = std::env::var(var)
                && !value.is_empty()
            {
                builder = builder
                    .set_default(*key, value)
                    .map_err(|e| ConfigError::Load(e.to_string()))?;
            }
        }

        let pathbuf = PathBuf::from(path.unwrap_or("gatehouse.toml"));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }

        // Environment variable overrides, e.g., GATEHOUSE__DOWNSTREAM__URL=https://hello.internal
        builder = builder.add_source(
            Environment::with_prefix("GATEHOUSE")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| ConfigError::Load(format!("config build error: {e}")))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| ConfigError::Load(format!("config deserialize error: {e}")))?;
        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_url(url: &str) -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.downstream.url = Some(url.to_string());
        cfg.auth.identity.project_id = Some("demo".into());
        cfg
    }

    #[test]
    fn defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.server.body_limit_bytes, 1024 * 1024);
        assert_eq!(cfg.downstream.timeout, Duration::from_secs(30));
        assert_eq!(cfg.downstream.identity_header, "x-user-id");
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn missing_downstream_url_is_required_setting() {
        let mut cfg = with_url("");
        cfg.downstream.url = None;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::MissingRequiredSetting(_))
        ));
    }

    #[test]
    fn audience_defaults_to_url_as_written() {
        let cfg = with_url("https://hello.internal");
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.downstream_audience().unwrap(), "https://hello.internal");

        let mut cfg = with_url("https://hello.internal/api");
        cfg.downstream.audience = Some("https://hello.internal".into());
        assert_eq!(cfg.downstream_audience().unwrap(), "https://hello.internal");
    }

    #[test]
    fn rejects_bad_values() {
        assert!(with_url("ftp://hello.internal").validate().is_err());
        assert!(with_url("not a url").validate().is_err());

        let mut cfg = with_url("https://hello.internal");
        cfg.downstream.identity_header = "bad header".into();
        assert!(cfg.validate().is_err());

        let mut cfg = with_url("https://hello.internal");
        cfg.logging.level = "verbose".into();
        assert!(cfg.validate().is_err());

        let mut cfg = with_url("https://hello.internal");
        cfg.server.host = "localhost:80".into();
        assert!(cfg.validate().is_err());
    }
}
