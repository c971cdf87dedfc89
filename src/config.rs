//! Configuration file for the `gbfs-loader` binary (default `./gbfs.toml`).
//!
//! Lists the systems to subscribe to and how often to tick. Unknown top-level
//! keys are accepted but logged, since they are usually typos.
//!
//! ```toml
//! interval_secs = 10
//!
//! [[systems]]
//! name = "oslo"
//! url = "https://gbfs.urbansharing.com/oslobysykkel.no/gbfs.json"
//! version = "2"
//! language = "en"
//!
//! [systems.headers]
//! Client-Identifier = "acme-journeyplanner"
//!
//! [systems.auth]
//! type = "bearer"
//! token = "..."
//! ```
use gbfs_loader::auth::{BearerTokenAuthenticator, OAuth2ClientCredentials, RequestAuthenticator};
use gbfs_loader::{GbfsVersion, SubscriptionOptions};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid URL for system '{system}': {url}")]
    InvalidUrl { system: String, url: String },
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seconds between ticks.
    pub interval_secs: u64,

    /// Worker threads for the refresh runtime. Defaults to the number of cores.
    pub worker_threads: Option<usize>,

    /// How long shutdown waits for each in-flight refresh.
    pub unsubscribe_timeout_secs: u64,

    pub systems: Vec<SystemConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            worker_threads: None,
            unsubscribe_timeout_secs: 30,
            systems: Vec::new(),
        }
    }
}

/// One GBFS system to subscribe to.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    /// Label used in logs
    pub name: String,
    /// Discovery file URL
    pub url: String,
    #[serde(default = "default_version")]
    pub version: GbfsVersion,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub minimum_ttl: i64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub validate: bool,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

fn default_version() -> GbfsVersion {
    GbfsVersion::V2
}

fn default_timeout_ms() -> u64 {
    5000
}

/// Credentials for a system. Secrets are masked in Debug output.
#[derive(Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    Bearer {
        token: String,
    },
    #[serde(rename = "oauth2")]
    OAuth2 {
        token_url: String,
        client_id: String,
        client_secret: String,
        #[serde(default)]
        scope: Option<String>,
    },
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthConfig::Bearer { .. } => f
                .debug_struct("Bearer")
                .field("token", &"[REDACTED]")
                .finish(),
            AuthConfig::OAuth2 {
                token_url,
                client_id,
                scope,
                ..
            } => f
                .debug_struct("OAuth2")
                .field("token_url", token_url)
                .field("client_id", client_id)
                .field("client_secret", &"[REDACTED]")
                .field("scope", scope)
                .finish(),
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Err(ConfigError::Io)`
    /// - Empty file → `Ok(Config::default())`, which has no systems
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let meta = std::fs::metadata(path)?;
        if meta.len() > Self::MAX_FILE_SIZE {
            return Err(ConfigError::TooLarge(format!(
                "Config file is {} bytes (max {} bytes)",
                meta.len(),
                Self::MAX_FILE_SIZE
            )));
        }

        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            tracing::warn!(path = %path.display(), "Config file is empty, no systems configured");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            let known_keys = [
                "interval_secs",
                "worker_threads",
                "unsubscribe_timeout_secs",
                "systems",
            ];
            for key in raw.keys() {
                if !known_keys.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        if config.systems.is_empty() {
            tracing::warn!(path = %path.display(), "No systems configured");
        }
        tracing::info!(
            path = %path.display(),
            systems = config.systems.len(),
            interval_secs = config.interval_secs,
            "Loaded configuration"
        );
        Ok(config)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn unsubscribe_timeout(&self) -> Duration {
        Duration::from_secs(self.unsubscribe_timeout_secs)
    }
}

impl SystemConfig {
    /// Subscription options for this system; `client` is used for OAuth2
    /// token requests.
    pub fn to_options(&self, client: &reqwest::Client) -> Result<SubscriptionOptions, ConfigError> {
        let url = Url::parse(&self.url).map_err(|_| ConfigError::InvalidUrl {
            system: self.name.clone(),
            url: self.url.clone(),
        })?;

        let mut options = SubscriptionOptions::new(url)
            .with_minimum_ttl(self.minimum_ttl)
            .with_headers(self.headers.clone())
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_validation(self.validate);
        if let Some(language) = &self.language {
            options = options.with_language(language.clone());
        }
        if let Some(auth) = &self.auth {
            options = options.with_authenticator(self.authenticator(auth, client)?);
        }
        Ok(options)
    }

    fn authenticator(
        &self,
        auth: &AuthConfig,
        client: &reqwest::Client,
    ) -> Result<Arc<dyn RequestAuthenticator>, ConfigError> {
        Ok(match auth {
            AuthConfig::Bearer { token } => Arc::new(BearerTokenAuthenticator::new(token.clone())),
            AuthConfig::OAuth2 {
                token_url,
                client_id,
                client_secret,
                scope,
            } => {
                let token_url = Url::parse(token_url).map_err(|_| ConfigError::InvalidUrl {
                    system: self.name.clone(),
                    url: token_url.clone(),
                })?;
                Arc::new(OAuth2ClientCredentials::new(
                    client.clone(),
                    token_url,
                    client_id.clone(),
                    client_secret.clone(),
                    scope.clone(),
                ))
            }
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
