//! Configuration loading for the credential hub.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `CREDHUB_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENV_PREFIX: &str = "CREDHUB_";

/// Application configuration derived from `CREDHUB_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    /// Decoded 32-byte credential encryption key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto_key: Option<Vec<u8>>,
    #[serde(default)]
    pub lock_backend: LockBackend,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_webhooks_enabled")]
    pub webhooks_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_templates_path: Option<PathBuf>,
    #[serde(default = "default_stale_connection_days")]
    pub stale_connection_days: u32,
}

/// Where refresh locks live
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    /// Shared `locks` table, visible to every instance
    #[default]
    Database,
    /// In-process map, for single-instance deployments
    Memory,
}

impl std::str::FromStr for LockBackend {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "database" | "db" => Ok(LockBackend::Database),
            "memory" | "in-memory" => Ok(LockBackend::Memory),
            other => Err(ConfigError::InvalidLockBackend {
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RefreshConfig {
    /// Refresh lock TTL in milliseconds (default: 10000)
    #[serde(default = "default_refresh_lock_ttl_ms")]
    pub lock_ttl_ms: u64,

    /// Expiry buffer for templates that declare none (default: 900)
    #[serde(default = "default_refresh_expiration_buffer_seconds")]
    pub default_expiration_buffer_seconds: i64,
}

impl RefreshConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    /// Validate refresh lock and buffer bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1_000..=60_000).contains(&self.lock_ttl_ms) {
            return Err(ConfigError::InvalidRefreshLockTtl {
                value: self.lock_ttl_ms,
            });
        }

        if !(0..=86_400).contains(&self.default_expiration_buffer_seconds) {
            return Err(ConfigError::InvalidExpirationBuffer {
                value: self.default_expiration_buffer_seconds,
            });
        }

        Ok(())
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            lock_ttl_ms: default_refresh_lock_ttl_ms(),
            default_expiration_buffer_seconds: default_refresh_expiration_buffer_seconds(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            crypto_key: None,
            lock_backend: LockBackend::default(),
            refresh: RefreshConfig::default(),
            http_timeout_seconds: default_http_timeout_seconds(),
            webhooks_enabled: default_webhooks_enabled(),
            provider_templates_path: None,
            stale_connection_days: default_stale_connection_days(),
        }
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// `local` and `test` profiles relax required settings
    pub fn is_development(&self) -> bool {
        matches!(self.profile.as_str(), "local" | "test")
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if config.crypto_key.is_some() {
            config.crypto_key = Some(b"[REDACTED]".to_vec());
        }
        if let Some(redacted) = redact_database_password(&config.database_url) {
            config.database_url = redacted;
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.crypto_key {
            Some(ref key) if key.len() != 32 => {
                return Err(ConfigError::InvalidCryptoKeyLength { length: key.len() });
            }
            None if !self.is_development() => return Err(ConfigError::MissingCryptoKey),
            _ => {}
        }

        if self.database_url.is_empty() {
            return Err(ConfigError::MissingDatabaseUrl);
        }

        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }

        if self.http_timeout_seconds == 0 {
            return Err(ConfigError::InvalidHttpTimeout {
                value: self.http_timeout_seconds,
            });
        }

        self.refresh.validate()?;

        Ok(())
    }
}

fn redact_database_password(database_url: &str) -> Option<String> {
    let mut parsed = url::Url::parse(database_url).ok()?;
    parsed.password()?;
    parsed.set_password(Some("[REDACTED]")).ok()?;
    Some(parsed.to_string())
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite::memory:".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_refresh_lock_ttl_ms() -> u64 {
    10_000
}

fn default_refresh_expiration_buffer_seconds() -> i64 {
    900
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_webhooks_enabled() -> bool {
    true
}

fn default_stale_connection_days() -> u32 {
    30
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("crypto key is missing; set CREDHUB_CRYPTO_KEY environment variable")]
    MissingCryptoKey,
    #[error("crypto key is invalid base64: {error}")]
    InvalidCryptoKeyBase64 { error: String },
    #[error("crypto key must decode to exactly 32 bytes, got {length} bytes")]
    InvalidCryptoKeyLength { length: usize },
    #[error("database url is missing; set CREDHUB_DATABASE_URL environment variable")]
    MissingDatabaseUrl,
    #[error("log format must be 'json' or 'pretty', got '{value}'")]
    InvalidLogFormat { value: String },
    #[error("lock backend must be 'database' or 'memory', got '{value}'")]
    InvalidLockBackend { value: String },
    #[error("refresh lock TTL must be between 1000 and 60000 ms, got {value}")]
    InvalidRefreshLockTtl { value: u64 },
    #[error("default expiration buffer must be between 0 and 86400 seconds, got {value}")]
    InvalidExpirationBuffer { value: i64 },
    #[error("http timeout must be at least 1 second, got {value}")]
    InvalidHttpTimeout { value: u64 },
    #[error("invalid boolean for {key}: '{value}'")]
    InvalidBool { key: String, value: String },
}

/// Loads configuration from layered `.env` files and the process environment.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads `.env`, `.env.local`, `.env.{profile}`, `.env.{profile}.local`, then
    /// the process environment, later layers winning.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);
        let api_bind_addr = layered
            .remove("API_BIND_ADDR")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_api_bind_addr);
        let log_level = layered
            .remove("LOG_LEVEL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_level);
        let log_format = layered
            .remove("LOG_FORMAT")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_format);
        let is_development = matches!(profile.as_str(), "local" | "test");
        let database_url = layered
            .remove("DATABASE_URL")
            .filter(|v| !v.is_empty())
            .or_else(|| is_development.then(default_database_url))
            .unwrap_or_default();
        let db_max_connections = layered
            .remove("DB_MAX_CONNECTIONS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = layered
            .remove("DB_ACQUIRE_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_acquire_timeout_ms);

        let crypto_key = match layered.remove("CRYPTO_KEY").filter(|v| !v.is_empty()) {
            Some(key_str) => {
                use base64::{Engine as _, engine::general_purpose};
                Some(general_purpose::STANDARD.decode(key_str.trim()).map_err(|e| {
                    ConfigError::InvalidCryptoKeyBase64 {
                        error: e.to_string(),
                    }
                })?)
            }
            None => None,
        };

        let lock_backend = match layered.remove("LOCK_BACKEND").filter(|v| !v.is_empty()) {
            Some(value) => value.parse()?,
            None => LockBackend::default(),
        };

        let refresh = RefreshConfig {
            lock_ttl_ms: layered
                .remove("REFRESH_LOCK_TTL_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_refresh_lock_ttl_ms),
            default_expiration_buffer_seconds: layered
                .remove("REFRESH_DEFAULT_EXPIRATION_BUFFER_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_refresh_expiration_buffer_seconds),
        };

        let http_timeout_seconds = layered
            .remove("HTTP_TIMEOUT_SECONDS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_http_timeout_seconds);

        let webhooks_enabled = match layered.remove("WEBHOOKS_ENABLED").filter(|v| !v.is_empty())
        {
            Some(value) => parse_bool(&value).ok_or_else(|| ConfigError::InvalidBool {
                key: "WEBHOOKS_ENABLED".to_string(),
                value,
            })?,
            None => default_webhooks_enabled(),
        };

        let provider_templates_path = layered
            .remove("PROVIDER_TEMPLATES_PATH")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let stale_connection_days = layered
            .remove("STALE_CONNECTION_DAYS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_stale_connection_days);

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            crypto_key,
            lock_backend,
            refresh,
            http_timeout_seconds,
            webhooks_enabled,
            provider_templates_path,
            stale_connection_days,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
