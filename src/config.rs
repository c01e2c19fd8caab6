use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "SCRIBE_CONFIG";

const DEFAULT_JWT_SECRET: &str = "change-this-secret-in-production-please";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_workers() -> usize {
    num_cpus::get()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
}

fn default_database_url() -> String {
    "sqlite::memory:".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
    #[serde(default = "default_access_minutes")]
    pub access_token_minutes: i64,
    #[serde(default = "default_refresh_days")]
    pub refresh_token_days: i64,
}

fn default_jwt_secret() -> String {
    DEFAULT_JWT_SECRET.to_string()
}

fn default_access_minutes() -> i64 {
    60
}

fn default_refresh_days() -> i64 {
    7
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
            access_token_minutes: default_access_minutes(),
            refresh_token_days: default_refresh_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Seconds between expiry sweeps; 0 disables the sweep.
    #[serde(default = "default_sweep_secs")]
    pub expiry_sweep_secs: u64,
    #[serde(default = "default_plan_name")]
    pub default_plan_name: String,
    #[serde(default = "default_plan_price")]
    pub default_plan_price_cents: i64,
    #[serde(default = "default_plan_days")]
    pub default_plan_duration_days: i32,
}

fn default_sweep_secs() -> u64 {
    3600
}

fn default_plan_name() -> String {
    "Premium".to_string()
}

fn default_plan_price() -> i64 {
    999
}

fn default_plan_days() -> i32 {
    30
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            expiry_sweep_secs: default_sweep_secs(),
            default_plan_name: default_plan_name(),
            default_plan_price_cents: default_plan_price(),
            default_plan_duration_days: default_plan_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfig {
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub webhook_secret: String,
}

fn default_currency() -> String {
    "EUR".to_string()
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            currency: default_currency(),
            webhook_secret: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub subscriptions: SubscriptionConfig,
    #[serde(default)]
    pub payments: PaymentConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let display = path.as_ref().display().to_string();
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// `$SCRIBE_CONFIG`, then `Scribe.toml`, then `scribe.toml`, then defaults.
    pub fn load_default() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let config = Self::from_file(&path)?;
            tracing::info!(%path, "loaded configuration");
            return Ok(config);
        }

        for path in ["Scribe.toml", "scribe.toml"] {
            if Path::new(path).exists() {
                let config = Self::from_file(path)?;
                tracing::info!(%path, "loaded configuration");
                return Ok(config);
            }
        }

        tracing::info!("using default configuration");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.jwt_secret.len() < 32 {
            return Err(ConfigError::Invalid(
                "auth.jwt_secret must be at least 32 characters long".into(),
            ));
        }
        if self.auth.access_token_minutes <= 0 || self.auth.refresh_token_days <= 0 {
            return Err(ConfigError::Invalid("token lifetimes must be positive".into()));
        }
        if self.subscriptions.default_plan_duration_days <= 0 {
            return Err(ConfigError::Invalid(
                "subscriptions.default_plan_duration_days must be positive".into(),
            ));
        }
        if self.auth.jwt_secret == DEFAULT_JWT_SECRET {
            tracing::warn!("using the default JWT secret; set auth.jwt_secret in production");
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.address, self.server.port)
    }
}
