// src/config.rs
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::rabbitmq::{BrokerSettings, ChannelConfig, DEFAULT_CONCURRENCY};

pub const CONFIG_FILE_NAME: &str = "bucket-relay.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not find {0}: pass --config-file or create one in the current directory, config/, or your home directory")]
    NotFound(String),

    #[error("Failed to read config file at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration file contains invalid JSON or missing required fields: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Invalid(String),

    #[error("Environment variable {name} is invalid: {message}")]
    Env { name: String, message: String },
}

// Configuration structures
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rabbit: Option<RabbitConfig>,
    #[serde(default)]
    pub driver: DriverConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AwsConfig {
    pub uri: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RabbitConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Driver tuning. Unset fields fall through to the next layer, then to the
/// defaults returned by the accessors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefetch_count: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirm_mode: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one sub-directory per bucket.
    pub root: Option<PathBuf>,
}

// Default values
const DEFAULT_PREFETCH: u16 = 10;
const DEFAULT_TIMEOUT_MS: u64 = 5000;
const DEFAULT_CONNECT_ATTEMPTS: u32 = 1;

impl DriverConfig {
    pub fn concurrency(&self) -> usize {
        self.concurrency.unwrap_or(DEFAULT_CONCURRENCY)
    }

    pub fn prefetch_count(&self) -> u16 {
        self.prefetch_count.unwrap_or(DEFAULT_PREFETCH)
    }

    pub fn confirm_mode(&self) -> bool {
        self.confirm_mode.unwrap_or(true)
    }

    pub fn connection_timeout_ms(&self) -> u64 {
        self.connection_timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.unwrap_or(DEFAULT_CONNECT_ATTEMPTS)
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            prefetch_count: self.prefetch_count(),
            confirm_mode: self.confirm_mode(),
            ..ChannelConfig::default()
        }
    }

    /// Fills unset fields from `fallback`, one field at a time.
    pub fn or(self, fallback: &DriverConfig) -> DriverConfig {
        DriverConfig {
            concurrency: self.concurrency.or(fallback.concurrency),
            prefetch_count: self.prefetch_count.or(fallback.prefetch_count),
            confirm_mode: self.confirm_mode.or(fallback.confirm_mode),
            connection_timeout_ms: self.connection_timeout_ms.or(fallback.connection_timeout_ms),
            connect_attempts: self.connect_attempts.or(fallback.connect_attempts),
        }
    }
}

fn present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.is_empty())
}

impl AwsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !present(&self.uri) {
            return Err(ConfigError::Invalid("URI for AWS S3 server must be provided".into()));
        }
        if !present(&self.secret_key) {
            return Err(ConfigError::Invalid("Secret key must be provided".into()));
        }
        if !present(&self.access_key) {
            return Err(ConfigError::Invalid("Access key must be provided".into()));
        }
        Ok(())
    }

    /// Fills unset fields from `fallback`.
    pub fn or(self, fallback: &AwsConfig) -> AwsConfig {
        AwsConfig {
            uri: self.uri.or_else(|| fallback.uri.clone()),
            access_key: self.access_key.or_else(|| fallback.access_key.clone()),
            secret_key: self.secret_key.or_else(|| fallback.secret_key.clone()),
        }
    }
}

impl RabbitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !present(&self.host) {
            return Err(ConfigError::Invalid("Host must be provided".into()));
        }
        if self.port.is_none() {
            return Err(ConfigError::Invalid("Port must be provided".into()));
        }
        self.validate_credentials()
    }

    /// A user without a password, or the reverse, is always an error.
    pub fn validate_credentials(&self) -> Result<(), ConfigError> {
        match (present(&self.user), present(&self.password)) {
            (true, false) => Err(ConfigError::Invalid("Password must be provided".into())),
            (false, true) => Err(ConfigError::Invalid("User must be provided".into())),
            _ => Ok(()),
        }
    }

    /// Fills unset fields from `fallback`. Credentials are taken as a pair.
    pub fn or(self, fallback: &RabbitConfig) -> RabbitConfig {
        let (user, password) = if self.user.is_some() || self.password.is_some() {
            (self.user, self.password)
        } else {
            (fallback.user.clone(), fallback.password.clone())
        };
        RabbitConfig {
            host: self.host.or_else(|| fallback.host.clone()),
            port: self.port.or(fallback.port),
            user,
            password,
        }
    }
}

impl RelayConfig {
    /// Section-level checks: a present section must be complete.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(aws) = &self.aws {
            aws.validate()?;
        }
        if let Some(rabbit) = &self.rabbit {
            rabbit.validate()?;
        }
        if self.driver.concurrency == Some(0) {
            return Err(ConfigError::Invalid("driver.concurrency must be at least 1".into()));
        }
        Ok(())
    }

    /// Layers `fallback` underneath `self`.
    pub fn or(self, fallback: &RelayConfig) -> RelayConfig {
        let aws = match (self.aws, &fallback.aws) {
            (Some(aws), Some(fb)) => Some(aws.or(fb)),
            (Some(aws), None) => Some(aws),
            (None, fb) => fb.clone(),
        };
        let rabbit = match (self.rabbit, &fallback.rabbit) {
            (Some(rabbit), Some(fb)) => Some(rabbit.or(fb)),
            (Some(rabbit), None) => Some(rabbit),
            (None, fb) => fb.clone(),
        };
        RelayConfig {
            aws,
            rabbit,
            driver: self.driver.or(&fallback.driver),
            storage: StorageConfig {
                root: self.storage.root.or_else(|| fallback.storage.root.clone()),
            },
        }
    }

    /// Broker values for the driver's fallback layer.
    pub fn broker_settings(&self) -> BrokerSettings {
        let rabbit = self.rabbit.clone().unwrap_or_default();
        BrokerSettings {
            host: rabbit.host,
            port: rabbit.port,
            username: rabbit.user,
            password: rabbit.password,
        }
    }

    pub fn storage_uri(&self) -> Option<&str> {
        self.aws.as_ref().and_then(|aws| aws.uri.as_deref())
    }
}

// Configuration loading and management functions
pub fn find_config_file() -> Result<PathBuf, ConfigError> {
    let locations = [
        ("Current directory", PathBuf::from(CONFIG_FILE_NAME)),
        ("Config directory", Path::new("config").join(CONFIG_FILE_NAME)),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.clone());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{}", CONFIG_FILE_NAME));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(ConfigError::NotFound(CONFIG_FILE_NAME.to_string()))
}

pub fn load_config(path: &Path) -> Result<RelayConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<RelayConfig, ConfigError> {
    let config: RelayConfig = serde_json::from_str(content)?;
    config.validate()?;
    Ok(config)
}
