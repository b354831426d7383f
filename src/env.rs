use std::env;
use std::str::FromStr;

use dotenv::dotenv;

use crate::config::{AwsConfig, ConfigError, DriverConfig, RabbitConfig, RelayConfig};

/// Values read from the process environment (and a `.env` file when present).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvConfig {
    pub rabbit_host: Option<String>,
    pub rabbit_port: Option<u16>,
    pub rabbit_username: Option<String>,
    pub rabbit_password: Option<String>,
    pub aws_uri: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub concurrency: Option<usize>,
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn parsed<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(val) => val.parse().map(Some).map_err(|e: T::Err| ConfigError::Env {
            name: name.to_string(),
            message: e.to_string(),
        }),
        None => Ok(None),
    }
}

impl EnvConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenv().ok();
        Ok(EnvConfig {
            rabbit_host: var("RABBIT_HOST"),
            rabbit_port: parsed("RABBIT_PORT")?,
            rabbit_username: var("RABBIT_USERNAME"),
            rabbit_password: var("RABBIT_PASSWORD"),
            aws_uri: var("AWS_URI"),
            aws_access_key_id: var("AWS_ACCESS_KEY_ID"),
            aws_secret_access_key: var("AWS_SECRET_ACCESS_KEY"),
            concurrency: parsed("RELAY_CONCURRENCY")?,
        })
    }

    /// The lowest configuration layer. Sections are left out when no variable for them is set.
    pub fn into_config(self) -> RelayConfig {
        let rabbit = RabbitConfig {
            host: self.rabbit_host,
            port: self.rabbit_port,
            user: self.rabbit_username,
            password: self.rabbit_password,
        };
        let aws = AwsConfig {
            uri: self.aws_uri,
            access_key: self.aws_access_key_id,
            secret_key: self.aws_secret_access_key,
        };

        RelayConfig {
            rabbit: (rabbit != RabbitConfig::default()).then_some(rabbit),
            aws: (aws != AwsConfig::default()).then_some(aws),
            driver: DriverConfig {
                concurrency: self.concurrency,
                ..DriverConfig::default()
            },
            ..RelayConfig::default()
        }
    }
}
