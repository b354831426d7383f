use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use crate::config::{self, AwsConfig, ConfigError, DriverConfig, RabbitConfig, RelayConfig, StorageConfig};
use crate::env::EnvConfig;
use crate::rabbitmq::{ConnectOptions, Driver};
use crate::relay::{self, RelayOptions};
use crate::storage::DirectoryLister;

/// Publish one work message per bucket object to RabbitMQ.
#[derive(Parser, Debug, Clone, Default)]
#[clap(name = "bucket-relay", version)]
pub struct Cli {
    /// JSON file with credentials for the RabbitMQ and S3 servers
    #[clap(short = 'c', long)]
    pub config_file: Option<PathBuf>,

    /// Bucket to read objects from
    #[clap(short = 'b', long)]
    pub bucket: String,

    /// Queue that receives one message per object
    #[clap(long)]
    pub publish_queue: String,

    /// Queue to listen to for results
    #[clap(long)]
    pub results_queue: Option<String>,

    #[clap(long)]
    pub aws_uri: Option<String>,

    #[clap(long)]
    pub aws_access_key: Option<String>,

    #[clap(long)]
    pub aws_secret_key: Option<String>,

    /// Directory with one sub-directory per bucket
    #[clap(long)]
    pub storage_root: Option<PathBuf>,

    #[clap(long)]
    pub rabbit_host: Option<String>,

    #[clap(long)]
    pub rabbit_port: Option<u16>,

    #[clap(long)]
    pub rabbit_user: Option<String>,

    #[clap(long)]
    pub rabbit_password: Option<String>,

    /// Number of results handled at once
    #[clap(long)]
    pub concurrency: Option<usize>,
}

impl Cli {
    /// Broker values given on the command line. These go to the driver as
    /// explicit arguments; file and environment values are its fallback.
    pub fn connect_options(&self) -> Result<ConnectOptions, ConfigError> {
        RabbitConfig {
            host: self.rabbit_host.clone(),
            port: self.rabbit_port,
            user: self.rabbit_user.clone(),
            password: self.rabbit_password.clone(),
        }
        .validate_credentials()?;

        let mut options = ConnectOptions::new();
        if let Some(host) = &self.rabbit_host {
            options = options.host(host.clone());
        }
        if let Some(port) = self.rabbit_port {
            options = options.port(port);
        }
        if let (Some(user), Some(password)) = (&self.rabbit_user, &self.rabbit_password) {
            options = options.credentials(user.clone(), password.clone());
        }
        if let Some(concurrency) = self.concurrency {
            options = options.concurrency(concurrency);
        }
        Ok(options)
    }

    fn aws_layer(&self) -> Option<AwsConfig> {
        let aws = AwsConfig {
            uri: self.aws_uri.clone(),
            access_key: self.aws_access_key.clone(),
            secret_key: self.aws_secret_key.clone(),
        };
        (aws != AwsConfig::default()).then_some(aws)
    }
}

fn file_layer(cli: &Cli) -> Result<RelayConfig, ConfigError> {
    match &cli.config_file {
        Some(path) => config::load_config(path),
        None => match config::find_config_file() {
            Ok(path) => {
                info!("Using config file {}", path.display());
                config::load_config(&path)
            }
            Err(ConfigError::NotFound(_)) => Ok(RelayConfig::default()),
            Err(e) => Err(e),
        },
    }
}

/// Command line over config file over environment.
pub fn resolve_config(cli: &Cli, env: EnvConfig) -> Result<RelayConfig, ConfigError> {
    let env_layer = env.into_config();
    let file_layer = file_layer(cli)?;

    let cli_layer = RelayConfig {
        aws: cli.aws_layer(),
        rabbit: None,
        // --concurrency reaches the driver through ConnectOptions.
        driver: DriverConfig::default(),
        storage: StorageConfig {
            root: cli.storage_root.clone(),
        },
    };

    // A file is validated as a whole when loaded. Merged layers only need
    // to agree on credentials; a missing host is reported by the driver.
    let merged = cli_layer.or(&file_layer.or(&env_layer));
    if let Some(rabbit) = &merged.rabbit {
        rabbit.validate_credentials()?;
    }
    if merged.driver.concurrency() == 0 {
        return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
    }
    Ok(merged)
}

pub fn build_driver(config: &RelayConfig) -> Driver {
    Driver::builder()
        .fallback(config.broker_settings())
        .channel_config(config.driver.channel_config())
        .connect_attempts(config.driver.connect_attempts())
        .connection_timeout(Duration::from_millis(config.driver.connection_timeout_ms()))
        .concurrency(config.driver.concurrency())
        .build()
}

/// Entry point shared by `main` and the integration tests.
pub async fn run(cli: Cli) -> Result<()> {
    let env = EnvConfig::load()?;
    let config = resolve_config(&cli, env)?;
    let connect = cli.connect_options()?;

    let storage_uri = config
        .storage_uri()
        .context("AWS uri must be provided with --aws-uri, the config file or AWS_URI")?
        .to_string();
    let root = config
        .storage
        .root
        .clone()
        .context("Storage root must be provided with --storage-root or the config file")?;

    let options = RelayOptions {
        bucket: cli.bucket.clone(),
        publish_queue: cli.publish_queue.clone(),
        results_queue: cli.results_queue.clone(),
        storage_uri,
    };

    let driver = Arc::new(build_driver(&config));
    let lister = DirectoryLister::new(root);
    let report = relay::run(driver, &lister, options, connect).await?;

    info!(listed = report.listed, published = report.published, "Relay complete");
    Ok(())
}
