//! keelsond: the Keelson discovery daemon.
//!
//! Joins the configured cluster, keeps the local announce alive and logs
//! every topology change until interrupted.
//!
//! # Usage
//!
//! ```text
//! keelsond run --config /etc/keelson/keelson.toml --endpoint 10.0.0.5:2379
//! keelsond check-config --config /etc/keelson/keelson.toml
//! ```

mod listener;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use keelson_core::DiscoveryConfig;
use keelson_protocol::Discovery;
use keelson_store::HttpStore;

use crate::listener::LoggingListener;

const DEFAULT_LOG_FILTER: &str = "info,keelsond=debug,keelson=debug";

#[derive(Parser)]
#[command(name = "keelsond", about = "Keelson discovery daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Join the cluster and stay in it until Ctrl-C.
    Run {
        /// Path to keelson.toml.
        #[arg(long, short)]
        config: PathBuf,

        /// Override `instance.sling_id`.
        #[arg(long)]
        sling_id: Option<String>,

        /// Override `store.endpoints`; repeat for several members.
        #[arg(long = "endpoint")]
        endpoints: Vec<String>,

        /// Override `cluster.id`.
        #[arg(long)]
        cluster_id: Option<String>,

        #[arg(long, value_enum, default_value_t = LogFormat::Text)]
        log_format: LogFormat,
    },
    /// Parse a configuration file and print the effective settings.
    CheckConfig {
        #[arg(long, short)]
        config: PathBuf,
    },
}

/// Command-line values that replace settings from the file.
#[derive(Debug, Default)]
struct Overrides {
    sling_id: Option<String>,
    endpoints: Vec<String>,
    cluster_id: Option<String>,
}

impl Overrides {
    fn apply(self, config: &mut DiscoveryConfig) {
        if let Some(sling_id) = self.sling_id {
            config.instance.sling_id = sling_id;
        }
        if !self.endpoints.is_empty() {
            config.store.endpoints = self.endpoints;
        }
        if let Some(cluster_id) = self.cluster_id {
            config.cluster.id = Some(cluster_id);
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

fn load_config(path: &Path, overrides: Overrides) -> anyhow::Result<DiscoveryConfig> {
    let mut config = DiscoveryConfig::from_file(path)
        .with_context(|| format!("loading {}", path.display()))?;
    overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            sling_id,
            endpoints,
            cluster_id,
            log_format,
        } => {
            init_tracing(log_format);
            let overrides = Overrides {
                sling_id,
                endpoints,
                cluster_id,
            };
            run(load_config(&config, overrides)?).await
        }
        Command::CheckConfig { config } => {
            let config = load_config(&config, Overrides::default())?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

async fn run(config: DiscoveryConfig) -> anyhow::Result<()> {
    info!(
        sling_id = %config.instance.sling_id,
        endpoints = ?config.store.endpoints,
        root = %config.store.root,
        "keelson daemon starting"
    );

    let store = Arc::new(HttpStore::new(
        config.store.endpoints.clone(),
        config.store.connect_timeout(),
        config.store.read_timeout(),
    ));
    let discovery = Discovery::new(config, store);
    discovery.bind_listener(Arc::new(LoggingListener));
    discovery.start();

    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl-C handler")?;
    info!("shutdown signal received");

    discovery.stop().await;
    info!("keelson daemon stopped");
    Ok(())
}
