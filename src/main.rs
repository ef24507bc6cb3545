use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kube::CustomResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use safespace::config::Config;
use safespace::controller;
use safespace::controlplane;
use safespace::crd::{Sandbox, WarmPod, WarmPool};

/// Default config file looked up in the working directory
const DEFAULT_CONFIG: &str = "safespace.toml";

#[derive(Parser)]
#[command(name = "safespace")]
#[command(about = "Kubernetes control plane for secure, ephemeral code-execution sandboxes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controllers and the background sweeper
    Run {
        /// Path to safespace.toml
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Namespace override for sandbox resources
        #[arg(short, long)]
        namespace: Option<String>,
    },
    /// Print the CRD manifests as YAML
    Crds,
    /// Validate a configuration file
    Check {
        /// Path to safespace.toml
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config, namespace } => run(config, namespace).await,
        Commands::Crds => print_crds(),
        Commands::Check { config } => check(&config),
    }
}

async fn run(config_path: Option<PathBuf>, namespace: Option<String>) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(namespace) = namespace {
        config.cluster.namespace = namespace;
    }

    let client = controlplane::connect(&config.cluster).await?;
    info!(namespace = %config.cluster.namespace, "starting safespace control plane");

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        signal_token.cancel();
    });

    controller::run(client, config, shutdown)
        .await
        .context("control plane exited with an error")?;
    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(&path),
        None => {
            let default = Path::new(DEFAULT_CONFIG);
            if default.exists() {
                Config::from_file(default)
            } else {
                Ok(Config::default())
            }
        }
    }
}

fn print_crds() -> Result<()> {
    let crds = [
        serde_yaml::to_string(&Sandbox::crd()).context("serialize Sandbox CRD")?,
        serde_yaml::to_string(&WarmPool::crd()).context("serialize WarmPool CRD")?,
        serde_yaml::to_string(&WarmPod::crd()).context("serialize WarmPod CRD")?,
    ];
    println!("{}", crds.join("---\n"));
    Ok(())
}

fn check(path: &Path) -> Result<()> {
    let config = Config::from_file(path)?;
    println!(
        "OK: namespace={} workers={} resync={}s",
        config.cluster.namespace,
        config.controllers.worker_count,
        config.controllers.resync_interval_seconds,
    );
    Ok(())
}
