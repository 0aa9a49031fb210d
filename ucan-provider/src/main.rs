//! ucan-provider: reconciles ucan volumes, floating IPs and virtual machines
//! against a declared manifest.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use ucan_provider::{Endpoints, Provider, ProviderConfig};
use ucan_reconciler::{Backoff, SchedulerConfig};

/// ucan provider
#[derive(Parser, Debug)]
#[command(name = "ucan-provider", version, about)]
struct Args {
    /// Manifest listing the declared resources
    #[arg(long, env = "UCAN_MANIFEST")]
    manifest: PathBuf,

    /// Directory for the per-kind state snapshots
    #[arg(long, env = "UCAN_STATE_DIR", default_value = "/var/lib/ucan-provider")]
    state_dir: PathBuf,

    /// Credentials file ({"accessKeyId": .., "secretAccessKey": ..})
    #[arg(long, env = "UCAN_CREDENTIALS")]
    credentials: PathBuf,

    /// Seconds between cycles of a healthy resource
    #[arg(long, default_value = "60")]
    poll_interval: u64,

    /// Seconds between manifest reads
    #[arg(long, default_value = "10")]
    manifest_interval: u64,

    /// Resources reconciled concurrently per kind
    #[arg(long, default_value = "10")]
    concurrency: usize,

    /// First retry delay in milliseconds
    #[arg(long, default_value = "1000", value_parser = clap::value_parser!(u64).range(1..))]
    backoff_base_ms: u64,

    /// Retry delay ceiling in seconds
    #[arg(long, default_value = "60")]
    backoff_max: u64,

    /// Per-request timeout in seconds
    #[arg(long, default_value = "30")]
    request_timeout: u64,

    /// Name of this deployment, written into the ownership tag of created volumes
    #[arg(
        long,
        env = "UCAN_INSTANCE",
        default_value = ucan_provider::config::DEFAULT_INSTANCE
    )]
    instance: String,

    /// Volume API endpoint
    #[arg(long, env = "UCAN_VOLUME_ENDPOINT")]
    volume_endpoint: Option<String>,

    /// Network API endpoint
    #[arg(long, env = "UCAN_NETWORK_ENDPOINT")]
    network_endpoint: Option<String>,

    /// Compute API endpoint
    #[arg(long, env = "UCAN_COMPUTE_ENDPOINT")]
    compute_endpoint: Option<String>,
}

impl Args {
    fn config(&self) -> ProviderConfig {
        let mut endpoints = Endpoints::default();
        if let Some(url) = &self.volume_endpoint {
            endpoints.volume = url.clone();
        }
        if let Some(url) = &self.network_endpoint {
            endpoints.network = url.clone();
        }
        if let Some(url) = &self.compute_endpoint {
            endpoints.compute = url.clone();
        }

        let mut config = ProviderConfig::new(&self.manifest, &self.state_dir);
        config.manifest_interval = Duration::from_secs(self.manifest_interval.max(1));
        config.request_timeout = Duration::from_secs(self.request_timeout);
        config.scheduler = SchedulerConfig {
            poll_interval: Duration::from_secs(self.poll_interval.max(1)),
            concurrency: self.concurrency,
            backoff: Backoff::new(
                Duration::from_millis(self.backoff_base_ms),
                Duration::from_secs(self.backoff_max),
            ),
        };
        config.endpoints = endpoints;
        config.instance = self.instance.clone();
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "ucan_provider=info,ucan_reconciler=info,reqwest=warn,hyper=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = args.config();

    let credentials = tokio::fs::read(&args.credentials)
        .await
        .with_context(|| format!("cannot read credentials {}", args.credentials.display()))?;

    info!("Starting ucan-provider");
    info!("Manifest: {}", config.manifest.display());
    info!("Volume endpoint: {}", config.endpoints.volume);
    info!("Network endpoint: {}", config.endpoints.network);
    info!("Compute endpoint: {}", config.endpoints.compute);

    let cancel = CancellationToken::new();
    let provider = Provider::start(config, &credentials, cancel.clone()).await?;

    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for shutdown signal")?;
    info!("Shutting down");
    cancel.cancel();
    provider.wait().await;

    Ok(())
}
