//! Imagomortis Scheduler
//!
//! Turns unassigned images in Postgres into ephemeral Kubernetes Jobs and
//! records their results.
//!
//! Architecture:
//! - Configuration: read once from the environment, passed to constructors
//! - Repository: the `images` work queue (skip-locked claims)
//! - Services: job orchestration, completion watching, progress streaming,
//!   reconciliation of outcomes and cleanup
//! - Scheduler: the claim, process, repeat control loop
//!
//! Any number of schedulers can share one database; each image is claimed
//! by exactly one of them.

mod config;
mod db;
mod repository;
mod scheduler;
mod service;
mod shutdown;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use imagomortis_kube::{KubeClient, KubeConfig};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, LogFormat};
use crate::repository::{PgWorkQueue, WorkQueue};
use crate::scheduler::ControlLoop;
use crate::service::{JobPlatform, KubePlatform, Reconciler, SharedVolume};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();
    init_tracing(config.log_format);

    info!("Starting Imagomortis Scheduler");

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {:#}", e);
        return Err(e);
    }
    info!(
        "Loaded configuration: namespace={}, image={}, shared_volume={}",
        config.namespace,
        config.task_image,
        config.shared_volume_path.display()
    );

    SharedVolume::new(config.shared_volume_path.clone(), config.job_mount_path.clone())
        .ensure_exists()
        .await?;

    let platform = connect_kubernetes(&config).await?;
    let queue = connect_database(&config).await?;

    let shutdown = shutdown::install_shutdown_handler()?;

    let reconciler = Reconciler::new(&config, queue.clone(), platform);
    let control = ControlLoop::new(&config, queue, reconciler);

    info!("Scheduler initialized successfully");
    control.run(shutdown).await;

    info!("Scheduler shut down");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "imagomortis_scheduler=info,imagomortis_kube=info".into());

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Builds the Kubernetes client and checks the API is reachable
async fn connect_kubernetes(config: &Config) -> Result<Arc<dyn JobPlatform>> {
    let service_host = std::env::var("KUBERNETES_SERVICE_HOST").ok();
    let service_port = std::env::var("KUBERNETES_SERVICE_PORT").ok();

    let kube_config = KubeConfig::infer(
        config.kube_api_url.as_deref(),
        service_host.as_deref(),
        service_port.as_deref(),
    )
    .context("Failed to load Kubernetes configuration")?;
    let client = KubeClient::new(kube_config).context("Failed to build Kubernetes client")?;

    let version = client
        .version()
        .await
        .with_context(|| format!("Failed to reach Kubernetes API at {}", client.base_url()))?;
    info!(
        "Connected to Kubernetes {} ({}) at {}",
        version.git_version,
        version.platform,
        client.base_url()
    );

    Ok(Arc::new(KubePlatform::new(client, config.namespace.clone())))
}

async fn connect_database(config: &Config) -> Result<Arc<dyn WorkQueue>> {
    let pool = db::create_pool(&config.database)
        .await
        .context("Failed to connect to Postgres")?;
    db::ensure_schema(&pool)
        .await
        .context("Failed to prepare images table")?;

    info!("Connected to Postgres");
    Ok(Arc::new(PgWorkQueue::new(pool)))
}
