//! # groundsync-worker
//!
//! Runs the scheduled syncs declared in `groundsync.toml`.
//!
//! ## Modes
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Worker Modes                                     │
//! │                                                                         │
//! │  groundsync-worker                 run_due() every poll interval        │
//! │                                    until Ctrl-C / SIGTERM               │
//! │                                                                         │
//! │  groundsync-worker --once          run_all() once, then exit            │
//! │                                                                         │
//! │  groundsync-worker --model person  one pass for one model, then exit    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use groundsync_core::ModelRegistry;
use groundsync_db::Database;
use groundsync_sync::{
    run_until, schedule_synced_models, AppConfig, CacheStore, CronRegistrar, MemoryCache,
};

/// Pulls REST resources into a local SQLite store on a schedule.
#[derive(Debug, Parser)]
#[command(name = "groundsync-worker", version)]
struct Cli {
    /// Config file. Defaults to the platform config dir.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Run every job once and exit.
    #[arg(long, conflicts_with = "model")]
    once: bool,

    /// Seconds between scheduler polls.
    #[arg(long, value_name = "SECS", env = "GROUNDSYNC_POLL_INTERVAL_SECS")]
    poll_interval: Option<u64>,

    /// Sync one model and exit.
    #[arg(long, value_name = "NAME")]
    model: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();
    info!("Starting groundsync worker...");

    let mut config = AppConfig::load(cli.config.clone()).context("failed to load configuration")?;
    if let Some(secs) = cli.poll_interval {
        config.cron.poll_interval_secs = secs;
        config.validate()?;
    }
    info!(
        models = config.models.len(),
        database = %config.database.path.display(),
        poll_interval_secs = config.cron.poll_interval_secs,
        "Configuration loaded"
    );

    let db = Database::new(config.database.db_config())
        .await
        .context("failed to open database")?;
    let removed = db.sync_runs().cleanup_old_runs(config.database.history_days).await?;
    if removed > 0 {
        info!(removed, "Old sync runs removed");
    }

    let registry: Arc<ModelRegistry> = Arc::new(config.build_registry(open_cache(&config))?);
    db.ensure_schema(&registry).await?;

    let result = run(&cli, &config, db.clone(), registry).await;
    db.close().await;
    result
}

async fn run(
    cli: &Cli,
    config: &AppConfig,
    db: Database,
    registry: Arc<ModelRegistry>,
) -> anyhow::Result<()> {
    if let Some(model) = &cli.model {
        let report = groundsync_sync::sync_model(&db, &registry, model).await?;
        info!(
            model = %report.model,
            listed = report.listed,
            synced = report.synced,
            failed = report.failed(),
            "Sync finished"
        );
        if !report.is_clean() {
            bail!("{} of {} {} resources failed", report.failed(), report.listed, model);
        }
        return Ok(());
    }

    let mut registrar = CronRegistrar::new();
    schedule_synced_models(&mut registrar, registry, db)?;
    if registrar.is_empty() {
        warn!("No models are scheduled for automatic sync");
    }

    if cli.once {
        let summary = registrar.run_all().await;
        if !summary.is_clean() {
            bail!("{} of {} jobs failed", summary.failed.len(), summary.ran.len());
        }
        return Ok(());
    }

    run_until(&mut registrar, config.cron.poll_interval(), shutdown_signal()).await;
    info!("Worker shutdown complete");
    Ok(())
}

/// Redis when configured and compiled in, otherwise an in-process cache.
fn open_cache(config: &AppConfig) -> Arc<dyn CacheStore> {
    if let Some(url) = &config.cache.redis_url {
        #[cfg(feature = "redis")]
        match groundsync_sync::RedisCache::open(url) {
            Ok(cache) => {
                info!("Using Redis cache");
                return Arc::new(cache);
            }
            Err(e) => warn!(error = %e, "Failed to open Redis cache, continuing with memory cache"),
        }

        #[cfg(not(feature = "redis"))]
        warn!(url = %url, "Built without the redis feature, using memory cache");
    }

    Arc::new(MemoryCache::new())
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping scheduler...");
}
