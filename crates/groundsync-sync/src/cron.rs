//! # Cron Registrar
//!
//! Interval jobs, run sequentially by a polling driver.
//!
//! ## Scheduling
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  register("sync:person", 1 day, task)     next_run = now + interval     │
//! │                                                                         │
//! │  run_until(poll = 30s, shutdown)                                        │
//! │    loop                                                                 │
//! │      run_due()  ──► every job with next_run <= now, one at a time       │
//! │                     next_run = now + interval                           │
//! │      sleep(poll) or shutdown                                            │
//! │                                                                         │
//! │  run_all()      ──► every job once, regardless of next_run              │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A failing job is logged and reported in [`CronRunSummary`]; the other
//! jobs still run. There is no retry: the next due time is the retry.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use tokio::time::Instant;
use tracing::{debug, error, info};

use groundsync_core::ModelRegistry;
use groundsync_db::Database;

use crate::error::{SyncError, SyncResult};
use crate::manager::SyncManager;

/// A registered job body.
pub type CronTask = Arc<dyn Fn() -> BoxFuture<'static, SyncResult<()>> + Send + Sync>;

struct CronJob {
    name: String,
    interval: Duration,
    next_run: Instant,
    task: CronTask,
}

/// What one `run_due` / `run_all` call did.
#[derive(Debug, Default)]
pub struct CronRunSummary {
    /// Jobs that ran, in order.
    pub ran: Vec<String>,

    /// `(job, error)` for the jobs that failed.
    pub failed: Vec<(String, String)>,
}

impl CronRunSummary {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Holds the registered jobs and their next due times.
#[derive(Default)]
pub struct CronRegistrar {
    jobs: Vec<CronJob>,
}

impl CronRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a job; its first run is due one `interval` from now.
    ///
    /// ## Errors
    /// `InvalidConfig` for a zero interval or an already registered name.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, interval: Duration, task: F) -> SyncResult<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncResult<()>> + Send + 'static,
    {
        let name = name.into();
        if interval.is_zero() {
            return Err(SyncError::InvalidConfig(format!(
                "job '{}' needs a non-zero interval",
                name
            )));
        }
        if self.jobs.iter().any(|job| job.name == name) {
            return Err(SyncError::InvalidConfig(format!(
                "job '{}' is already registered",
                name
            )));
        }

        debug!(job = %name, interval_secs = interval.as_secs(), "Registered cron job");
        self.jobs.push(CronJob {
            name,
            interval,
            next_run: Instant::now() + interval,
            task: Arc::new(move || task().boxed()),
        });
        Ok(())
    }

    /// Runs every job whose due time has passed.
    pub async fn run_due(&mut self) -> CronRunSummary {
        let now = Instant::now();
        let mut summary = CronRunSummary::default();
        for job in self.jobs.iter_mut().filter(|job| job.next_run <= now) {
            run_job(job, &mut summary).await;
        }
        summary
    }

    /// Runs every job once and reschedules it.
    pub async fn run_all(&mut self) -> CronRunSummary {
        let mut summary = CronRunSummary::default();
        for job in &mut self.jobs {
            run_job(job, &mut summary).await;
        }
        summary
    }

    /// Earliest due time among the jobs.
    pub fn next_due(&self) -> Option<Instant> {
        self.jobs.iter().map(|job| job.next_run).min()
    }

    pub fn job_names(&self) -> impl Iterator<Item = &str> {
        self.jobs.iter().map(|job| job.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl std::fmt::Debug for CronRegistrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronRegistrar")
            .field("jobs", &self.job_names().collect::<Vec<_>>())
            .finish()
    }
}

async fn run_job(job: &mut CronJob, summary: &mut CronRunSummary) {
    let started = Instant::now();
    info!(job = %job.name, "Cron job started");

    let result = (job.task)().await;
    job.next_run = Instant::now() + job.interval;
    summary.ran.push(job.name.clone());

    let duration_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(()) => info!(job = %job.name, duration_ms, "Cron job finished"),
        Err(e) => {
            error!(job = %job.name, duration_ms, error = %e, "Cron job failed");
            summary.failed.push((job.name.clone(), e.to_string()));
        }
    }
}

// =============================================================================
// Model Scheduling
// =============================================================================

/// Job name used for a model's sync.
pub fn sync_job_name(model: &str) -> String {
    format!("sync:{}", model)
}

/// Registers a sync job for every model with a sync interval.
///
/// Each run opens a fresh [`SyncManager`] session.
///
/// ## Returns
/// Number of jobs registered.
pub fn schedule_synced_models(
    registrar: &mut CronRegistrar,
    registry: Arc<ModelRegistry>,
    db: Database,
) -> SyncResult<usize> {
    let mut scheduled = 0;

    for model in registry.scheduled() {
        let Some(interval) = model.sync_config().sync_interval() else {
            continue;
        };
        let name = model.name().to_string();
        let registry = Arc::clone(&registry);
        let db = db.clone();

        registrar.register(sync_job_name(&name), interval, move || {
            let registry = Arc::clone(&registry);
            let db = db.clone();
            let name = name.clone();
            async move {
                SyncManager::new(db, registry)
                    .sync_model(&name)
                    .await
                    .map(|_| ())
            }
        })?;
        scheduled += 1;
    }

    info!(jobs = scheduled, "Scheduled synced models");
    Ok(scheduled)
}

/// Calls `run_due` every `poll_interval` until `shutdown` resolves.
pub async fn run_until<S>(registrar: &mut CronRegistrar, poll_interval: Duration, shutdown: S)
where
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    info!(
        jobs = registrar.len(),
        poll_interval_secs = poll_interval.as_secs(),
        "Cron loop started"
    );

    loop {
        let summary = registrar.run_due().await;
        if !summary.ran.is_empty() {
            debug!(ran = summary.ran.len(), failed = summary.failed.len(), "Cron tick");
        }

        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested, cron loop stopped");
                break;
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
