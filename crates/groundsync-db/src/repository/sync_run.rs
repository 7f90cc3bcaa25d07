//! # Sync Run Repository
//!
//! History of sync passes, one row per pass.
//!
//! ## Run Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  SyncManager::sync_model(person)                                       │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  start("person")        INSERT status = 'running'                       │
//! │       │                                                                 │
//! │       ├── list() failed ──► finish(Failed, last_error = transport)      │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  per-resource transactions (committed independently)                    │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  finish(Completed, listed, synced, failed, last resource error)        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Bookkeeping writes go through the pool, never through a resource
//! transaction, so a rolled-back resource cannot erase the run record.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use crate::error::{DbError, DbResult};

/// Status of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunStatus {
    Running,
    Completed,
    Failed,
}

impl SyncRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncRunStatus::Running => "running",
            SyncRunStatus::Completed => "completed",
            SyncRunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncRunStatus {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(SyncRunStatus::Running),
            "completed" => Ok(SyncRunStatus::Completed),
            "failed" => Ok(SyncRunStatus::Failed),
            other => Err(DbError::decode("status", format!("unknown status '{}'", other))),
        }
    }
}

/// One recorded sync pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: String,
    pub model: String,
    pub status: SyncRunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub listed: i64,
    pub synced: i64,
    pub failed: i64,
    pub last_error: Option<String>,
}

/// Counts reported when a run finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncRunOutcome {
    pub listed: i64,
    pub synced: i64,
    pub failed: i64,
    pub last_error: Option<String>,
}

#[derive(sqlx::FromRow)]
struct SyncRunRow {
    id: String,
    model: String,
    status: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    listed: i64,
    synced: i64,
    failed: i64,
    last_error: Option<String>,
}

impl TryFrom<SyncRunRow> for SyncRun {
    type Error = DbError;

    fn try_from(row: SyncRunRow) -> Result<Self, Self::Error> {
        Ok(SyncRun {
            id: row.id,
            model: row.model,
            status: row.status.parse()?,
            started_at: row.started_at,
            finished_at: row.finished_at,
            listed: row.listed,
            synced: row.synced,
            failed: row.failed,
            last_error: row.last_error,
        })
    }
}

const SELECT_RUNS: &str = r#"
    SELECT id, model, status, started_at, finished_at,
           listed, synced, failed, last_error
    FROM sync_runs
"#;

/// Repository for sync run history.
#[derive(Debug, Clone)]
pub struct SyncRunRepository {
    pool: SqlitePool,
}

impl SyncRunRepository {
    /// Creates a new SyncRunRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SyncRunRepository { pool }
    }

    /// Records the start of a pass.
    pub async fn start(&self, model: &str, started_at: DateTime<Utc>) -> DbResult<SyncRun> {
        let run = SyncRun {
            id: Uuid::new_v4().to_string(),
            model: model.to_string(),
            status: SyncRunStatus::Running,
            started_at,
            finished_at: None,
            listed: 0,
            synced: 0,
            failed: 0,
            last_error: None,
        };

        debug!(model = %model, run_id = %run.id, "Recording sync run start");

        sqlx::query(
            r#"
            INSERT INTO sync_runs (id, model, status, started_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(&run.id)
        .bind(&run.model)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .execute(&self.pool)
        .await?;

        Ok(run)
    }

    /// Records the end of a pass.
    pub async fn finish(
        &self,
        id: &str,
        status: SyncRunStatus,
        outcome: &SyncRunOutcome,
    ) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_runs SET
                status = ?2,
                finished_at = ?3,
                listed = ?4,
                synced = ?5,
                failed = ?6,
                last_error = ?7
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(outcome.listed)
        .bind(outcome.synced)
        .bind(outcome.failed)
        .bind(&outcome.last_error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("SyncRun", id));
        }
        Ok(())
    }

    /// Most recent runs of a model, newest first.
    pub async fn recent(&self, model: &str, limit: u32) -> DbResult<Vec<SyncRun>> {
        let sql = format!("{SELECT_RUNS} WHERE model = ?1 ORDER BY started_at DESC LIMIT ?2");
        let rows: Vec<SyncRunRow> = sqlx::query_as(&sql)
            .bind(model)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(SyncRun::try_from).collect()
    }

    /// The latest run of a model, if any.
    pub async fn last(&self, model: &str) -> DbResult<Option<SyncRun>> {
        Ok(self.recent(model, 1).await?.into_iter().next())
    }

    /// Deletes finished runs older than `days_old` days.
    ///
    /// ## Returns
    /// Number of deleted runs.
    pub async fn cleanup_old_runs(&self, days_old: u32) -> DbResult<u64> {
        let cutoff = Utc::now() - Duration::days(i64::from(days_old));

        let result = sqlx::query(
            r#"
            DELETE FROM sync_runs
            WHERE finished_at IS NOT NULL
            AND finished_at < ?1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};

    #[tokio::test]
    async fn test_run_lifecycle() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let runs = db.sync_runs();

        let run = runs.start("person", Utc::now()).await.unwrap();
        assert_eq!(run.status, SyncRunStatus::Running);

        runs.finish(
            &run.id,
            SyncRunStatus::Completed,
            &SyncRunOutcome {
                listed: 3,
                synced: 2,
                failed: 1,
                last_error: Some("name is required".to_string()),
            },
        )
        .await
        .unwrap();

        let last = runs.last("person").await.unwrap().unwrap();
        assert_eq!(last.id, run.id);
        assert_eq!(last.status, SyncRunStatus::Completed);
        assert_eq!((last.listed, last.synced, last.failed), (3, 2, 1));
        assert!(last.finished_at.is_some());
        assert_eq!(last.last_error.as_deref(), Some("name is required"));

        assert!(runs.last("office").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finish_unknown_run() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let result = db
            .sync_runs()
            .finish("missing", SyncRunStatus::Failed, &SyncRunOutcome::default())
            .await;
        assert!(matches!(result, Err(DbError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_cleanup_keeps_recent_runs() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let runs = db.sync_runs();

        let run = runs.start("person", Utc::now()).await.unwrap();
        runs.finish(&run.id, SyncRunStatus::Completed, &SyncRunOutcome::default())
            .await
            .unwrap();

        assert_eq!(runs.cleanup_old_runs(30).await.unwrap(), 0);
        assert_eq!(runs.recent("person", 10).await.unwrap().len(), 1);
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("failed".parse::<SyncRunStatus>().unwrap(), SyncRunStatus::Failed);
        assert!("paused".parse::<SyncRunStatus>().is_err());
    }
}
