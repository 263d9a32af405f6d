//! # Sync Run Repository
//!
//! Lifecycle rows for sync runs.
//!
//! ```text
//! start() ──► running ──┬── complete() ──► completed (covered / failed sources)
//!                       └── fail()     ──► failed    (error class + message)
//! ```
//!
//! Run ids come from `AUTOINCREMENT`, so they are strictly increasing even
//! after rows are deleted.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use storewatch_core::{ErrorClass, SyncRun};

const RUN_COLUMNS: &str = "id, job_name, status, started_at, finished_at, snapshots_written, \
     changes_emitted, covered_sources, failed_sources, error_class, error_message";

/// Repository for `sync_runs`.
#[derive(Debug, Clone)]
pub struct RunRepository {
    pool: SqlitePool,
}

impl RunRepository {
    /// Creates a new RunRepository.
    pub fn new(pool: SqlitePool) -> Self {
        RunRepository { pool }
    }

    /// Inserts a `running` row and returns its id.
    pub async fn start(&self, job_name: &str, started_at: DateTime<Utc>) -> DbResult<i64> {
        let result = sqlx::query(
            "INSERT INTO sync_runs (job_name, status, started_at) VALUES (?1, 'running', ?2)",
        )
        .bind(job_name)
        .bind(started_at)
        .execute(&self.pool)
        .await?;

        let run_id = result.last_insert_rowid();
        debug!(run_id, job = job_name, "Run started");
        Ok(run_id)
    }

    /// Marks a running run completed.
    pub async fn complete(
        &self,
        run_id: i64,
        covered_sources: &[String],
        failed_sources: &[String],
        finished_at: DateTime<Utc>,
    ) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_runs
            SET status = 'completed', finished_at = ?1, covered_sources = ?2, failed_sources = ?3
            WHERE id = ?4 AND status = 'running'
            "#,
        )
        .bind(finished_at)
        .bind(serde_json::to_string(covered_sources)?)
        .bind(serde_json::to_string(failed_sources)?)
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("running SyncRun", run_id.to_string()));
        }
        Ok(())
    }

    /// Marks a running run failed.
    pub async fn fail(
        &self,
        run_id: i64,
        class: ErrorClass,
        message: &str,
        failed_sources: &[String],
        finished_at: DateTime<Utc>,
    ) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_runs
            SET status = 'failed', finished_at = ?1, error_class = ?2, error_message = ?3,
                failed_sources = ?4
            WHERE id = ?5 AND status = 'running'
            "#,
        )
        .bind(finished_at)
        .bind(class.as_str())
        .bind(message)
        .bind(serde_json::to_string(failed_sources)?)
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("running SyncRun", run_id.to_string()));
        }
        Ok(())
    }

    /// Gets a run by id.
    pub async fn get(&self, run_id: i64) -> DbResult<Option<SyncRun>> {
        let run = sqlx::query_as::<_, SyncRun>(&format!(
            "SELECT {} FROM sync_runs WHERE id = ?1",
            RUN_COLUMNS
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(run)
    }

    /// Most recent run of a job that is no longer running.
    pub async fn latest_finished(&self, job_name: &str) -> DbResult<Option<SyncRun>> {
        let run = sqlx::query_as::<_, SyncRun>(&format!(
            "SELECT {} FROM sync_runs WHERE job_name = ?1 AND status <> 'running' \
             ORDER BY id DESC LIMIT 1",
            RUN_COLUMNS
        ))
        .bind(job_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(run)
    }

    /// Most recent completed run of a job.
    pub async fn latest_completed(&self, job_name: &str) -> DbResult<Option<SyncRun>> {
        let run = sqlx::query_as::<_, SyncRun>(&format!(
            "SELECT {} FROM sync_runs WHERE job_name = ?1 AND status = 'completed' \
             ORDER BY id DESC LIMIT 1",
            RUN_COLUMNS
        ))
        .bind(job_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(run)
    }

    /// Most recent runs of any job, newest first.
    pub async fn recent(&self, limit: u32) -> DbResult<Vec<SyncRun>> {
        let runs = sqlx::query_as::<_, SyncRun>(&format!(
            "SELECT {} FROM sync_runs ORDER BY id DESC LIMIT ?1",
            RUN_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use storewatch_core::RunStatus;

    #[tokio::test]
    async fn test_run_lifecycle() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let runs = db.runs();

        let first = runs.start("store-sync", Utc::now()).await.unwrap();
        let second = runs.start("store-sync", Utc::now()).await.unwrap();
        assert!(second > first);

        let covered = vec!["partner".to_string(), "grab".to_string()];
        let failed = vec!["partner:S9".to_string()];
        runs.complete(first, &covered, &failed, Utc::now())
            .await
            .unwrap();
        runs.fail(second, ErrorClass::Timeout, "collector timed out", &[], Utc::now())
            .await
            .unwrap();

        let completed = runs.latest_completed("store-sync").await.unwrap().unwrap();
        assert_eq!(completed.id, first);
        assert_eq!(completed.status, RunStatus::Completed);
        assert_eq!(completed.covered(), vec!["partner", "grab"]);
        assert!(completed.is_partial());

        let finished = runs.latest_finished("store-sync").await.unwrap().unwrap();
        assert_eq!(finished.id, second);
        assert_eq!(finished.error_class, Some(ErrorClass::Timeout));
        assert_eq!(finished.error_message.as_deref(), Some("collector timed out"));

        assert_eq!(runs.recent(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_finished_run_cannot_be_finished_again() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let runs = db.runs();
        let id = runs.start("store-sync", Utc::now()).await.unwrap();

        runs.complete(id, &[], &[], Utc::now()).await.unwrap();
        let err = runs
            .fail(id, ErrorClass::Internal, "late failure", &[], Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound { .. }));
        assert_eq!(
            runs.get(id).await.unwrap().unwrap().status,
            RunStatus::Completed
        );
    }
}
