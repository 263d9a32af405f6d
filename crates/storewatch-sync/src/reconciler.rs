//! # Snapshot Reconciler
//!
//! Applies one run's observations to the snapshot history. The diff itself is
//! `storewatch_core::plan`; persistence is one transaction in
//! `SnapshotRepository::apply_run_with`, which also carries the run's shop
//! and platform status upserts. This layer adds timing, logging and a
//! bounded retry when SQLite reports the database as busy (the transaction
//! has rolled back by then, so retrying writes the run in full).

use chrono::Utc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::{SyncError, SyncResult};
use storewatch_core::{ItemObservation, ReconcileResult, RemovalScope};
use storewatch_db::{Database, DbError, RunUpserts};

const BUSY_RETRIES: u32 = 3;
const BUSY_BACKOFF: Duration = Duration::from_millis(250);

/// Writes snapshots and changes for a run.
#[derive(Debug, Clone)]
pub struct SnapshotReconciler {
    db: Database,
}

impl SnapshotReconciler {
    pub fn new(db: Database) -> Self {
        SnapshotReconciler { db }
    }

    /// Diffs `observations` against the newest snapshot per key and persists
    /// the result atomically.
    ///
    /// Keys absent from `observations` are removed only where `scope` says
    /// the run covered their source and shop. Reconciling a run id twice
    /// returns the stored counts without writing.
    pub async fn reconcile(
        &self,
        run_id: i64,
        scope: &RemovalScope,
        observations: Vec<ItemObservation>,
    ) -> SyncResult<ReconcileResult> {
        self.reconcile_with(run_id, scope, observations, RunUpserts::default())
            .await
    }

    /// Like [`reconcile`](Self::reconcile), committing the run's shop and
    /// platform status rows in the same transaction.
    pub async fn reconcile_with(
        &self,
        run_id: i64,
        scope: &RemovalScope,
        observations: Vec<ItemObservation>,
        upserts: RunUpserts<'_>,
    ) -> SyncResult<ReconcileResult> {
        let started = Instant::now();
        let observed = observations.len();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = self
                .db
                .snapshots()
                .apply_run_with(run_id, scope, observations.clone(), upserts, Utc::now())
                .await;

            match result {
                Ok(result) => {
                    info!(
                        run_id,
                        observed,
                        snapshots = result.snapshots_written,
                        changes = result.changes_emitted,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Reconciled run"
                    );
                    return Ok(result);
                }
                Err(DbError::Busy(reason)) if attempt < BUSY_RETRIES => {
                    warn!(run_id, attempt, %reason, "Database busy, retrying reconciliation");
                    tokio::time::sleep(BUSY_BACKOFF * attempt).await;
                }
                Err(e) => return Err(SyncError::Database(e)),
            }
        }
    }
}
