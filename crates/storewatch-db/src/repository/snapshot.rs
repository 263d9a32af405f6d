//! # Snapshot Repository
//!
//! Append-only item snapshots and the change log derived from them.
//!
//! ## One Transaction Per Run
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                   apply_run(run_id, scope, observations)                │
//! │                                                                         │
//! │  BEGIN                                                                  │
//! │   1. UPDATE sync_runs ... WHERE id = run_id   ← takes the write lock   │
//! │   2. snapshots for run_id already present?    → return stored counts   │
//! │   3. SELECT newest snapshot per key           ← prior state            │
//! │   4. storewatch_core::plan(...)               ← pure diff              │
//! │   5. INSERT item_snapshots                                              │
//! │   6. INSERT item_changes ON CONFLICT DO NOTHING                         │
//! │   7. UPDATE sync_runs SET counts                                        │
//! │   8. upsert shops + platform_status seen by the run                     │
//! │  COMMIT ← all rows or none                                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Taking the write lock before reading prior state serializes concurrent
//! writers, so a second writer always diffs against the first one's rows.
//! `UNIQUE (shop_id, item_id, run_id)` on changes backs the same guarantee at
//! the schema level.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::repository::platform_status::upsert_statuses_in;
use crate::repository::shop::upsert_shops_in;
use storewatch_core::{
    plan, ItemChange, ItemObservation, ItemSnapshot, PlatformStatus, ReconcileResult,
    RemovalScope, Shop, ShopAvailability,
};

const SNAPSHOT_COLUMNS: &str = "id, run_id, shop_id, item_id, source, name, code, category, \
     price_cents, available, fingerprint, removed, payload, captured_at";

/// Newest snapshot id per key. Insertion order follows write-lock order.
const LATEST_IDS: &str = "SELECT MAX(id) FROM item_snapshots GROUP BY shop_id, item_id";

/// Store-level records (item key == platform name) are not items.
const ITEM_ROWS_ONLY: &str = "NOT (source <> 'partner' AND item_id = source)";

/// Shop and status rows committed together with a run's snapshots.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunUpserts<'a> {
    pub shops: &'a [Shop],
    pub statuses: &'a [PlatformStatus],
}

/// Repository for snapshots and item changes.
#[derive(Debug, Clone)]
pub struct SnapshotRepository {
    pool: SqlitePool,
}

impl SnapshotRepository {
    /// Creates a new SnapshotRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SnapshotRepository { pool }
    }

    /// Diffs and persists one run's observations atomically.
    ///
    /// ## Returns
    /// * `Ok(ReconcileResult)` - counts written (or already stored for this run)
    /// * `Err(DbError::NotFound)` - the run row does not exist
    ///
    /// Any error rolls back every row of the run.
    pub async fn apply_run(
        &self,
        run_id: i64,
        scope: &RemovalScope,
        observations: Vec<ItemObservation>,
        captured_at: DateTime<Utc>,
    ) -> DbResult<ReconcileResult> {
        self.apply_run_with(run_id, scope, observations, RunUpserts::default(), captured_at)
            .await
    }

    /// [`apply_run`](Self::apply_run) plus the run's shop and status upserts,
    /// all in the same transaction.
    pub async fn apply_run_with(
        &self,
        run_id: i64,
        scope: &RemovalScope,
        observations: Vec<ItemObservation>,
        upserts: RunUpserts<'_>,
        captured_at: DateTime<Utc>,
    ) -> DbResult<ReconcileResult> {
        let mut tx = self.pool.begin().await?;

        let touched = sqlx::query("UPDATE sync_runs SET status = status WHERE id = ?1")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
        if touched.rows_affected() == 0 {
            return Err(DbError::not_found("SyncRun", run_id.to_string()));
        }

        let existing = Self::stored_counts(&mut tx, run_id).await?;
        if existing.snapshots_written > 0 {
            info!(run_id, "Run already reconciled, returning stored counts");
            upsert_shops_in(&mut tx, upserts.shops).await?;
            upsert_statuses_in(&mut tx, upserts.statuses).await?;
            tx.commit().await?;
            return Ok(existing);
        }

        let prior_rows = sqlx::query_as::<_, ItemSnapshot>(&format!(
            "SELECT {} FROM item_snapshots WHERE id IN ({})",
            SNAPSHOT_COLUMNS, LATEST_IDS
        ))
        .fetch_all(&mut *tx)
        .await?;
        let prior: HashMap<_, _> = prior_rows.into_iter().map(|s| (s.key(), s)).collect();

        debug!(
            run_id,
            prior = prior.len(),
            observed = observations.len(),
            "Planning reconciliation"
        );
        let planned = plan(run_id, scope, &prior, observations, captured_at);

        let mut result = ReconcileResult::default();

        for snap in &planned.snapshots {
            sqlx::query(
                r#"
                INSERT INTO item_snapshots (
                    run_id, shop_id, item_id, source, name, code, category,
                    price_cents, available, fingerprint, removed, payload, captured_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                "#,
            )
            .bind(snap.run_id)
            .bind(&snap.shop_id)
            .bind(&snap.item_id)
            .bind(snap.source.as_str())
            .bind(&snap.name)
            .bind(&snap.code)
            .bind(&snap.category)
            .bind(snap.price_cents)
            .bind(snap.available)
            .bind(&snap.fingerprint)
            .bind(snap.removed)
            .bind(snap.payload.to_string())
            .bind(snap.captured_at)
            .execute(&mut *tx)
            .await?;
            result.snapshots_written += 1;
        }

        for change in &planned.changes {
            let before = change.before.as_ref().map(serde_json::to_string).transpose()?;
            let after = change.after.as_ref().map(serde_json::to_string).transpose()?;

            let inserted = sqlx::query(
                r#"
                INSERT INTO item_changes (
                    run_id, shop_id, item_id, change_type, before_state, after_state, changed_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(shop_id, item_id, run_id) DO NOTHING
                "#,
            )
            .bind(change.run_id)
            .bind(&change.shop_id)
            .bind(&change.item_id)
            .bind(change.change_type.as_str())
            .bind(before)
            .bind(after)
            .bind(change.changed_at)
            .execute(&mut *tx)
            .await?;
            result.changes_emitted += inserted.rows_affected();
        }

        sqlx::query(
            "UPDATE sync_runs SET snapshots_written = ?1, changes_emitted = ?2 WHERE id = ?3",
        )
        .bind(result.snapshots_written as i64)
        .bind(result.changes_emitted as i64)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        upsert_shops_in(&mut tx, upserts.shops).await?;
        upsert_statuses_in(&mut tx, upserts.statuses).await?;

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        info!(
            run_id,
            snapshots = result.snapshots_written,
            changes = result.changes_emitted,
            "Run reconciled"
        );
        Ok(result)
    }

    async fn stored_counts(
        tx: &mut Transaction<'_, Sqlite>,
        run_id: i64,
    ) -> DbResult<ReconcileResult> {
        let (snapshots, changes): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM item_snapshots WHERE run_id = ?1),
                (SELECT COUNT(*) FROM item_changes WHERE run_id = ?1)
            "#,
        )
        .bind(run_id)
        .fetch_one(&mut **tx)
        .await?;

        Ok(ReconcileResult {
            snapshots_written: snapshots as u64,
            changes_emitted: changes as u64,
        })
    }

    /// Newest snapshot for every key, tombstones included.
    pub async fn latest_all(&self) -> DbResult<Vec<ItemSnapshot>> {
        let rows = sqlx::query_as::<_, ItemSnapshot>(&format!(
            "SELECT {} FROM item_snapshots WHERE id IN ({}) ORDER BY shop_id, item_id",
            SNAPSHOT_COLUMNS, LATEST_IDS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Newest snapshot for one key.
    pub async fn latest(&self, shop_id: &str, item_id: &str) -> DbResult<Option<ItemSnapshot>> {
        let row = sqlx::query_as::<_, ItemSnapshot>(&format!(
            "SELECT {} FROM item_snapshots WHERE shop_id = ?1 AND item_id = ?2 \
             ORDER BY id DESC LIMIT 1",
            SNAPSHOT_COLUMNS
        ))
        .bind(shop_id)
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Number of snapshot rows written by a run.
    pub async fn count_for_run(&self, run_id: i64) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM item_snapshots WHERE run_id = ?1")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// Change-log rows written by a run, in insertion order.
    pub async fn changes_for_run(&self, run_id: i64) -> DbResult<Vec<ItemChange>> {
        let rows = sqlx::query_as::<_, ItemChange>(
            r#"
            SELECT id, run_id, shop_id, item_id, change_type, before_state, after_state, changed_at
            FROM item_changes
            WHERE run_id = ?1
            ORDER BY id
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Most recent changes, newest first.
    pub async fn recent_changes(&self, limit: u32) -> DbResult<Vec<ItemChange>> {
        let rows = sqlx::query_as::<_, ItemChange>(
            r#"
            SELECT id, run_id, shop_id, item_id, change_type, before_state, after_state, changed_at
            FROM item_changes
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// `(total, available)` over the current truth of every live item.
    pub async fn item_counts(&self) -> DbResult<(i64, i64)> {
        let counts: (i64, i64) = sqlx::query_as(&format!(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN available THEN 1 ELSE 0 END), 0) \
             FROM item_snapshots WHERE id IN ({}) AND removed = 0 AND {}",
            LATEST_IDS, ITEM_ROWS_ONLY
        ))
        .fetch_one(&self.pool)
        .await?;

        Ok(counts)
    }

    /// Per-shop live item availability, joined with shop names.
    pub async fn availability_by_shop(&self) -> DbResult<Vec<ShopAvailability>> {
        let rows = sqlx::query_as::<_, ShopAvailability>(&format!(
            r#"
            SELECT
                s.shop_id AS shop_id,
                sh.name AS name,
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN s.available THEN 1 ELSE 0 END), 0) AS available
            FROM item_snapshots s
            LEFT JOIN shops sh ON sh.shop_id = s.shop_id
            WHERE s.id IN ({})
              AND s.removed = 0
              AND NOT (s.source <> 'partner' AND s.item_id = s.source)
            GROUP BY s.shop_id, sh.name
            ORDER BY s.shop_id
            "#,
            LATEST_IDS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
