//! # Sync Orchestrator
//!
//! Runs one sync job end to end under the run lease.
//!
//! ## Run Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncOrchestrator::run_once                       │
//! │                                                                         │
//! │  Idle ──► lease "run:<job>" ──held──► Skipped (logged, no run row)      │
//! │                 │                                                       │
//! │                 ▼ acquired                                              │
//! │             Running  (sync_runs row inserted)                           │
//! │                 │                                                       │
//! │     ┌───────────┴─────────────┐                                         │
//! │     ▼                         ▼                                         │
//! │  CollectorRunner          PartnerApiClient                              │
//! │  one spawned task         shops, then items per shop                    │
//! │  per platform             (buffer_unordered, max_concurrency)           │
//! │  any failure = fatal      per-shop failure = partial data               │
//! │     └───────────┬─────────────┘                                         │
//! │                 ▼                                                       │
//! │         SnapshotReconciler (one transaction)                            │
//! │                 │                                                       │
//! │                 ▼                                                       │
//! │   snapshots, shops and platform_status committed together,              │
//! │   run completed, dashboard cache invalidated, expired entries purged    │
//! │                 │                                                       │
//! │                 ▼                                                       │
//! │        Completed | Failed ──► lease released on every path              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Auth, timeout, parse and collector errors fail the run before anything is
//! written to the snapshot tables. Prior data is never touched by a failed run.
//!
//! The run lease is renewed by a heartbeat while the run is in progress. If a
//! renewal finds the lease taken over, the run is cancelled.

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::TieredCache;
use crate::collector::{CollectorOutput, CollectorRunner};
use crate::config::StorewatchConfig;
use crate::error::{SyncError, SyncResult};
use crate::lease::{new_holder_id, run_lease_name, LeaseGuard, LeaseStore};
use crate::partner::PartnerApiClient;
use crate::reconciler::SnapshotReconciler;
use storewatch_core::{
    DashboardKey, ErrorClass, ItemObservation, Platform, PlatformStatus, ReconcileResult,
    RemovalScope, Shop, Source,
};
use storewatch_db::{Database, RunUpserts};

// =============================================================================
// Run State & Report
// =============================================================================

/// State of the orchestrator's most recent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Failed,
    /// Another holder had the run lease.
    Skipped,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Outcome of one `run_once` call, handed back to the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// `None` when no run row was created (skipped, or failed before start).
    pub run_id: Option<i64>,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub reconcile: ReconcileResult,
    /// Sources that contributed nothing (`partner`, `partner:<shop>`).
    pub failed_sources: Vec<String>,
    pub error: Option<String>,
    pub error_class: Option<ErrorClass>,
}

impl RunReport {
    fn skipped(started_at: DateTime<Utc>, clock: Instant) -> Self {
        RunReport {
            run_id: None,
            state: RunState::Skipped,
            started_at,
            duration_ms: clock.elapsed().as_millis() as u64,
            reconcile: ReconcileResult::default(),
            failed_sources: Vec::new(),
            error: None,
            error_class: None,
        }
    }

    fn failed(
        run_id: Option<i64>,
        started_at: DateTime<Utc>,
        clock: Instant,
        failed_sources: Vec<String>,
        err: &SyncError,
    ) -> Self {
        RunReport {
            run_id,
            state: RunState::Failed,
            started_at,
            duration_ms: clock.elapsed().as_millis() as u64,
            reconcile: ReconcileResult::default(),
            failed_sources,
            error: Some(err.to_string()),
            error_class: Some(err.class()),
        }
    }

    pub fn is_partial(&self) -> bool {
        self.state == RunState::Completed && !self.failed_sources.is_empty()
    }
}

/// Everything gathered from the sources before reconciliation.
#[derive(Debug, Default)]
struct Gathered {
    observations: Vec<ItemObservation>,
    scope: RemovalScope,
    covered: Vec<String>,
    failed: Vec<String>,
    shops: Vec<Shop>,
    statuses: Vec<PlatformStatus>,
}

// =============================================================================
// SyncOrchestrator
// =============================================================================

/// Coordinates collectors, the partner API and reconciliation for one job.
pub struct SyncOrchestrator {
    db: Database,
    config: Arc<StorewatchConfig>,
    cache: Arc<TieredCache>,
    leases: Arc<dyn LeaseStore>,
    reconciler: SnapshotReconciler,
    partner: Option<Arc<PartnerApiClient>>,
    collector: Option<CollectorRunner>,
    state: RwLock<RunState>,
}

impl SyncOrchestrator {
    pub fn new(
        db: Database,
        config: Arc<StorewatchConfig>,
        cache: Arc<TieredCache>,
        leases: Arc<dyn LeaseStore>,
    ) -> Self {
        SyncOrchestrator {
            reconciler: SnapshotReconciler::new(db.clone()),
            db,
            config,
            cache,
            leases,
            partner: None,
            collector: None,
            state: RwLock::new(RunState::Idle),
        }
    }

    pub fn with_partner(mut self, partner: Arc<PartnerApiClient>) -> Self {
        self.partner = Some(partner);
        self
    }

    pub fn with_collector(mut self, collector: CollectorRunner) -> Self {
        self.collector = Some(collector);
        self
    }

    pub async fn state(&self) -> RunState {
        *self.state.read().await
    }

    fn job_name(&self) -> &str {
        &self.config.sync.job_name
    }

    /// Runs one sync.
    ///
    /// Never returns an error: failures are recorded on the run row and in
    /// the report. A held run lease yields a `Skipped` report.
    pub async fn run_once(&self, page: u32, size: u32, cancel: &CancellationToken) -> RunReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        let job = self.job_name().to_string();

        if self.partner.is_none() && self.collector.is_none() {
            let err = SyncError::InvalidConfig(
                "neither a partner API nor a collector is configured".into(),
            );
            error!(job = %job, error = %err, "Sync run not started");
            return RunReport::failed(None, started_at, clock, Vec::new(), &err);
        }

        let lease = LeaseGuard::try_acquire(
            Arc::clone(&self.leases),
            run_lease_name(&job),
            new_holder_id("run"),
            self.config.run_lease_ttl(),
        )
        .await;

        let guard = match lease {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                info!(job = %job, "Previous run still holds the lease, skipping");
                return RunReport::skipped(started_at, clock);
            }
            Err(e) => {
                error!(job = %job, error = %e, "Could not acquire run lease");
                return RunReport::failed(None, started_at, clock, Vec::new(), &e);
            }
        };

        *self.state.write().await = RunState::Running;
        let run_cancel = cancel.child_token();
        let heartbeat = guard.start_heartbeat(run_cancel.clone());
        let report = self
            .run_with_lease(page, size, &run_cancel, started_at, clock)
            .await;
        heartbeat.stop().await;
        guard.release().await;
        *self.state.write().await = report.state;

        report
    }

    async fn run_with_lease(
        &self,
        page: u32,
        size: u32,
        cancel: &CancellationToken,
        started_at: DateTime<Utc>,
        clock: Instant,
    ) -> RunReport {
        let job = self.job_name();

        let run_id = match self.db.runs().start(job, started_at).await {
            Ok(id) => id,
            Err(e) => {
                let err = SyncError::Database(e);
                error!(job, error = %err, "Could not record run start");
                return RunReport::failed(None, started_at, clock, Vec::new(), &err);
            }
        };
        info!(run_id, job, page, size, "Sync run started");

        match self.execute(run_id, page, size, cancel).await {
            Ok((reconcile, covered, failed)) => {
                let completed = self
                    .db
                    .runs()
                    .complete(run_id, &covered, &failed, Utc::now())
                    .await;
                if let Err(e) = completed {
                    let err = SyncError::Database(e);
                    error!(run_id, error = %err, "Could not mark run completed");
                    return RunReport::failed(Some(run_id), started_at, clock, failed, &err);
                }
                self.invalidate_after_sync(run_id).await;

                let duration_ms = clock.elapsed().as_millis() as u64;
                if failed.is_empty() {
                    info!(
                        run_id,
                        snapshots = reconcile.snapshots_written,
                        changes = reconcile.changes_emitted,
                        elapsed_ms = duration_ms,
                        "Sync run completed"
                    );
                } else {
                    warn!(
                        run_id,
                        failed_sources = ?failed,
                        changes = reconcile.changes_emitted,
                        elapsed_ms = duration_ms,
                        "Sync run completed with partial data"
                    );
                }

                RunReport {
                    run_id: Some(run_id),
                    state: RunState::Completed,
                    started_at,
                    duration_ms,
                    reconcile,
                    failed_sources: failed,
                    error: None,
                    error_class: None,
                }
            }
            Err(err) => {
                let failed = match &err {
                    SyncError::PartialData { failed_sources } => failed_sources.clone(),
                    _ => Vec::new(),
                };
                error!(
                    run_id,
                    class = %err.class(),
                    error = %err,
                    elapsed_ms = clock.elapsed().as_millis() as u64,
                    "Sync run failed"
                );
                if let Some(output) = err.collector_output() {
                    error!(run_id, output, "Collector output");
                }
                if let Err(e) = self
                    .db
                    .runs()
                    .fail(run_id, err.class(), &err.to_string(), &failed, Utc::now())
                    .await
                {
                    error!(run_id, error = %e, "Could not mark run failed");
                }
                RunReport::failed(Some(run_id), started_at, clock, failed, &err)
            }
        }
    }

    /// Gathers and reconciles. Returns counts plus covered and failed sources.
    async fn execute(
        &self,
        run_id: i64,
        page: u32,
        size: u32,
        cancel: &CancellationToken,
    ) -> SyncResult<(ReconcileResult, Vec<String>, Vec<String>)> {
        let mut gathered = Gathered::default();

        if let Some(collector) = &self.collector {
            for &platform in &collector.settings().platforms {
                let output = self.collect(run_id, collector, platform, cancel).await?;
                absorb_collector(&mut gathered, &output, Utc::now());
            }
        }

        if let Some(partner) = &self.partner {
            self.gather_partner(run_id, partner, page, size, cancel, &mut gathered)
                .await?;
        }

        if gathered.covered.is_empty() {
            return Err(SyncError::PartialData {
                failed_sources: gathered.failed,
            });
        }
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let upserts = RunUpserts {
            shops: &gathered.shops,
            statuses: &gathered.statuses,
        };
        let reconcile = self
            .reconciler
            .reconcile_with(run_id, &gathered.scope, gathered.observations, upserts)
            .await?;

        Ok((reconcile, gathered.covered, gathered.failed))
    }

    /// Runs one platform's collector on its own task.
    async fn collect(
        &self,
        run_id: i64,
        collector: &CollectorRunner,
        platform: Platform,
        cancel: &CancellationToken,
    ) -> SyncResult<CollectorOutput> {
        let runner = collector.clone();
        let timeout = collector.settings().timeout();
        let token = cancel.clone();

        let handle =
            tokio::spawn(async move { runner.run_collector(platform, timeout, &token).await });
        let output = handle.await??;

        info!(
            run_id,
            platform = %platform,
            records = output.records.len(),
            elapsed_ms = output.outcome.duration.as_millis() as u64,
            "Collector finished"
        );
        Ok(output)
    }

    async fn gather_partner(
        &self,
        run_id: i64,
        partner: &Arc<PartnerApiClient>,
        page: u32,
        size: u32,
        cancel: &CancellationToken,
        gathered: &mut Gathered,
    ) -> SyncResult<()> {
        let source = Source::Partner.as_str().to_string();
        let listing = tokio::select! {
            listing = partner.list_all_shops(page, size) => listing,
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
        };

        let shops = match listing {
            Ok(shops) => shops,
            Err(e @ SyncError::Auth(_)) => return Err(e),
            Err(e) => {
                warn!(run_id, error = %e, "Shop listing failed, partner data skipped");
                gathered.failed.push(source);
                return Ok(());
            }
        };
        debug!(run_id, shops = shops.len(), "Listed partner shops");

        let fetches = stream::iter(shops.into_iter().map(|shop| {
            let partner = Arc::clone(partner);
            async move {
                let items = partner.list_all_items(&shop.shop_id, size).await;
                (shop, items)
            }
        }))
        .buffer_unordered(self.config.sync.max_concurrency.max(1))
        .collect::<Vec<_>>();

        let results = tokio::select! {
            results = fetches => results,
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
        };

        if page > 1 {
            // Shops on earlier pages were not listed; leave their items alone.
            let listed = results.iter().map(|(shop, _)| shop.shop_id.clone());
            gathered.scope.cover_shops(Source::Partner, listed);
        } else {
            gathered.scope.cover(Source::Partner);
        }
        gathered.covered.push(source);
        let now = Utc::now();

        for (mut shop, items) in results {
            match items {
                Ok(items) => {
                    shop.has_active_items = items.iter().any(|i| i.available);
                    shop.last_synced_at = Some(now);
                    gathered.observations.extend(items);
                    gathered.shops.push(shop);
                }
                Err(e @ SyncError::Auth(_)) => return Err(e),
                Err(e) => {
                    warn!(run_id, shop_id = %shop.shop_id, error = %e, "Item listing failed");
                    gathered.scope.skip_shop(Source::Partner, shop.shop_id.clone());
                    gathered.failed.push(format!("partner:{}", shop.shop_id));
                }
            }
        }

        Ok(())
    }

    async fn invalidate_after_sync(&self, run_id: i64) {
        if let Err(e) = self.cache.invalidate_dashboard().await {
            warn!(run_id, error = %e, "Dashboard cache invalidation failed");
        }
        if let Err(e) = self.cache.invalidate(DashboardKey::ShopNames.key()).await {
            warn!(run_id, error = %e, "Shop name cache invalidation failed");
        }
        if let Err(e) = self.cache.purge_expired().await {
            warn!(run_id, error = %e, "Expired cache purge failed");
        }
    }
}

// =============================================================================
// Collector Output → Observations & Status
// =============================================================================

/// Adds a platform's records to the run.
///
/// A shop's status comes from its store-level record when there is one;
/// otherwise the shop counts as online while any item is available.
fn absorb_collector(gathered: &mut Gathered, output: &CollectorOutput, now: DateTime<Utc>) {
    let platform = output.platform;
    gathered.scope.cover(Source::from(platform));
    gathered.covered.push(platform.as_str().to_string());
    gathered.observations.extend(output.observations());

    // shop_id -> (store-level availability, items, available items)
    let mut per_shop: BTreeMap<&str, (Option<bool>, i64, i64)> = BTreeMap::new();
    for record in &output.records {
        let entry = per_shop.entry(record.shop_id.as_str()).or_default();
        if record.is_store_level() {
            entry.0 = Some(record.available);
        } else {
            entry.1 += 1;
            if record.available {
                entry.2 += 1;
            }
        }
    }

    gathered
        .statuses
        .extend(per_shop.into_iter().map(|(shop_id, (store, total, available))| {
            PlatformStatus {
                shop_id: shop_id.to_string(),
                platform,
                online: store.unwrap_or(available > 0),
                items_synced: available,
                items_total: total,
                last_checked_at: now,
                last_error: None,
            }
        }));
}
