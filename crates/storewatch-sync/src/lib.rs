//! # storewatch-sync: Sync Engine for Storewatch
//!
//! Pulls shop and item data from the partner API and the delivery-platform
//! collectors, reconciles it into the snapshot history, and serves cached
//! dashboard reads.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                Scheduler (interval tick, Skip)                   │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               ▼                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │           SyncOrchestrator (run lease per job name)              │  │
//! │  └──────┬──────────────────────┬──────────────────────┬─────────────┘  │
//! │         ▼                      ▼                      ▼                 │
//! │  ┌────────────────┐  ┌──────────────────┐  ┌────────────────────────┐  │
//! │  │CollectorRunner │  │ PartnerApiClient │  │  SnapshotReconciler    │  │
//! │  │                │  │                  │  │                        │  │
//! │  │ External cmd,  │  │ Paged shop/item  │  │ Diff against newest    │  │
//! │  │ timeout, JSON  │  │ listings, one    │  │ snapshot per key, one  │  │
//! │  │ extraction     │  │ retry on 401     │  │ transaction per run    │  │
//! │  └────────────────┘  └────────┬─────────┘  └────────────────────────┘  │
//! │                               ▼                                         │
//! │                      ┌──────────────────┐                               │
//! │                      │    TokenStore    │                               │
//! │                      │ shared token,    │                               │
//! │                      │ leased refresh   │                               │
//! │                      └──────────────────┘                               │
//! │                                                                         │
//! │  READ SIDE:                                                            │
//! │  ──────────                                                            │
//! │  Dashboard ──► TieredCache (fast / moderate / slow / very slow)        │
//! │                    │                                                    │
//! │                    └──► CacheStore: SQLite table | Redis               │
//! │                                                                         │
//! │  COORDINATION (cross-process):                                         │
//! │  ─────────────────────────────                                         │
//! │  LeaseStore: SQLite row with expiry | Redis SET NX PX                  │
//! │  • "run:<job>"             one sync run at a time                      │
//! │  • "partner:token:refresh" one token refresh at a time                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`config`] - `storewatch.toml` plus `STOREWATCH_*` overrides
//! - [`error`] - Sync error types and run failure classes
//! - [`lease`] - Lease locks with TTL
//! - [`cache`] - Cache stores and the tiered cache
//! - [`token`] - Partner token store
//! - [`partner`] - Partner API client
//! - [`collector`] - Collector process runner
//! - [`reconciler`] - Snapshot reconciliation
//! - [`orchestrator`] - One sync run end to end
//! - [`scheduler`] - Periodic runs with cancellation
//! - [`dashboard`] - Cached read-side queries
//!
//! ## Usage
//!
//! ```rust,ignore
//! use storewatch_sync::{Scheduler, StorewatchConfig, SyncOrchestrator};
//!
//! let config = Arc::new(StorewatchConfig::load(None)?);
//! let orchestrator = SyncOrchestrator::new(db, config.clone(), cache, leases)
//!     .with_collector(CollectorRunner::new(config.collector.clone()));
//!
//! let scheduler = Scheduler::new(Arc::new(orchestrator), config.sync.interval(), 1, 100);
//! let stats = scheduler.run(cancel).await;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;

// Coordination and caching
pub mod cache;
pub mod lease;

// Sources
pub mod collector;
pub mod partner;
pub mod token;

// Run pipeline
pub mod dashboard;
pub mod orchestrator;
pub mod reconciler;
pub mod scheduler;

// =============================================================================
// Re-exports
// =============================================================================

pub use cache::{CacheStore, RedisCacheStore, SqliteCacheStore, TieredCache};
pub use collector::{CollectorOutput, CollectorRecord, CollectorRunner};
pub use config::{CacheBackend, StorewatchConfig};
pub use dashboard::{Dashboard, DashboardOverview};
pub use error::{SyncError, SyncResult};
pub use lease::{LeaseGuard, LeaseStore, RedisLeaseStore, SqliteLeaseStore};
pub use orchestrator::{RunReport, RunState, SyncOrchestrator};
pub use partner::{build_http_client, PartnerApiClient};
pub use reconciler::SnapshotReconciler;
pub use scheduler::{Scheduler, SchedulerStats};
pub use token::{Token, TokenStore};
