//! # Repository Module
//!
//! Database repository implementations for Storewatch.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repository Pattern                                   │
//! │                                                                         │
//! │  SyncOrchestrator                                                      │
//! │       │                                                                 │
//! │       │  db.snapshots().apply_run(run_id, &scope, observations, now)   │
//! │       ▼                                                                 │
//! │  SnapshotRepository                                                    │
//! │  ├── apply_run(...)        one transaction per run                     │
//! │  ├── latest_all()          newest row per key                          │
//! │  └── recent_changes(...)   change log, newest first                    │
//! │       │                                                                 │
//! │       │  SQL Query                                                      │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`ShopRepository`] - Shop upserts and the id → name map
//! - [`SnapshotRepository`] - Snapshots, change log, item KPIs
//! - [`PlatformStatusRepository`] - Per-(shop, platform) status
//! - [`RunRepository`] - Sync run lifecycle rows
//! - [`CacheRepository`] - Shared cache entries
//! - [`LeaseRepository`] - Cross-process lease locks

pub mod cache;
pub mod lease;
pub mod platform_status;
pub mod run;
pub mod shop;
pub mod snapshot;

pub use cache::CacheRepository;
pub use lease::LeaseRepository;
pub use platform_status::PlatformStatusRepository;
pub use run::RunRepository;
pub use shop::ShopRepository;
pub use snapshot::{RunUpserts, SnapshotRepository};

/// Converts an instant to the Unix-millisecond form used by lease and cache rows.
pub(crate) fn millis(at: chrono::DateTime<chrono::Utc>) -> i64 {
    at.timestamp_millis()
}
