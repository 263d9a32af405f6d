//! # storewatch-db: Database Layer for Storewatch
//!
//! This crate provides database access for the Storewatch sync pipeline.
//! It uses SQLite with sqlx for async operations.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Storewatch Data Flow                             │
//! │                                                                         │
//! │  SyncOrchestrator / TieredCache / Dashboard (storewatch-sync)          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  storewatch-db (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────────┐  ┌────────────┐  │   │
//! │  │   │   Database    │    │    Repositories    │  │ Migrations │  │   │
//! │  │   │   (pool.rs)   │    │                    │  │ (embedded) │  │   │
//! │  │   │               │    │ SnapshotRepository │  │            │  │   │
//! │  │   │ SqlitePool    │◄───│ RunRepository      │  │ 001_init   │  │   │
//! │  │   │ WAL, FKs      │    │ LeaseRepository    │  │            │  │   │
//! │  │   │               │    │ CacheRepository    │  │            │  │   │
//! │  │   └───────────────┘    └────────────────────┘  └────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite database file (shared by every storewatch process)             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Repository implementations
//!
//! ## Usage
//!
//! ```rust,ignore
//! use storewatch_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("storewatch.db")).await?;
//! let run_id = db.runs().start("store-sync", Utc::now()).await?;
//! let result = db.snapshots().apply_run(run_id, &scope, observations, Utc::now()).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::{
    CacheRepository, LeaseRepository, PlatformStatusRepository, RunRepository, RunUpserts,
    ShopRepository, SnapshotRepository,
};
