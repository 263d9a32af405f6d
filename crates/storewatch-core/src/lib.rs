//! # storewatch-core: Pure Domain Logic for Storewatch
//!
//! Storewatch tracks whether physical stores are online, and which of their
//! items are available, across several food-delivery marketplaces. This crate
//! holds the domain model and every decision that can be made without I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Storewatch Architecture                          │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 apps/sync-job (`storewatch` CLI)                │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                       storewatch-sync                           │   │
//! │  │  TokenStore • PartnerApiClient • CollectorRunner                │   │
//! │  │  SnapshotReconciler • SyncOrchestrator • TieredCache            │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │              ★ storewatch-core (THIS CRATE) ★                   │   │
//! │  │                                                                 │   │
//! │  │   ┌──────────┐ ┌─────────────┐ ┌───────────┐ ┌──────────┐      │   │
//! │  │   │  types   │ │ fingerprint │ │ reconcile │ │  alerts  │      │   │
//! │  │   │ Snapshot │ │  ItemState  │ │   plan()  │ │ evaluate │      │   │
//! │  │   │  Change  │ │   sha256    │ │           │ │          │      │   │
//! │  │   └──────────┘ └─────────────┘ └───────────┘ └──────────┘      │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 storewatch-db (SQLite layer)                    │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (Shop, ItemSnapshot, ItemChange, PlatformStatus, SyncRun)
//! - [`fingerprint`] - Comparable item state and its stable hash
//! - [`reconcile`] - Pure diff of observations against prior snapshots
//! - [`cache`] - TTL tiers and the dashboard cache key catalogue
//! - [`alerts`] - Alert-worthy condition rules
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use storewatch_core::fingerprint::ItemState;
//!
//! let before = ItemState::new(true, Some(1290), Some("Nasi Lemak"), None);
//! let after = ItemState { available: false, ..before.clone() };
//!
//! assert_ne!(before.fingerprint(), after.fingerprint());
//! assert!(before.only_availability_differs(&after));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod alerts;
pub mod cache;
pub mod error;
pub mod fingerprint;
pub mod reconcile;
pub mod types;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use cache::{CacheTier, DashboardKey};
pub use error::{CoreError, CoreResult};
pub use fingerprint::ItemState;
pub use reconcile::{plan, ReconcilePlan, RemovalScope};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Fingerprint stored on tombstone snapshots written for `removed` transitions.
///
/// Never collides with a real fingerprint (those are 64 hex characters).
pub const REMOVED_FINGERPRINT: &str = "removed";

/// Default job name for the scheduled sync.
pub const DEFAULT_JOB_NAME: &str = "store-sync";
