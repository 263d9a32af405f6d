//! # Domain Types
//!
//! Core domain types used throughout Storewatch.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │      Shop       │   │  ItemSnapshot   │   │   ItemChange    │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  shop_id        │   │  run_id         │   │  run_id         │       │
//! │  │  name / brand   │   │  shop_id        │   │  shop_id        │       │
//! │  │  has_active_... │   │  item_id        │   │  item_id        │       │
//! │  │  last_synced_at │   │  fingerprint    │   │  change_type    │       │
//! │  └─────────────────┘   │  removed        │   │  before / after │       │
//! │                        └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │ PlatformStatus  │   │    SyncRun      │   │    Platform     │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  (shop,platform)│   │  id (autoinc)   │   │  Grab           │       │
//! │  │  online         │   │  status         │   │  Foodpanda      │       │
//! │  │  items synced   │   │  failed_sources │   │  Deliveroo      │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Item Keys
//! Snapshots are keyed by `(shop_id, item_id)`. Partner items use the partner
//! item id as-is. Marketplace collector records are platform-qualified
//! (`grab:<item>`), and a store-level record with no item id uses the bare
//! platform name (`grab`) so one shop can be tracked on several platforms.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::fingerprint::ItemState;

// =============================================================================
// Platform
// =============================================================================

/// A third-party food-delivery marketplace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Grab,
    Foodpanda,
    Deliveroo,
}

impl Platform {
    /// Every tracked marketplace, in collector output order.
    pub const ALL: [Platform; 3] = [Platform::Grab, Platform::Foodpanda, Platform::Deliveroo];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Platform::Grab => "grab",
            Platform::Foodpanda => "foodpanda",
            Platform::Deliveroo => "deliveroo",
        }
    }

    /// Item key for a collector record on this platform.
    ///
    /// ```rust
    /// use storewatch_core::Platform;
    ///
    /// assert_eq!(Platform::Grab.item_key(Some("42")), "grab:42");
    /// assert_eq!(Platform::Grab.item_key(None), "grab");
    /// ```
    pub fn item_key(&self, item_id: Option<&str>) -> String {
        match item_id {
            Some(id) if !id.trim().is_empty() => format!("{}:{}", self.as_str(), id.trim()),
            _ => self.as_str().to_string(),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grab" => Ok(Platform::Grab),
            "foodpanda" => Ok(Platform::Foodpanda),
            "deliveroo" => Ok(Platform::Deliveroo),
            other => Err(CoreError::UnknownPlatform(other.to_string())),
        }
    }
}

// =============================================================================
// Source
// =============================================================================

/// The feed an observation came from.
///
/// Removal detection is scoped by source: keys owned by a source that was not
/// fully covered in a run are never reported as removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// The partner API item listing.
    Partner,
    Grab,
    Foodpanda,
    Deliveroo,
}

impl Source {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Source::Partner => "partner",
            Source::Grab => "grab",
            Source::Foodpanda => "foodpanda",
            Source::Deliveroo => "deliveroo",
        }
    }

    /// The marketplace behind this source, if any.
    pub const fn platform(&self) -> Option<Platform> {
        match self {
            Source::Partner => None,
            Source::Grab => Some(Platform::Grab),
            Source::Foodpanda => Some(Platform::Foodpanda),
            Source::Deliveroo => Some(Platform::Deliveroo),
        }
    }
}

impl From<Platform> for Source {
    fn from(platform: Platform) -> Self {
        match platform {
            Platform::Grab => Source::Grab,
            Platform::Foodpanda => Source::Foodpanda,
            Platform::Deliveroo => Source::Deliveroo,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "partner" => Ok(Source::Partner),
            other => other
                .parse::<Platform>()
                .map(Source::from)
                .map_err(|_| CoreError::UnknownSource(other.to_string())),
        }
    }
}

// =============================================================================
// Shop
// =============================================================================

/// A physical store known to the partner API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Shop {
    pub shop_id: String,
    pub name: String,
    /// Brand / organization name.
    pub brand: Option<String>,
    pub has_active_items: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Item Key & Observation
// =============================================================================

/// Identity of a tracked item: `(shop_id, item_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub shop_id: String,
    pub item_id: String,
}

impl ItemKey {
    pub fn new(shop_id: impl Into<String>, item_id: impl Into<String>) -> Self {
        ItemKey {
            shop_id: shop_id.into(),
            item_id: item_id.into(),
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.shop_id, self.item_id)
    }
}

/// One item (or store-level record) as seen by a feed during a run.
///
/// Produced by the partner client and the collector, consumed by the
/// reconciler. Nothing here is persisted until the run reconciles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemObservation {
    pub shop_id: String,
    pub item_id: String,
    pub source: Source,
    pub name: Option<String>,
    pub code: Option<String>,
    pub category: Option<String>,
    pub price_cents: Option<i64>,
    pub available: bool,
    /// Raw record as received, kept for diagnostics.
    pub payload: serde_json::Value,
}

impl ItemObservation {
    pub fn key(&self) -> ItemKey {
        ItemKey::new(self.shop_id.clone(), self.item_id.clone())
    }

    /// The comparable subset used for fingerprinting.
    pub fn state(&self) -> ItemState {
        ItemState {
            available: self.available,
            price_cents: self.price_cents,
            name: self.name.clone(),
            category: self.category.clone(),
        }
    }
}

// =============================================================================
// Item Snapshot
// =============================================================================

/// A stored observation. One row per item per run; the newest row for a key
/// is the current truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct ItemSnapshot {
    pub id: i64,
    pub run_id: i64,
    pub shop_id: String,
    pub item_id: String,
    pub source: Source,
    pub name: Option<String>,
    pub code: Option<String>,
    pub category: Option<String>,
    pub price_cents: Option<i64>,
    pub available: bool,
    pub fingerprint: String,
    /// Tombstone written when the key disappeared from its source.
    pub removed: bool,
    /// Raw JSON payload.
    pub payload: String,
    pub captured_at: DateTime<Utc>,
}

impl ItemSnapshot {
    pub fn key(&self) -> ItemKey {
        ItemKey::new(self.shop_id.clone(), self.item_id.clone())
    }

    pub fn state(&self) -> ItemState {
        ItemState {
            available: self.available,
            price_cents: self.price_cents,
            name: self.name.clone(),
            category: self.category.clone(),
        }
    }
}

/// A snapshot row about to be inserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSnapshot {
    pub run_id: i64,
    pub shop_id: String,
    pub item_id: String,
    pub source: Source,
    pub name: Option<String>,
    pub code: Option<String>,
    pub category: Option<String>,
    pub price_cents: Option<i64>,
    pub available: bool,
    pub fingerprint: String,
    pub removed: bool,
    pub payload: serde_json::Value,
    pub captured_at: DateTime<Utc>,
}

// =============================================================================
// Item Change
// =============================================================================

/// Kind of transition recorded in the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Updated,
    Removed,
    /// Only the availability flag flipped.
    AvailabilityToggled,
}

impl ChangeType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Created => "created",
            ChangeType::Updated => "updated",
            ChangeType::Removed => "removed",
            ChangeType::AvailabilityToggled => "availability_toggled",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable change-log row. Before/after states are stored as JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct ItemChange {
    pub id: i64,
    pub run_id: i64,
    pub shop_id: String,
    pub item_id: String,
    pub change_type: ChangeType,
    pub before_state: Option<String>,
    pub after_state: Option<String>,
    pub changed_at: DateTime<Utc>,
}

impl ItemChange {
    /// Decodes the stored before-state.
    pub fn before(&self) -> Option<ItemState> {
        self.before_state
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
    }

    /// Decodes the stored after-state.
    pub fn after(&self) -> Option<ItemState> {
        self.after_state
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
    }
}

/// A change-log row about to be inserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewChange {
    pub run_id: i64,
    pub shop_id: String,
    pub item_id: String,
    pub change_type: ChangeType,
    pub before: Option<ItemState>,
    pub after: Option<ItemState>,
    pub changed_at: DateTime<Utc>,
}

/// Counts produced by reconciling one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileResult {
    pub snapshots_written: u64,
    pub changes_emitted: u64,
}

// =============================================================================
// Platform Status
// =============================================================================

/// Per-(shop, platform) operational status. At most one row per pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct PlatformStatus {
    pub shop_id: String,
    pub platform: Platform,
    pub online: bool,
    pub items_synced: i64,
    pub items_total: i64,
    pub last_checked_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

// =============================================================================
// Sync Run
// =============================================================================

/// Persisted lifecycle of a sync run. `Skipped` runs never get a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(CoreError::UnknownRunStatus(other.to_string())),
        }
    }
}

/// Coarse failure category persisted on runs and used by alert rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Auth,
    Timeout,
    Parse,
    Collector,
    PartialData,
    Storage,
    Cancelled,
    Config,
    Internal,
}

impl ErrorClass {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Auth => "auth",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Parse => "parse",
            ErrorClass::Collector => "collector",
            ErrorClass::PartialData => "partial_data",
            ErrorClass::Storage => "storage",
            ErrorClass::Cancelled => "cancelled",
            ErrorClass::Config => "config",
            ErrorClass::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of the `sync_runs` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct SyncRun {
    pub id: i64,
    pub job_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub snapshots_written: i64,
    pub changes_emitted: i64,
    /// JSON array of sources that contributed observations.
    pub covered_sources: String,
    /// JSON array of sources that failed (partial data).
    pub failed_sources: String,
    pub error_class: Option<ErrorClass>,
    pub error_message: Option<String>,
}

impl SyncRun {
    pub fn covered(&self) -> Vec<String> {
        serde_json::from_str(&self.covered_sources).unwrap_or_default()
    }

    pub fn failed(&self) -> Vec<String> {
        serde_json::from_str(&self.failed_sources).unwrap_or_default()
    }

    /// Completed, but some sources contributed nothing.
    pub fn is_partial(&self) -> bool {
        self.status == RunStatus::Completed && !self.failed().is_empty()
    }
}

// =============================================================================
// Dashboard Read Models
// =============================================================================

/// Online/offline counts for one platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct PlatformSummary {
    pub platform: Platform,
    pub online: i64,
    pub offline: i64,
    pub total: i64,
}

/// A shop that is offline on at least one platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct OfflineShop {
    pub shop_id: String,
    pub name: Option<String>,
    pub platform: Platform,
    pub last_checked_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Per-shop item availability counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct ShopAvailability {
    pub shop_id: String,
    pub name: Option<String>,
    pub total: i64,
    pub available: i64,
}

/// Which data the KPIs were computed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coverage {
    pub run_id: Option<i64>,
    /// False when the latest run was partial or no run has completed yet.
    pub complete: bool,
    pub failed_sources: Vec<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Coverage {
    pub fn from_run(run: Option<&SyncRun>) -> Self {
        match run {
            Some(run) => {
                let failed_sources = run.failed();
                Coverage {
                    run_id: Some(run.id),
                    complete: failed_sources.is_empty(),
                    failed_sources,
                    finished_at: run.finished_at,
                }
            }
            None => Coverage {
                run_id: None,
                complete: false,
                failed_sources: Vec::new(),
                finished_at: None,
            },
        }
    }
}

/// Item-level KPIs over the current truth of every tracked key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemKpis {
    pub total_items: i64,
    pub available: i64,
    pub unavailable: i64,
    /// `available / total_items`, 0.0 when nothing is tracked.
    pub availability_ratio: f64,
    pub coverage: Coverage,
}

impl ItemKpis {
    pub fn new(total_items: i64, available: i64, coverage: Coverage) -> Self {
        let availability_ratio = if total_items > 0 {
            available as f64 / total_items as f64
        } else {
            0.0
        };
        ItemKpis {
            total_items,
            available,
            unavailable: total_items - available,
            availability_ratio,
            coverage,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn run(status: RunStatus, failed: &str) -> SyncRun {
        SyncRun {
            id: 7,
            job_name: "store-sync".to_string(),
            status,
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            snapshots_written: 0,
            changes_emitted: 0,
            covered_sources: r#"["grab"]"#.to_string(),
            failed_sources: failed.to_string(),
            error_class: None,
            error_message: None,
        }
    }

    #[test]
    fn test_platform_parse() {
        assert_eq!("Grab".parse::<Platform>().unwrap(), Platform::Grab);
        assert_eq!(" deliveroo ".parse::<Platform>().unwrap(), Platform::Deliveroo);
        assert!(matches!(
            "ubereats".parse::<Platform>(),
            Err(CoreError::UnknownPlatform(_))
        ));
    }

    #[test]
    fn test_source_parse() {
        assert_eq!("partner".parse::<Source>().unwrap(), Source::Partner);
        assert_eq!("foodpanda".parse::<Source>().unwrap(), Source::Foodpanda);
        assert!(matches!("x".parse::<Source>(), Err(CoreError::UnknownSource(_))));
        assert_eq!(Source::from(Platform::Grab).platform(), Some(Platform::Grab));
        assert_eq!(Source::Partner.platform(), None);
    }

    #[test]
    fn test_item_key_qualification() {
        assert_eq!(Platform::Foodpanda.item_key(Some(" 9 ")), "foodpanda:9");
        assert_eq!(Platform::Foodpanda.item_key(Some("")), "foodpanda");
    }

    #[test]
    fn test_change_type_serde() {
        let json = serde_json::to_string(&ChangeType::AvailabilityToggled).unwrap();
        assert_eq!(json, "\"availability_toggled\"");
    }

    #[test]
    fn test_run_partial_coverage() {
        assert!(!run(RunStatus::Completed, "[]").is_partial());
        assert!(run(RunStatus::Completed, r#"["partner"]"#).is_partial());
        assert!(!run(RunStatus::Failed, r#"["partner"]"#).is_partial());

        let coverage = Coverage::from_run(Some(&run(RunStatus::Completed, r#"["partner"]"#)));
        assert!(!coverage.complete);
        assert_eq!(coverage.failed_sources, vec!["partner".to_string()]);

        assert!(!Coverage::from_run(None).complete);
    }

    #[test]
    fn test_item_kpis_ratio() {
        let kpis = ItemKpis::new(4, 3, Coverage::from_run(None));
        assert_eq!(kpis.unavailable, 1);
        assert!((kpis.availability_ratio - 0.75).abs() < f64::EPSILON);

        let empty = ItemKpis::new(0, 0, Coverage::from_run(None));
        assert_eq!(empty.availability_ratio, 0.0);
    }
}
