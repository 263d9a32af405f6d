//! # Dashboard Queries
//!
//! Read-side aggregations, each served through [`TieredCache`] under its
//! catalogue key.
//!
//! | Query              | Key                                  | Tier      |
//! |--------------------|--------------------------------------|-----------|
//! | `platform_summary` | `dashboard:platform_summary`         | fast      |
//! | `offline_shops`    | `dashboard:offline_shops`            | fast      |
//! | `item_kpis`        | `dashboard:item_kpis`                | moderate  |
//! | `active_alerts`    | `dashboard:active_alerts`            | moderate  |
//! | `recent_changes`   | `dashboard:recent_changes:<limit>`   | slow      |
//! | `shop_names`       | `reference:shop_names`               | very slow |
//!
//! Every `dashboard:` entry is dropped after each successful sync. The shop
//! name map is refreshed on its own key.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cache::TieredCache;
use crate::config::StorewatchConfig;
use crate::error::SyncResult;
use storewatch_core::alerts::{evaluate, Alert, AlertInputs, AlertRules};
use storewatch_core::{
    CacheTier, Coverage, DashboardKey, ItemChange, ItemKpis, OfflineShop, PlatformSummary,
};
use storewatch_db::Database;

/// Everything `storewatch dashboard` prints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardOverview {
    pub platforms: Vec<PlatformSummary>,
    pub offline_shops: Vec<OfflineShop>,
    pub item_kpis: ItemKpis,
    pub alerts: Vec<Alert>,
    pub recent_changes: Vec<ItemChange>,
}

/// Cached dashboard reads.
#[derive(Clone)]
pub struct Dashboard {
    db: Database,
    cache: Arc<TieredCache>,
    rules: AlertRules,
    job_name: String,
}

impl Dashboard {
    pub fn new(
        db: Database,
        cache: Arc<TieredCache>,
        rules: AlertRules,
        job_name: impl Into<String>,
    ) -> Self {
        Dashboard {
            db,
            cache,
            rules,
            job_name: job_name.into(),
        }
    }

    /// Builds alert rules from `[alerts]` and `[sync]`.
    pub fn from_config(db: Database, cache: Arc<TieredCache>, config: &StorewatchConfig) -> Self {
        let rules = AlertRules {
            availability_threshold: config.alerts.availability_threshold,
            stale_after: chrono::Duration::seconds(config.sync.stale_after_secs as i64),
        };
        Dashboard::new(db, cache, rules, config.sync.job_name.clone())
    }

    pub async fn platform_summary(&self) -> SyncResult<Vec<PlatformSummary>> {
        let key = DashboardKey::PlatformSummary;
        self.cache
            .get_or_compute(key.key(), key.tier(), || async {
                Ok(self.db.platform_status().summary().await?)
            })
            .await
    }

    pub async fn offline_shops(&self) -> SyncResult<Vec<OfflineShop>> {
        let key = DashboardKey::OfflineShops;
        self.cache
            .get_or_compute(key.key(), key.tier(), || async {
                Ok(self.db.platform_status().offline().await?)
            })
            .await
    }

    /// Item totals with the coverage of the latest completed run.
    pub async fn item_kpis(&self) -> SyncResult<ItemKpis> {
        let key = DashboardKey::ItemKpis;
        self.cache
            .get_or_compute(key.key(), key.tier(), || async {
                let (total, available) = self.db.snapshots().item_counts().await?;
                let latest = self.db.runs().latest_completed(&self.job_name).await?;
                Ok(ItemKpis::new(total, available, Coverage::from_run(latest.as_ref())))
            })
            .await
    }

    pub async fn active_alerts(&self) -> SyncResult<Vec<Alert>> {
        let key = DashboardKey::ActiveAlerts;
        self.cache
            .get_or_compute(key.key(), key.tier(), || async {
                let offline = self.offline_shops().await?;
                let availability = self.db.snapshots().availability_by_shop().await?;
                let last_finished = self.db.runs().latest_finished(&self.job_name).await?;
                let last_completed = self.db.runs().latest_completed(&self.job_name).await?;

                Ok(evaluate(
                    &self.rules,
                    AlertInputs {
                        offline: &offline,
                        availability: &availability,
                        last_finished: last_finished.as_ref(),
                        last_completed: last_completed.as_ref(),
                        now: Utc::now(),
                    },
                ))
            })
            .await
    }

    pub async fn recent_changes(&self, limit: u32) -> SyncResult<Vec<ItemChange>> {
        let key = format!("{}:{}", DashboardKey::RecentChanges.key(), limit);
        self.cache
            .get_or_compute(&key, CacheTier::Slow, || async {
                Ok(self.db.snapshots().recent_changes(limit).await?)
            })
            .await
    }

    /// Shop id → display name.
    pub async fn shop_names(&self) -> SyncResult<BTreeMap<String, String>> {
        let key = DashboardKey::ShopNames;
        self.cache
            .get_or_compute(key.key(), key.tier(), || async {
                Ok(self.db.shops().names().await?.into_iter().collect())
            })
            .await
    }

    pub async fn overview(&self, change_limit: u32) -> SyncResult<DashboardOverview> {
        Ok(DashboardOverview {
            platforms: self.platform_summary().await?,
            offline_shops: self.offline_shops().await?,
            item_kpis: self.item_kpis().await?,
            alerts: self.active_alerts().await?,
            recent_changes: self.recent_changes(change_limit).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SqliteCacheStore;
    use crate::config::CacheSettings;
    use storewatch_core::alerts::AlertKind;
    use storewatch_core::{
        ErrorClass, ItemObservation, Platform, PlatformStatus, RemovalScope, Shop, Source,
    };
    use storewatch_db::DbConfig;

    async fn dashboard() -> (Database, Arc<TieredCache>, Dashboard) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let cache = Arc::new(TieredCache::new(
            Arc::new(SqliteCacheStore::new(db.cache())),
            CacheSettings::default(),
        ));
        let config = StorewatchConfig::default();
        let dashboard = Dashboard::from_config(db.clone(), cache.clone(), &config);
        (db, cache, dashboard)
    }

    fn item(shop: &str, item: &str, available: bool) -> ItemObservation {
        ItemObservation {
            shop_id: shop.into(),
            item_id: item.into(),
            source: Source::Partner,
            name: Some(item.into()),
            code: None,
            category: None,
            price_cents: Some(100),
            available,
            payload: serde_json::Value::Null,
        }
    }

    async fn completed_run(db: &Database, items: Vec<ItemObservation>, failed: &[String]) -> i64 {
        let run_id = db.runs().start("store-sync", Utc::now()).await.unwrap();
        db.snapshots()
            .apply_run(run_id, &RemovalScope::of([Source::Partner]), items, Utc::now())
            .await
            .unwrap();
        db.runs()
            .complete(run_id, &["partner".to_string()], failed, Utc::now())
            .await
            .unwrap();
        run_id
    }

    #[tokio::test]
    async fn test_item_kpis_cached_until_invalidated() {
        let (db, cache, dashboard) = dashboard().await;
        completed_run(&db, vec![item("S1", "A", true), item("S1", "B", false)], &[]).await;

        let kpis = dashboard.item_kpis().await.unwrap();
        assert_eq!(kpis.total_items, 2);
        assert_eq!(kpis.available, 1);
        assert!(kpis.coverage.complete);

        completed_run(&db, vec![item("S1", "A", true), item("S1", "B", true)], &[]).await;
        assert_eq!(dashboard.item_kpis().await.unwrap().available, 1);

        cache.invalidate_dashboard().await.unwrap();
        assert_eq!(dashboard.item_kpis().await.unwrap().available, 2);
    }

    #[tokio::test]
    async fn test_partial_run_never_reported_complete() {
        let (db, _cache, dashboard) = dashboard().await;
        completed_run(&db, vec![item("S1", "A", true)], &["partner:S2".to_string()]).await;

        let kpis = dashboard.item_kpis().await.unwrap();
        assert!(!kpis.coverage.complete);
        assert_eq!(kpis.coverage.failed_sources, vec!["partner:S2".to_string()]);

        let alerts = dashboard.active_alerts().await.unwrap();
        assert!(alerts.iter().any(|a| a.kind == AlertKind::PartialCoverage));
    }

    #[tokio::test]
    async fn test_alerts_for_offline_low_availability_and_failure() {
        let (db, _cache, dashboard) = dashboard().await;
        db.shops()
            .upsert_many(&[Shop {
                shop_id: "S1".into(),
                name: "Harbour".into(),
                brand: None,
                has_active_items: true,
                last_synced_at: None,
            }])
            .await
            .unwrap();
        completed_run(
            &db,
            vec![item("S1", "A", false), item("S1", "B", false), item("S1", "C", true)],
            &[],
        )
        .await;
        db.platform_status()
            .upsert_many(&[PlatformStatus {
                shop_id: "S1".into(),
                platform: Platform::Grab,
                online: false,
                items_synced: 0,
                items_total: 3,
                last_checked_at: Utc::now(),
                last_error: None,
            }])
            .await
            .unwrap();
        let failed = db.runs().start("store-sync", Utc::now()).await.unwrap();
        db.runs()
            .fail(failed, ErrorClass::Timeout, "collector timed out", &[], Utc::now())
            .await
            .unwrap();

        let alerts = dashboard.active_alerts().await.unwrap();
        let kinds: Vec<AlertKind> = alerts.iter().map(|a| a.kind).collect();
        assert!(kinds.contains(&AlertKind::ShopOffline));
        assert!(kinds.contains(&AlertKind::LowAvailability));
        assert!(kinds.contains(&AlertKind::LastRunFailed));
        assert!(!kinds.contains(&AlertKind::StaleData));
        assert_eq!(alerts[0].kind, AlertKind::LastRunFailed);

        let offline = dashboard.offline_shops().await.unwrap();
        assert_eq!(offline[0].name.as_deref(), Some("Harbour"));
        let summary = dashboard.platform_summary().await.unwrap();
        assert_eq!((summary[0].offline, summary[0].total), (1, 1));
    }

    #[tokio::test]
    async fn test_empty_database_is_stale() {
        let (_db, _cache, dashboard) = dashboard().await;

        let overview = dashboard.overview(10).await.unwrap();
        assert_eq!(overview.item_kpis.total_items, 0);
        assert!(!overview.item_kpis.coverage.complete);
        assert!(overview.alerts.iter().any(|a| a.kind == AlertKind::StaleData));
        assert!(overview.recent_changes.is_empty());
    }

    #[tokio::test]
    async fn test_recent_changes_refresh_after_sync_invalidation() {
        let (db, cache, dashboard) = dashboard().await;
        assert!(dashboard.recent_changes(20).await.unwrap().is_empty());

        completed_run(&db, vec![item("S1", "A", true)], &[]).await;
        assert!(dashboard.recent_changes(20).await.unwrap().is_empty());

        cache.invalidate_dashboard().await.unwrap();
        let changes = dashboard.recent_changes(20).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].item_id, "A");
    }

    #[tokio::test]
    async fn test_shop_names_survive_dashboard_invalidation() {
        let (db, cache, dashboard) = dashboard().await;
        let shop = |id: &str, name: &str| Shop {
            shop_id: id.into(),
            name: name.into(),
            brand: None,
            has_active_items: false,
            last_synced_at: None,
        };
        db.shops().upsert_many(&[shop("S1", "Harbour")]).await.unwrap();
        assert_eq!(dashboard.shop_names().await.unwrap()["S1"], "Harbour");

        db.shops().upsert_many(&[shop("S1", "Harbourfront")]).await.unwrap();
        cache.invalidate_dashboard().await.unwrap();
        assert_eq!(dashboard.shop_names().await.unwrap()["S1"], "Harbour");

        cache.invalidate(DashboardKey::ShopNames.key()).await.unwrap();
        assert_eq!(dashboard.shop_names().await.unwrap()["S1"], "Harbourfront");
    }
}
