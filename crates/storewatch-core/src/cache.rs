//! # Cache Tiers & Key Catalogue
//!
//! Every cached dashboard value is named here, together with the TTL tier it
//! lives in. Storage and single-flight live in `storewatch-sync`.
//!
//! ```text
//! ┌────────────┬──────────┬──────────────────────────────────────────┐
//! │ Tier       │ TTL      │ Keys                                     │
//! ├────────────┼──────────┼──────────────────────────────────────────┤
//! │ fast       │ 60 s     │ platform_summary, offline_shops          │
//! │ moderate   │ 300 s    │ item_kpis, active_alerts                 │
//! │ slow       │ 3600 s   │ recent_changes                           │
//! │ very_slow  │ 86400 s  │ reference:shop_names                     │
//! └────────────┴──────────┴──────────────────────────────────────────┘
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// TTL class of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    Fast,
    Moderate,
    Slow,
    VerySlow,
}

impl CacheTier {
    pub const ALL: [CacheTier; 4] = [
        CacheTier::Fast,
        CacheTier::Moderate,
        CacheTier::Slow,
        CacheTier::VerySlow,
    ];

    /// Default time-to-live for entries in this tier.
    pub const fn default_ttl(&self) -> Duration {
        match self {
            CacheTier::Fast => Duration::from_secs(60),
            CacheTier::Moderate => Duration::from_secs(300),
            CacheTier::Slow => Duration::from_secs(3600),
            CacheTier::VerySlow => Duration::from_secs(86_400),
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            CacheTier::Fast => "fast",
            CacheTier::Moderate => "moderate",
            CacheTier::Slow => "slow",
            CacheTier::VerySlow => "very_slow",
        }
    }
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheTier {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fast" => Ok(CacheTier::Fast),
            "moderate" => Ok(CacheTier::Moderate),
            "slow" => Ok(CacheTier::Slow),
            "very_slow" | "veryslow" => Ok(CacheTier::VerySlow),
            other => Err(CoreError::UnknownTier(other.to_string())),
        }
    }
}

/// Named dashboard cache entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DashboardKey {
    PlatformSummary,
    OfflineShops,
    ItemKpis,
    ActiveAlerts,
    RecentChanges,
    /// Shop id → display name map.
    ShopNames,
}

impl DashboardKey {
    pub const ALL: [DashboardKey; 6] = [
        DashboardKey::PlatformSummary,
        DashboardKey::OfflineShops,
        DashboardKey::ItemKpis,
        DashboardKey::ActiveAlerts,
        DashboardKey::RecentChanges,
        DashboardKey::ShopNames,
    ];

    pub const fn key(&self) -> &'static str {
        match self {
            DashboardKey::PlatformSummary => "dashboard:platform_summary",
            DashboardKey::OfflineShops => "dashboard:offline_shops",
            DashboardKey::ItemKpis => "dashboard:item_kpis",
            DashboardKey::ActiveAlerts => "dashboard:active_alerts",
            DashboardKey::RecentChanges => "dashboard:recent_changes",
            DashboardKey::ShopNames => "reference:shop_names",
        }
    }

    pub const fn tier(&self) -> CacheTier {
        match self {
            DashboardKey::PlatformSummary | DashboardKey::OfflineShops => CacheTier::Fast,
            DashboardKey::ItemKpis | DashboardKey::ActiveAlerts => CacheTier::Moderate,
            DashboardKey::RecentChanges => CacheTier::Slow,
            DashboardKey::ShopNames => CacheTier::VerySlow,
        }
    }

    /// Keys dropped after every successful reconciliation: every dashboard
    /// key. The shop name map is refreshed separately.
    pub fn invalidated_after_sync() -> impl Iterator<Item = DashboardKey> {
        Self::ALL
            .into_iter()
            .filter(|k| !matches!(k, DashboardKey::ShopNames))
    }

    /// Tiers holding the keys of [`invalidated_after_sync`](Self::invalidated_after_sync),
    /// without duplicates.
    pub fn tiers_invalidated_after_sync() -> Vec<CacheTier> {
        let mut tiers: Vec<CacheTier> = Vec::new();
        for tier in Self::invalidated_after_sync().map(|k| k.tier()) {
            if !tiers.contains(&tier) {
                tiers.push(tier);
            }
        }
        tiers
    }
}

impl fmt::Display for DashboardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ttls() {
        assert_eq!(CacheTier::Fast.default_ttl(), Duration::from_secs(60));
        assert_eq!(CacheTier::Moderate.default_ttl(), Duration::from_secs(300));
        assert_eq!(CacheTier::Slow.default_ttl(), Duration::from_secs(3600));
        assert_eq!(CacheTier::VerySlow.default_ttl(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_tier_parse() {
        assert_eq!("very-slow".parse::<CacheTier>().unwrap(), CacheTier::VerySlow);
        assert_eq!("FAST".parse::<CacheTier>().unwrap(), CacheTier::Fast);
        assert!("medium".parse::<CacheTier>().is_err());
    }

    #[test]
    fn test_sync_invalidation_set() {
        let keys: Vec<_> = DashboardKey::invalidated_after_sync().collect();
        assert_eq!(
            keys,
            vec![
                DashboardKey::PlatformSummary,
                DashboardKey::OfflineShops,
                DashboardKey::ItemKpis,
                DashboardKey::ActiveAlerts,
                DashboardKey::RecentChanges,
            ]
        );
        assert_eq!(
            DashboardKey::tiers_invalidated_after_sync(),
            vec![CacheTier::Fast, CacheTier::Moderate, CacheTier::Slow]
        );
        assert_eq!(DashboardKey::ShopNames.tier(), CacheTier::VerySlow);
    }
}
