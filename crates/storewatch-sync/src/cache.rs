//! # Tiered Cache
//!
//! TTL-tiered cache for dashboard reads with per-key single-flight.
//!
//! ## Read Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  get_or_compute(key, tier, compute)                                     │
//! │                                                                         │
//! │  1. store.get(key) ── hit ──────────────────────────────► return value  │
//! │        │ miss                                                           │
//! │        ▼                                                                │
//! │  2. lock per-key in-flight mutex (one computation per process)          │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  3. store.get(key) again ── hit (filled by a peer) ─────► return value  │
//! │        │ miss                                                           │
//! │        ▼                                                                │
//! │  4. e = store.epoch()                                                   │
//! │     compute() ──► store.set_if_epoch(key, .., e) ───────► return value  │
//! │                   (skipped when an invalidation ran meanwhile)          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Tiers
//! | Tier      | TTL    | Used for                               |
//! |-----------|--------|----------------------------------------|
//! | fast      | 60 s   | platform summary, offline shops        |
//! | moderate  | 300 s  | item KPIs, active alerts               |
//! | slow      | 3600 s | recent changes                         |
//! | very_slow | 86400 s| shop id → name reference map           |
//!
//! The backing [`CacheStore`] is shared by every process that points at the
//! same database file (SQLite) or server (Redis), so an invalidation by the
//! sync job is seen by all dashboard readers. Every delete bumps the store's
//! invalidation epoch; a value computed across an epoch change is returned to
//! its caller but never stored.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::CacheSettings;
use crate::error::SyncResult;
use storewatch_core::{CacheTier, DashboardKey};
use storewatch_db::CacheRepository;

// =============================================================================
// CacheStore Trait
// =============================================================================

/// Raw string storage with expiry and tier grouping.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Value if present and unexpired.
    async fn get(&self, key: &str) -> SyncResult<Option<String>>;

    /// Inserts or replaces a value. `tier` is `None` for non-dashboard keys.
    async fn set(
        &self,
        key: &str,
        tier: Option<CacheTier>,
        value: &str,
        ttl: Duration,
    ) -> SyncResult<()>;

    /// Current invalidation epoch. Every delete below increments it.
    async fn epoch(&self) -> SyncResult<i64>;

    /// Like [`set`](Self::set), but only while the epoch still equals `epoch`.
    /// Returns whether the value was written.
    async fn set_if_epoch(
        &self,
        key: &str,
        tier: Option<CacheTier>,
        value: &str,
        ttl: Duration,
        epoch: i64,
    ) -> SyncResult<bool>;

    async fn delete(&self, key: &str) -> SyncResult<bool>;

    /// Deletes several keys atomically.
    async fn delete_many(&self, keys: &[&str]) -> SyncResult<u64>;

    /// Deletes every key of a tier atomically.
    async fn delete_tier(&self, tier: CacheTier) -> SyncResult<u64>;

    /// Physically drops expired entries. Expired entries are already
    /// invisible to `get`.
    async fn purge_expired(&self) -> SyncResult<u64>;
}

// =============================================================================
// SQLite Backend
// =============================================================================

/// Cache rows in the shared SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteCacheStore {
    repo: CacheRepository,
}

impl SqliteCacheStore {
    pub fn new(repo: CacheRepository) -> Self {
        SqliteCacheStore { repo }
    }

    fn expiry(ttl: Duration) -> (DateTime<Utc>, DateTime<Utc>) {
        let now = Utc::now();
        (now, now + chrono::Duration::milliseconds(ttl.as_millis() as i64))
    }
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    async fn get(&self, key: &str) -> SyncResult<Option<String>> {
        Ok(self.repo.get(key, Utc::now()).await?)
    }

    async fn set(
        &self,
        key: &str,
        tier: Option<CacheTier>,
        value: &str,
        ttl: Duration,
    ) -> SyncResult<()> {
        let (now, expires_at) = Self::expiry(ttl);
        Ok(self.repo.set(key, tier, value, now, expires_at).await?)
    }

    async fn epoch(&self) -> SyncResult<i64> {
        Ok(self.repo.epoch().await?)
    }

    async fn set_if_epoch(
        &self,
        key: &str,
        tier: Option<CacheTier>,
        value: &str,
        ttl: Duration,
        epoch: i64,
    ) -> SyncResult<bool> {
        let (now, expires_at) = Self::expiry(ttl);
        Ok(self
            .repo
            .set_if_epoch(key, tier, value, now, expires_at, epoch)
            .await?)
    }

    async fn delete(&self, key: &str) -> SyncResult<bool> {
        Ok(self.repo.delete(key).await?)
    }

    async fn delete_many(&self, keys: &[&str]) -> SyncResult<u64> {
        Ok(self.repo.delete_many(keys).await?)
    }

    async fn delete_tier(&self, tier: CacheTier) -> SyncResult<u64> {
        Ok(self.repo.delete_tier(tier).await?)
    }

    async fn purge_expired(&self) -> SyncResult<u64> {
        Ok(self.repo.purge_expired(Utc::now()).await?)
    }
}

// =============================================================================
// Redis Backend
// =============================================================================

const REDIS_CACHE_PREFIX: &str = "storewatch:cache:";
const REDIS_TIER_PREFIX: &str = "storewatch:tier:";
const REDIS_EPOCH_KEY: &str = "storewatch:cache-epoch";

/// Deletes every member of a tier set, then the set itself, and bumps the
/// epoch (KEYS[2]).
const DELETE_TIER_SCRIPT: &str = r#"
local members = redis.call('SMEMBERS', KEYS[1])
local removed = 0
for _, key in ipairs(members) do
    removed = removed + redis.call('DEL', key)
end
redis.call('DEL', KEYS[1])
redis.call('INCR', KEYS[2])
return removed
"#;

/// Writes KEYS[2] (and its tier set KEYS[3], when given) only while the epoch
/// at KEYS[1] equals ARGV[1].
const SET_IF_EPOCH_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current ~= tonumber(ARGV[1]) then
    return 0
end
redis.call('SET', KEYS[2], ARGV[2], 'PX', ARGV[3])
if KEYS[3] then
    redis.call('SADD', KEYS[3], KEYS[2])
end
return 1
"#;

/// Cache entries in Redis with one membership set per tier.
#[derive(Clone)]
pub struct RedisCacheStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisCacheStore {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        RedisCacheStore { conn }
    }

    /// Connects a managed connection to `url`.
    pub async fn connect(url: &str) -> SyncResult<redis::aio::ConnectionManager> {
        let client = redis::Client::open(url)?;
        Ok(redis::aio::ConnectionManager::new(client).await?)
    }

    fn key(key: &str) -> String {
        format!("{REDIS_CACHE_PREFIX}{key}")
    }

    fn tier_set(tier: CacheTier) -> String {
        format!("{REDIS_TIER_PREFIX}{}", tier.as_str())
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> SyncResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(Self::key(key))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set(
        &self,
        key: &str,
        tier: Option<CacheTier>,
        value: &str,
        ttl: Duration,
    ) -> SyncResult<()> {
        let mut conn = self.conn.clone();
        let full_key = Self::key(key);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(&full_key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .ignore();
        if let Some(tier) = tier {
            pipe.cmd("SADD").arg(Self::tier_set(tier)).arg(&full_key).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn epoch(&self) -> SyncResult<i64> {
        let mut conn = self.conn.clone();
        let epoch: Option<i64> = redis::cmd("GET")
            .arg(REDIS_EPOCH_KEY)
            .query_async(&mut conn)
            .await?;
        Ok(epoch.unwrap_or(0))
    }

    async fn set_if_epoch(
        &self,
        key: &str,
        tier: Option<CacheTier>,
        value: &str,
        ttl: Duration,
        epoch: i64,
    ) -> SyncResult<bool> {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(SET_IF_EPOCH_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation.key(REDIS_EPOCH_KEY).key(Self::key(key));
        if let Some(tier) = tier {
            invocation.key(Self::tier_set(tier));
        }
        let written: i64 = invocation
            .arg(epoch)
            .arg(value)
            .arg(ttl.as_millis().max(1) as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(written == 1)
    }

    async fn delete(&self, key: &str) -> SyncResult<bool> {
        let mut conn = self.conn.clone();
        let (removed, _epoch): (i64, i64) = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(Self::key(key))
            .cmd("INCR")
            .arg(REDIS_EPOCH_KEY)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn delete_many(&self, keys: &[&str]) -> SyncResult<u64> {
        let mut conn = self.conn.clone();
        if keys.is_empty() {
            let _: i64 = redis::cmd("INCR").arg(REDIS_EPOCH_KEY).query_async(&mut conn).await?;
            return Ok(0);
        }
        let full: Vec<String> = keys.iter().map(|k| Self::key(k)).collect();
        let (removed, _epoch): (i64, i64) = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(full)
            .cmd("INCR")
            .arg(REDIS_EPOCH_KEY)
            .query_async(&mut conn)
            .await?;
        Ok(removed.max(0) as u64)
    }

    async fn delete_tier(&self, tier: CacheTier) -> SyncResult<u64> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::Script::new(DELETE_TIER_SCRIPT)
            .key(Self::tier_set(tier))
            .key(REDIS_EPOCH_KEY)
            .invoke_async(&mut conn)
            .await?;
        debug!(tier = %tier, removed, "Redis cache tier cleared");
        Ok(removed.max(0) as u64)
    }

    async fn purge_expired(&self) -> SyncResult<u64> {
        // Redis expires keys itself.
        Ok(0)
    }
}

// =============================================================================
// TieredCache
// =============================================================================

/// Cache front with tier TTLs and per-key single-flight.
pub struct TieredCache {
    store: Arc<dyn CacheStore>,
    settings: CacheSettings,
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TieredCache {
    pub fn new(store: Arc<dyn CacheStore>, settings: CacheSettings) -> Self {
        TieredCache {
            store,
            settings,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// The backing store (shared with the token store).
    pub fn store(&self) -> Arc<dyn CacheStore> {
        self.store.clone()
    }

    /// TTL applied to a tier.
    pub fn ttl(&self, tier: CacheTier) -> Duration {
        self.settings.ttl(tier)
    }

    /// Returns the cached value, or computes, stores, and returns it.
    ///
    /// Concurrent callers for the same key in this process wait for a single
    /// computation. A compute error is returned and nothing is cached.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        key: &str,
        tier: CacheTier,
        compute: F,
    ) -> SyncResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        if let Some(value) = self.read::<T>(key).await? {
            return Ok(value);
        }

        let slot = {
            let mut in_flight = self.in_flight.lock().await;
            in_flight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let result = {
            let _computing = slot.lock().await;
            match self.read::<T>(key).await {
                Ok(Some(value)) => Ok(value),
                Ok(None) => self.compute_and_store(key, tier, compute).await,
                Err(e) => Err(e),
            }
        };

        let mut in_flight = self.in_flight.lock().await;
        // Map entry plus our clone: nobody else is waiting
        if Arc::strong_count(&slot) <= 2 {
            in_flight.remove(key);
        }

        result
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> SyncResult<Option<T>> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => {
                debug!(key, "Cache hit");
                Ok(Some(value))
            }
            Err(e) => {
                warn!(key, error = %e, "Discarding undecodable cache entry");
                Ok(None)
            }
        }
    }

    async fn compute_and_store<T, F, Fut>(
        &self,
        key: &str,
        tier: CacheTier,
        compute: F,
    ) -> SyncResult<T>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let started = std::time::Instant::now();
        let epoch = self.store.epoch().await?;
        let value = compute().await?;
        let raw = serde_json::to_string(&value)?;
        let stored = self
            .store
            .set_if_epoch(key, Some(tier), &raw, self.settings.ttl(tier), epoch)
            .await?;
        if !stored {
            debug!(key, "Cache invalidated during compute, result not stored");
        }
        debug!(
            key,
            tier = %tier,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Cache miss computed"
        );
        Ok(value)
    }

    /// Removes one key. The next read recomputes.
    pub async fn invalidate(&self, key: &str) -> SyncResult<bool> {
        self.store.delete(key).await
    }

    /// Removes every key of a tier in one atomic operation.
    pub async fn invalidate_tier(&self, tier: CacheTier) -> SyncResult<u64> {
        let removed = self.store.delete_tier(tier).await?;
        info!(tier = %tier, removed, "Cache tier invalidated");
        Ok(removed)
    }

    /// Removes every dashboard key after a sync.
    ///
    /// The tiers holding dashboard keys are cleared whole so parameterized
    /// keys (recent changes with a limit) go along with the catalogue keys.
    /// The very-slow reference tier is left alone.
    pub async fn invalidate_dashboard(&self) -> SyncResult<u64> {
        let keys: Vec<&str> = DashboardKey::invalidated_after_sync()
            .map(|k| k.key())
            .collect();
        let mut removed = self.store.delete_many(&keys).await?;
        for tier in DashboardKey::tiers_invalidated_after_sync() {
            removed += self.store.delete_tier(tier).await?;
        }
        info!(removed, "Dashboard cache invalidated");
        Ok(removed)
    }

    /// Drops expired entries from the backing store.
    pub async fn purge_expired(&self) -> SyncResult<u64> {
        let purged = self.store.purge_expired().await?;
        if purged > 0 {
            debug!(purged, "Expired cache entries purged");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use storewatch_db::{Database, DbConfig};

    async fn cache() -> Arc<TieredCache> {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let store = Arc::new(SqliteCacheStore::new(db.cache()));
        Arc::new(TieredCache::new(store, CacheSettings::default()))
    }

    #[tokio::test]
    async fn test_hit_skips_compute() {
        let cache = cache().await;
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        for _ in 0..3 {
            let value: i64 = cache
                .get_or_compute("dashboard:item_kpis", CacheTier::Moderate, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                })
                .await
                .unwrap();
            assert_eq!(value, 42);
        }

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_compute_once() {
        let cache = cache().await;
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                let compute = move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(vec!["grab".to_string()])
                };
                cache
                    .get_or_compute("dashboard:platform_summary", CacheTier::Fast, compute)
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), vec!["grab".to_string()]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_recompute() {
        let cache = cache().await;
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let compute = move || async move { Ok(calls.fetch_add(1, Ordering::SeqCst) as i64) };

        let first: i64 = cache
            .get_or_compute("dashboard:offline_shops", CacheTier::Fast, compute)
            .await
            .unwrap();
        assert!(cache.invalidate("dashboard:offline_shops").await.unwrap());
        let second: i64 = cache
            .get_or_compute("dashboard:offline_shops", CacheTier::Fast, compute)
            .await
            .unwrap();

        assert_eq!((first, second), (0, 1));
    }

    #[tokio::test]
    async fn test_invalidate_dashboard_keeps_reference_tier() {
        let cache = cache().await;
        let store = cache.store();
        let ttl = Duration::from_secs(60);

        store.set("dashboard:platform_summary", Some(CacheTier::Fast), "1", ttl).await.unwrap();
        store.set("dashboard:item_kpis", Some(CacheTier::Moderate), "2", ttl).await.unwrap();
        store.set("dashboard:recent_changes:20", Some(CacheTier::Slow), "3", ttl).await.unwrap();
        store.set("reference:shop_names", Some(CacheTier::VerySlow), "4", ttl).await.unwrap();

        assert_eq!(cache.invalidate_dashboard().await.unwrap(), 3);
        assert_eq!(store.get("dashboard:platform_summary").await.unwrap(), None);
        assert_eq!(store.get("dashboard:item_kpis").await.unwrap(), None);
        assert_eq!(store.get("dashboard:recent_changes:20").await.unwrap(), None);
        assert!(store.get("reference:shop_names").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalidation_during_compute_is_not_overwritten() {
        let cache = cache().await;
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let (resume_tx, resume_rx) = tokio::sync::oneshot::channel::<()>();

        let slow = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute("dashboard:item_kpis", CacheTier::Moderate, move || async move {
                        let _ = started_tx.send(());
                        let _ = resume_rx.await;
                        Ok("before sync".to_string())
                    })
                    .await
                    .unwrap()
            })
        };

        started_rx.await.unwrap();
        cache.invalidate_dashboard().await.unwrap();
        resume_tx.send(()).unwrap();
        assert_eq!(slow.await.unwrap(), "before sync");

        assert_eq!(cache.store().get("dashboard:item_kpis").await.unwrap(), None);
        let fresh: String = cache
            .get_or_compute("dashboard:item_kpis", CacheTier::Moderate, || async {
                Ok("after sync".to_string())
            })
            .await
            .unwrap();
        assert_eq!(fresh, "after sync");
    }

    #[tokio::test]
    async fn test_purge_expired_drops_dead_entries() {
        let cache = cache().await;
        let store = cache.store();

        let fast = Some(CacheTier::Fast);
        let very_slow = Some(CacheTier::VerySlow);
        store.set("dashboard:offline_shops", fast, "1", Duration::ZERO).await.unwrap();
        store.set("reference:shop_names", very_slow, "2", Duration::from_secs(60)).await.unwrap();

        assert_eq!(cache.purge_expired().await.unwrap(), 1);
        assert_eq!(cache.purge_expired().await.unwrap(), 0);
        assert!(store.get("reference:shop_names").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_compute_error_is_not_cached() {
        let cache = cache().await;

        let err = cache
            .get_or_compute::<i64, _, _>("dashboard:active_alerts", CacheTier::Moderate, || async {
                Err(crate::error::SyncError::Internal("boom".into()))
            })
            .await;
        assert!(err.is_err());
        assert_eq!(cache.store().get("dashboard:active_alerts").await.unwrap(), None);
    }
}
