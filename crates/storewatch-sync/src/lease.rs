//! # Lease Locks
//!
//! Cross-process mutual exclusion for the sync run and the token refresh.
//!
//! ## Backends
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          LeaseStore                                     │
//! │                                                                         │
//! │   SqliteLeaseStore                   RedisLeaseStore                    │
//! │   ────────────────                   ───────────────                    │
//! │   leases table upsert                SET key holder NX PX ttl           │
//! │   WHERE expired OR same holder       release: compare-and-delete        │
//! │                                       script on the holder value        │
//! │                                                                         │
//! │   Both: a lease expires on its own, so a crashed holder blocks others   │
//! │   for at most one TTL. Release never frees another holder's lease.      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Heartbeat
//! A holder whose work can outlast the TTL starts a heartbeat on its guard.
//! It renews every third of the TTL. If a renewal finds the lease gone, the
//! heartbeat cancels the work it protects.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::SyncResult;
use storewatch_db::LeaseRepository;

/// Lease name guarding scheduled runs of a job.
pub fn run_lease_name(job_name: &str) -> String {
    format!("run:{job_name}")
}

/// Unique holder id for this process and purpose.
pub fn new_holder_id(purpose: &str) -> String {
    format!("{purpose}-{}-{}", std::process::id(), Uuid::new_v4())
}

// =============================================================================
// LeaseStore Trait
// =============================================================================

/// A TTL lease shared across processes.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Takes the lease if free, expired, or already ours.
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> SyncResult<bool>;

    /// Extends the lease only while `holder` still owns it unexpired.
    async fn renew(&self, name: &str, holder: &str, ttl: Duration) -> SyncResult<bool>;

    /// Releases the lease if `holder` still owns it.
    async fn release(&self, name: &str, holder: &str) -> SyncResult<bool>;
}

// =============================================================================
// SQLite Backend
// =============================================================================

/// Leases stored in the shared SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteLeaseStore {
    repo: LeaseRepository,
}

impl SqliteLeaseStore {
    pub fn new(repo: LeaseRepository) -> Self {
        SqliteLeaseStore { repo }
    }
}

#[async_trait]
impl LeaseStore for SqliteLeaseStore {
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> SyncResult<bool> {
        let ttl = chrono::Duration::milliseconds(ttl.as_millis() as i64);
        Ok(self.repo.try_acquire(name, holder, ttl, Utc::now()).await?)
    }

    async fn renew(&self, name: &str, holder: &str, ttl: Duration) -> SyncResult<bool> {
        let ttl = chrono::Duration::milliseconds(ttl.as_millis() as i64);
        Ok(self.repo.renew(name, holder, ttl, Utc::now()).await?)
    }

    async fn release(&self, name: &str, holder: &str) -> SyncResult<bool> {
        Ok(self.repo.release(name, holder).await?)
    }
}

// =============================================================================
// Redis Backend
// =============================================================================

const REDIS_LEASE_PREFIX: &str = "storewatch:lease:";

/// Deletes the key only while it still holds our holder id.
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Extends the key's expiry only while it still holds our holder id.
const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// Leases stored in Redis.
#[derive(Clone)]
pub struct RedisLeaseStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisLeaseStore {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        RedisLeaseStore { conn }
    }

    fn key(name: &str) -> String {
        format!("{REDIS_LEASE_PREFIX}{name}")
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> SyncResult<bool> {
        let key = Self::key(name);
        let mut conn = self.conn.clone();

        let current: Option<String> = redis::cmd("GET").arg(&key).query_async(&mut conn).await?;
        if current.as_deref() == Some(holder) {
            // Re-entry by the same holder extends the TTL
            let _: () = redis::cmd("PEXPIRE")
                .arg(&key)
                .arg(ttl.as_millis() as u64)
                .query_async(&mut conn)
                .await?;
            return Ok(true);
        }

        let reply: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(holder)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        let acquired = reply.is_some();
        debug!(lease = name, holder, acquired, "Redis lease acquire attempt");
        Ok(acquired)
    }

    async fn renew(&self, name: &str, holder: &str, ttl: Duration) -> SyncResult<bool> {
        let mut conn = self.conn.clone();
        let renewed: i64 = redis::Script::new(RENEW_SCRIPT)
            .key(Self::key(name))
            .arg(holder)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        Ok(renewed == 1)
    }

    async fn release(&self, name: &str, holder: &str) -> SyncResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(Self::key(name))
            .arg(holder)
            .invoke_async(&mut conn)
            .await?;

        Ok(removed == 1)
    }
}

// =============================================================================
// Guard Helper
// =============================================================================

/// An acquired lease that must be released explicitly.
///
/// Async release cannot run in `Drop`; callers release on every path and the
/// TTL covers a crash.
pub struct LeaseGuard {
    store: Arc<dyn LeaseStore>,
    name: String,
    holder: String,
    ttl: Duration,
}

impl LeaseGuard {
    /// Tries once to acquire; `None` when held elsewhere.
    pub async fn try_acquire(
        store: Arc<dyn LeaseStore>,
        name: impl Into<String>,
        holder: impl Into<String>,
        ttl: Duration,
    ) -> SyncResult<Option<Self>> {
        let name = name.into();
        let holder = holder.into();

        if store.try_acquire(&name, &holder, ttl).await? {
            Ok(Some(LeaseGuard {
                store,
                name,
                holder,
                ttl,
            }))
        } else {
            Ok(None)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Renews the lease every third of its TTL until stopped.
    ///
    /// When a renewal reports the lease lost, or fails, `on_lost` is
    /// cancelled and the heartbeat ends.
    pub fn start_heartbeat(&self, on_lost: CancellationToken) -> Heartbeat {
        let store = Arc::clone(&self.store);
        let name = self.name.clone();
        let holder = self.holder.clone();
        let ttl = self.ttl;
        let period = (ttl / 3).max(MIN_HEARTBEAT_PERIOD);
        let stop = CancellationToken::new();
        let stopped = stop.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stopped.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match store.renew(&name, &holder, ttl).await {
                    Ok(true) => debug!(lease = %name, "Lease renewed"),
                    Ok(false) => {
                        error!(lease = %name, "Lease lost before work finished");
                        on_lost.cancel();
                        break;
                    }
                    Err(e) => {
                        error!(lease = %name, error = %e, "Lease renewal failed");
                        on_lost.cancel();
                        break;
                    }
                }
            }
        });

        Heartbeat { stop, handle }
    }

    /// Releases the lease. Failures are logged; the TTL reclaims it.
    pub async fn release(self) {
        match self.store.release(&self.name, &self.holder).await {
            Ok(true) => debug!(lease = %self.name, "Lease released"),
            Ok(false) => warn!(lease = %self.name, "Lease already expired or taken over"),
            Err(e) => warn!(lease = %self.name, error = %e, "Lease release failed"),
        }
    }
}

const MIN_HEARTBEAT_PERIOD: Duration = Duration::from_millis(50);

/// Background renewal started by [`LeaseGuard::start_heartbeat`].
pub struct Heartbeat {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Stops renewing and waits for the task to exit.
    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Lease heartbeat task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storewatch_db::{Database, DbConfig};

    async fn store() -> Arc<dyn LeaseStore> {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        Arc::new(SqliteLeaseStore::new(db.leases()))
    }

    #[tokio::test]
    async fn test_guard_excludes_second_holder() {
        let store = store().await;
        let ttl = Duration::from_secs(30);

        let first = LeaseGuard::try_acquire(store.clone(), "run:store-sync", "a", ttl)
            .await
            .unwrap()
            .expect("first acquire");
        let second = LeaseGuard::try_acquire(store.clone(), "run:store-sync", "b", ttl)
            .await
            .unwrap();
        assert!(second.is_none());

        first.release().await;
        let third = LeaseGuard::try_acquire(store.clone(), "run:store-sync", "b", ttl)
            .await
            .unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn test_release_requires_holder() {
        let store = store().await;
        let ttl = Duration::from_secs(30);

        assert!(store.try_acquire("partner:token:refresh", "a", ttl).await.unwrap());
        assert!(!store.release("partner:token:refresh", "b").await.unwrap());
        assert!(store.release("partner:token:refresh", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_renew_requires_live_holder() {
        let store = store().await;
        let ttl = Duration::from_secs(30);

        assert!(store.try_acquire("run:store-sync", "a", ttl).await.unwrap());
        assert!(store.renew("run:store-sync", "a", ttl).await.unwrap());
        assert!(!store.renew("run:store-sync", "b", ttl).await.unwrap());
        assert!(!store.renew("run:other", "a", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_lease_past_ttl() {
        let store = store().await;
        let ttl = Duration::from_millis(300);

        let guard = LeaseGuard::try_acquire(store.clone(), "run:store-sync", "a", ttl)
            .await
            .unwrap()
            .expect("acquire");
        let lost = CancellationToken::new();
        let heartbeat = guard.start_heartbeat(lost.clone());

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert!(!store.try_acquire("run:store-sync", "b", ttl).await.unwrap());
        assert!(!lost.is_cancelled());

        heartbeat.stop().await;
        guard.release().await;
        assert!(store.try_acquire("run:store-sync", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_heartbeat_cancels_when_lease_lost() {
        let store = store().await;
        let ttl = Duration::from_millis(300);

        let guard = LeaseGuard::try_acquire(store.clone(), "run:store-sync", "a", ttl)
            .await
            .unwrap()
            .expect("acquire");
        assert!(store.release("run:store-sync", "a").await.unwrap());
        assert!(store.try_acquire("run:store-sync", "b", ttl * 10).await.unwrap());

        let lost = CancellationToken::new();
        let heartbeat = guard.start_heartbeat(lost.clone());
        tokio::time::timeout(Duration::from_secs(2), lost.cancelled())
            .await
            .expect("heartbeat cancels on lost lease");
        heartbeat.stop().await;
    }

    #[test]
    fn test_names() {
        assert_eq!(run_lease_name("store-sync"), "run:store-sync");
        let a = new_holder_id("run");
        let b = new_holder_id("run");
        assert!(a.starts_with("run-"));
        assert_ne!(a, b);
    }
}
