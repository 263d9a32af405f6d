//! # Lease Repository
//!
//! Cross-process mutual exclusion with a TTL.
//!
//! ## Lease Protocol
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  try_acquire(name, holder, ttl)                                         │
//! │                                                                         │
//! │  INSERT INTO leases ... ON CONFLICT(name) DO UPDATE                     │
//! │      ... WHERE leases.expires_at <= now OR leases.holder = holder       │
//! │                                                                         │
//! │  rows_affected == 1  → acquired (new row, expired row, or re-entry)    │
//! │  rows_affected == 0  → held by someone else                            │
//! │                                                                         │
//! │  release(name, holder)                                                  │
//! │  DELETE ... WHERE name = ? AND holder = ?  ← never frees someone       │
//! │                                             else's lease               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A crashed holder blocks others only until its TTL elapses.

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use super::millis;
use crate::error::DbResult;

/// Repository for `leases`.
#[derive(Debug, Clone)]
pub struct LeaseRepository {
    pool: SqlitePool,
}

impl LeaseRepository {
    /// Creates a new LeaseRepository.
    pub fn new(pool: SqlitePool) -> Self {
        LeaseRepository { pool }
    }

    /// Attempts to take the lease for `ttl`. Returns whether it was acquired.
    pub async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO leases (name, holder, acquired_at, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(name) DO UPDATE SET
                holder = excluded.holder,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
            WHERE leases.expires_at <= ?3 OR leases.holder = excluded.holder
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(millis(now))
        .bind(millis(now + ttl))
        .execute(&self.pool)
        .await?;

        let acquired = result.rows_affected() == 1;
        debug!(lease = name, holder, acquired, "Lease acquire attempt");
        Ok(acquired)
    }

    /// Extends a lease we still hold. Returns false if it was lost.
    pub async fn renew(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE leases SET expires_at = ?1 WHERE name = ?2 AND holder = ?3 AND expires_at > ?4",
        )
        .bind(millis(now + ttl))
        .bind(name)
        .bind(holder)
        .bind(millis(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Releases the lease if `holder` still owns it.
    pub async fn release(&self, name: &str, holder: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM leases WHERE name = ?1 AND holder = ?2")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await?;

        let released = result.rows_affected() == 1;
        debug!(lease = name, holder, released, "Lease release");
        Ok(released)
    }

    /// Current unexpired holder, if any.
    pub async fn holder(&self, name: &str, now: DateTime<Utc>) -> DbResult<Option<String>> {
        let holder = sqlx::query_scalar::<_, String>(
            "SELECT holder FROM leases WHERE name = ?1 AND expires_at > ?2",
        )
        .bind(name)
        .bind(millis(now))
        .fetch_optional(&self.pool)
        .await?;

        Ok(holder)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use crate::pool::{Database, DbConfig};

    #[tokio::test]
    async fn test_lease_exclusion_and_expiry() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let leases = db.leases();
        let now = Utc::now();
        let ttl = Duration::seconds(30);

        assert!(leases.try_acquire("run:store-sync", "a", ttl, now).await.unwrap());
        assert!(!leases.try_acquire("run:store-sync", "b", ttl, now).await.unwrap());
        assert_eq!(
            leases.holder("run:store-sync", now).await.unwrap().as_deref(),
            Some("a")
        );

        // Expired lease can be taken over.
        let later = now + Duration::seconds(31);
        assert!(leases.try_acquire("run:store-sync", "b", ttl, later).await.unwrap());

        // Old holder cannot release or renew the new holder's lease.
        assert!(!leases.release("run:store-sync", "a").await.unwrap());
        assert!(!leases.renew("run:store-sync", "a", ttl, later).await.unwrap());
        assert!(leases.renew("run:store-sync", "b", ttl, later).await.unwrap());
        assert!(leases.release("run:store-sync", "b").await.unwrap());
        assert_eq!(leases.holder("run:store-sync", later).await.unwrap(), None);
    }
}
