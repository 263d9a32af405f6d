//! # Cache Entry Repository
//!
//! Backing rows for the SQLite cache store. Every process that opens the same
//! database file sees the same entries, so invalidation by the sync job is
//! visible to dashboard readers immediately.
//!
//! Expiry is stored as Unix milliseconds and checked in the `SELECT`; expired
//! rows are invisible before they are purged.
//!
//! ## Invalidation Epoch
//! ```text
//!   reader                               writer (sync job)
//!   ──────                               ─────────────────
//!   e = epoch()
//!   compute from tables ...              BEGIN
//!                                          DELETE FROM cache_entries ...
//!                                          epoch = epoch + 1
//!                                        COMMIT
//!   set_if_epoch(.., e)  → not stored
//! ```
//! Every delete bumps `cache_epoch` in the same transaction. A conditional
//! write compares the epoch in the same statement as the insert.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use super::millis;
use crate::error::DbResult;
use storewatch_core::CacheTier;

/// Repository for `cache_entries`.
#[derive(Debug, Clone)]
pub struct CacheRepository {
    pool: SqlitePool,
}

impl CacheRepository {
    /// Creates a new CacheRepository.
    pub fn new(pool: SqlitePool) -> Self {
        CacheRepository { pool }
    }

    /// Returns the value if present and unexpired at `now`.
    pub async fn get(&self, key: &str, now: DateTime<Utc>) -> DbResult<Option<String>> {
        let value = sqlx::query_scalar::<_, String>(
            "SELECT value FROM cache_entries WHERE key = ?1 AND expires_at > ?2",
        )
        .bind(key)
        .bind(millis(now))
        .fetch_optional(&self.pool)
        .await?;

        Ok(value)
    }

    /// Inserts or replaces an entry.
    ///
    /// `tier` is `None` for entries outside the dashboard tiers (the partner token).
    pub async fn set(
        &self,
        key: &str,
        tier: Option<CacheTier>,
        value: &str,
        inserted_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, tier, value, inserted_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(key) DO UPDATE SET
                tier = excluded.tier,
                value = excluded.value,
                inserted_at = excluded.inserted_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(tier.map(|t| t.as_str()))
        .bind(value)
        .bind(millis(inserted_at))
        .bind(millis(expires_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Current invalidation epoch.
    pub async fn epoch(&self) -> DbResult<i64> {
        let epoch = sqlx::query_scalar::<_, i64>("SELECT epoch FROM cache_epoch WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        Ok(epoch.unwrap_or(0))
    }

    /// Inserts or replaces an entry only while the epoch still equals `epoch`.
    ///
    /// Returns whether the entry was written.
    pub async fn set_if_epoch(
        &self,
        key: &str,
        tier: Option<CacheTier>,
        value: &str,
        inserted_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        epoch: i64,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO cache_entries (key, tier, value, inserted_at, expires_at)
            SELECT ?1, ?2, ?3, ?4, ?5
            WHERE (SELECT epoch FROM cache_epoch WHERE id = 1) = ?6
            ON CONFLICT(key) DO UPDATE SET
                tier = excluded.tier,
                value = excluded.value,
                inserted_at = excluded.inserted_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(tier.map(|t| t.as_str()))
        .bind(value)
        .bind(millis(inserted_at))
        .bind(millis(expires_at))
        .bind(epoch)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Deletes one entry and bumps the epoch. Returns whether it existed.
    pub async fn delete(&self, key: &str) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM cache_entries WHERE key = ?1")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        bump_epoch(&mut tx).await?;
        tx.commit().await?;

        Ok(result.rows_affected() > 0)
    }

    /// Deletes several entries and bumps the epoch in one transaction.
    pub async fn delete_many(&self, keys: &[&str]) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for key in keys {
            removed += sqlx::query("DELETE FROM cache_entries WHERE key = ?1")
                .bind(*key)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        bump_epoch(&mut tx).await?;
        tx.commit().await?;
        Ok(removed)
    }

    /// Deletes every entry of a tier and bumps the epoch in one transaction.
    pub async fn delete_tier(&self, tier: CacheTier) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM cache_entries WHERE tier = ?1")
            .bind(tier.as_str())
            .execute(&mut *tx)
            .await?;
        bump_epoch(&mut tx).await?;
        tx.commit().await?;

        debug!(tier = %tier, removed = result.rows_affected(), "Cache tier cleared");
        Ok(result.rows_affected())
    }

    /// Removes rows that expired before `now`.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= ?1")
            .bind(millis(now))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

async fn bump_epoch(conn: &mut SqliteConnection) -> DbResult<()> {
    sqlx::query("UPDATE cache_epoch SET epoch = epoch + 1 WHERE id = 1")
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use crate::pool::{Database, DbConfig};
    use storewatch_core::CacheTier;

    #[tokio::test]
    async fn test_expiry_and_tier_delete() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let cache = db.cache();
        let now = Utc::now();

        cache.set("a", Some(CacheTier::Fast), "1", now, now + Duration::seconds(60)).await.unwrap();
        cache.set("b", Some(CacheTier::Fast), "2", now, now + Duration::seconds(60)).await.unwrap();
        cache.set("c", Some(CacheTier::Slow), "3", now, now + Duration::seconds(60)).await.unwrap();
        cache.set("t", None, "tok", now, now + Duration::seconds(60)).await.unwrap();

        assert_eq!(cache.get("a", now).await.unwrap().as_deref(), Some("1"));
        assert_eq!(cache.get("a", now + Duration::seconds(61)).await.unwrap(), None);

        assert_eq!(cache.delete_tier(CacheTier::Fast).await.unwrap(), 2);
        assert_eq!(cache.get("b", now).await.unwrap(), None);
        assert_eq!(cache.get("c", now).await.unwrap().as_deref(), Some("3"));
        assert_eq!(cache.get("t", now).await.unwrap().as_deref(), Some("tok"));

        assert!(cache.delete("c").await.unwrap());
        assert!(!cache.delete("c").await.unwrap());
        assert_eq!(cache.purge_expired(now + Duration::seconds(120)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_conditional_set_respects_epoch() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let cache = db.cache();
        let now = Utc::now();
        let later = now + Duration::seconds(60);
        let tier = Some(CacheTier::Moderate);

        let epoch = cache.epoch().await.unwrap();
        assert!(cache.set_if_epoch("k", tier, "v1", now, later, epoch).await.unwrap());
        assert_eq!(cache.get("k", now).await.unwrap().as_deref(), Some("v1"));

        cache.delete_tier(CacheTier::Moderate).await.unwrap();
        assert_eq!(cache.epoch().await.unwrap(), epoch + 1);
        assert!(!cache.set_if_epoch("k", tier, "v2", now, later, epoch).await.unwrap());
        assert_eq!(cache.get("k", now).await.unwrap(), None);

        let fresh = cache.epoch().await.unwrap();
        assert!(cache.set_if_epoch("k", tier, "v3", now, later, fresh).await.unwrap());
        assert_eq!(cache.get("k", now).await.unwrap().as_deref(), Some("v3"));
    }
}
