//! # Platform Status Repository
//!
//! One row per `(shop_id, platform)`, upserted inside each run's
//! reconciliation transaction from the collector's store-level records.

use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::DbResult;
use storewatch_core::{OfflineShop, PlatformStatus, PlatformSummary};

/// Repository for platform status rows.
#[derive(Debug, Clone)]
pub struct PlatformStatusRepository {
    pool: SqlitePool,
}

impl PlatformStatusRepository {
    /// Creates a new PlatformStatusRepository.
    pub fn new(pool: SqlitePool) -> Self {
        PlatformStatusRepository { pool }
    }

    /// Inserts or replaces the status rows in one transaction.
    pub async fn upsert_many(&self, rows: &[PlatformStatus]) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;
        let written = upsert_statuses_in(&mut tx, rows).await?;
        tx.commit().await?;
        Ok(written)
    }

    /// Lists every status row.
    pub async fn list(&self) -> DbResult<Vec<PlatformStatus>> {
        let rows = sqlx::query_as::<_, PlatformStatus>(
            r#"
            SELECT shop_id, platform, online, items_synced, items_total, last_checked_at, last_error
            FROM platform_status
            ORDER BY shop_id, platform
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Online/offline counts per platform.
    pub async fn summary(&self) -> DbResult<Vec<PlatformSummary>> {
        let rows = sqlx::query_as::<_, PlatformSummary>(
            r#"
            SELECT
                platform,
                SUM(CASE WHEN online THEN 1 ELSE 0 END) AS online,
                SUM(CASE WHEN online THEN 0 ELSE 1 END) AS offline,
                COUNT(*) AS total
            FROM platform_status
            GROUP BY platform
            ORDER BY platform
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Shops offline on any platform, with display names where known.
    pub async fn offline(&self) -> DbResult<Vec<OfflineShop>> {
        let rows = sqlx::query_as::<_, OfflineShop>(
            r#"
            SELECT
                ps.shop_id AS shop_id,
                s.name AS name,
                ps.platform AS platform,
                ps.last_checked_at AS last_checked_at,
                ps.last_error AS last_error
            FROM platform_status ps
            LEFT JOIN shops s ON s.shop_id = ps.shop_id
            WHERE ps.online = 0
            ORDER BY ps.shop_id, ps.platform
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

/// Upserts status rows on an open connection or transaction.
pub(crate) async fn upsert_statuses_in(
    conn: &mut SqliteConnection,
    rows: &[PlatformStatus],
) -> DbResult<u64> {
    let mut written = 0;

    for row in rows {
        let result = sqlx::query(
            r#"
            INSERT INTO platform_status (
                shop_id, platform, online, items_synced, items_total, last_checked_at, last_error
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(shop_id, platform) DO UPDATE SET
                online = excluded.online,
                items_synced = excluded.items_synced,
                items_total = excluded.items_total,
                last_checked_at = excluded.last_checked_at,
                last_error = excluded.last_error
            "#,
        )
        .bind(&row.shop_id)
        .bind(row.platform.as_str())
        .bind(row.online)
        .bind(row.items_synced)
        .bind(row.items_total)
        .bind(row.last_checked_at)
        .bind(&row.last_error)
        .execute(&mut *conn)
        .await?;
        written += result.rows_affected();
    }

    debug!(count = written, "Upserted platform status rows");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::pool::{Database, DbConfig};
    use storewatch_core::{Platform, PlatformStatus, Shop};

    fn status(shop: &str, platform: Platform, online: bool) -> PlatformStatus {
        PlatformStatus {
            shop_id: shop.to_string(),
            platform,
            online,
            items_synced: 3,
            items_total: 4,
            last_checked_at: Utc::now(),
            last_error: None,
        }
    }

    #[tokio::test]
    async fn test_at_most_one_row_per_pair() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.platform_status();

        repo.upsert_many(&[status("S1", Platform::Grab, true)]).await.unwrap();
        repo.upsert_many(&[status("S1", Platform::Grab, false)]).await.unwrap();

        let rows = repo.list().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].online);
    }

    #[tokio::test]
    async fn test_summary_and_offline() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.shops()
            .upsert_many(&[Shop {
                shop_id: "S2".into(),
                name: "Harbour".into(),
                brand: None,
                has_active_items: true,
                last_synced_at: None,
            }])
            .await
            .unwrap();
        let repo = db.platform_status();
        repo.upsert_many(&[
            status("S1", Platform::Grab, true),
            status("S2", Platform::Grab, false),
            status("S2", Platform::Foodpanda, true),
        ])
        .await
        .unwrap();

        let summary = repo.summary().await.unwrap();
        let grab = summary.iter().find(|s| s.platform == Platform::Grab).unwrap();
        assert_eq!((grab.online, grab.offline, grab.total), (1, 1, 2));

        let offline = repo.offline().await.unwrap();
        assert_eq!(offline.len(), 1);
        assert_eq!(offline[0].shop_id, "S2");
        assert_eq!(offline[0].name.as_deref(), Some("Harbour"));
    }
}
