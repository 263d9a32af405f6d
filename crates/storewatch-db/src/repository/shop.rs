//! # Shop Repository
//!
//! Shops are upserted from the partner listing inside each run's
//! reconciliation transaction.

use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::DbResult;
use storewatch_core::Shop;

/// Repository for shop rows.
#[derive(Debug, Clone)]
pub struct ShopRepository {
    pool: SqlitePool,
}

impl ShopRepository {
    /// Creates a new ShopRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ShopRepository { pool }
    }

    /// Inserts or updates shops in one transaction.
    pub async fn upsert_many(&self, shops: &[Shop]) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;
        let written = upsert_shops_in(&mut tx, shops).await?;
        tx.commit().await?;
        Ok(written)
    }

    /// Gets a shop by id.
    pub async fn get(&self, shop_id: &str) -> DbResult<Option<Shop>> {
        let shop = sqlx::query_as::<_, Shop>(
            r#"
            SELECT shop_id, name, brand, has_active_items, last_synced_at
            FROM shops
            WHERE shop_id = ?1
            "#,
        )
        .bind(shop_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(shop)
    }

    /// Lists all shops ordered by name.
    pub async fn list(&self) -> DbResult<Vec<Shop>> {
        let shops = sqlx::query_as::<_, Shop>(
            r#"
            SELECT shop_id, name, brand, has_active_items, last_synced_at
            FROM shops
            ORDER BY name, shop_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(shops)
    }

    /// Returns `(shop_id, name)` pairs for every known shop.
    pub async fn names(&self) -> DbResult<Vec<(String, String)>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT shop_id, name FROM shops ORDER BY shop_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

/// Upserts shops on an open connection or transaction.
///
/// `last_synced_at` only moves forward when the incoming value is set.
pub(crate) async fn upsert_shops_in(conn: &mut SqliteConnection, shops: &[Shop]) -> DbResult<u64> {
    let mut written = 0;

    for shop in shops {
        let result = sqlx::query(
            r#"
            INSERT INTO shops (shop_id, name, brand, has_active_items, last_synced_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(shop_id) DO UPDATE SET
                name = excluded.name,
                brand = excluded.brand,
                has_active_items = excluded.has_active_items,
                last_synced_at = COALESCE(excluded.last_synced_at, shops.last_synced_at)
            "#,
        )
        .bind(&shop.shop_id)
        .bind(&shop.name)
        .bind(&shop.brand)
        .bind(shop.has_active_items)
        .bind(shop.last_synced_at)
        .execute(&mut *conn)
        .await?;
        written += result.rows_affected();
    }

    debug!(count = written, "Upserted shops");
    Ok(written)
}
