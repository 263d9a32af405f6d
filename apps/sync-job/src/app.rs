//! Process wiring: database, cache and lease backends, sources.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use storewatch_db::{Database, DbConfig};
use storewatch_sync::{
    build_http_client, CacheBackend, CacheStore, CollectorRunner, Dashboard, LeaseStore,
    PartnerApiClient, RedisCacheStore, RedisLeaseStore, SqliteCacheStore, SqliteLeaseStore,
    StorewatchConfig, SyncOrchestrator, TieredCache, TokenStore,
};

/// Shared handles for one `storewatch` invocation.
pub struct App {
    pub config: Arc<StorewatchConfig>,
    pub db: Database,
    pub cache: Arc<TieredCache>,
    pub leases: Arc<dyn LeaseStore>,
}

impl App {
    /// Opens the database (running migrations) and connects the configured backend.
    pub async fn connect(config: StorewatchConfig) -> anyhow::Result<Self> {
        let db = Database::new(DbConfig::new(config.database.path.clone()))
            .await
            .with_context(|| format!("opening database {}", config.database.path.display()))?;

        let (store, leases): (Arc<dyn CacheStore>, Arc<dyn LeaseStore>) =
            match config.cache.backend {
                CacheBackend::Sqlite => (
                    Arc::new(SqliteCacheStore::new(db.cache())),
                    Arc::new(SqliteLeaseStore::new(db.leases())),
                ),
                CacheBackend::Redis => {
                    let url = config
                        .cache
                        .redis_url
                        .as_deref()
                        .context("cache.backend = \"redis\" requires cache.redis_url")?;
                    let conn = RedisCacheStore::connect(url)
                        .await
                        .context("connecting to Redis")?;
                    (
                        Arc::new(RedisCacheStore::new(conn.clone())),
                        Arc::new(RedisLeaseStore::new(conn)),
                    )
                }
            };
        info!(backend = %config.cache.backend, "Cache backend ready");

        let cache = Arc::new(TieredCache::new(store, config.cache.clone()));

        Ok(App {
            config: Arc::new(config),
            db,
            cache,
            leases,
        })
    }

    /// Orchestrator with every configured source attached.
    pub fn orchestrator(&self) -> anyhow::Result<SyncOrchestrator> {
        let mut orchestrator = SyncOrchestrator::new(
            self.db.clone(),
            Arc::clone(&self.config),
            Arc::clone(&self.cache),
            Arc::clone(&self.leases),
        );

        if self.config.collector.is_enabled() {
            info!(
                command = %self.config.collector.command,
                platforms = ?self.config.collector.platforms,
                "Collector enabled"
            );
            let collector = CollectorRunner::new(self.config.collector.clone());
            orchestrator = orchestrator.with_collector(collector);
        }

        if self.config.partner.is_configured() {
            let http = build_http_client(&self.config.partner)?;
            let tokens = Arc::new(TokenStore::new(
                http.clone(),
                self.config.partner.clone(),
                self.cache.store(),
                Arc::clone(&self.leases),
            ));
            info!(base_url = %self.config.partner.base_url, "Partner API enabled");
            orchestrator = orchestrator.with_partner(Arc::new(PartnerApiClient::new(
                http,
                self.config.partner.clone(),
                tokens,
            )));
        }

        Ok(orchestrator)
    }

    pub fn dashboard(&self) -> Dashboard {
        Dashboard::from_config(self.db.clone(), Arc::clone(&self.cache), &self.config)
    }
}
