//! Subcommand implementations. Each prints one JSON document to stdout.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::app::App;
use storewatch_core::CacheTier;
use storewatch_sync::{RunState, Scheduler};

// =============================================================================
// sync
// =============================================================================

/// Options for `storewatch sync`.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub page: Option<u32>,
    pub size: Option<u32>,
    pub once: bool,
    pub interval_secs: Option<u64>,
}

/// Runs one sync (`--once`) or ticks until cancelled.
///
/// A failed `--once` run is an error so cron and systemd see a non-zero exit.
pub async fn sync(
    app: &App,
    options: SyncOptions,
    cancel: CancellationToken,
) -> anyhow::Result<Value> {
    let page = options.page.unwrap_or(app.config.sync.page);
    let size = options.size.unwrap_or(app.config.sync.size);
    anyhow::ensure!(size > 0, "--size must be greater than zero");

    let interval = options
        .interval_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| app.config.sync.interval());
    anyhow::ensure!(!interval.is_zero(), "--interval-secs must be greater than zero");

    let scheduler = Scheduler::new(Arc::new(app.orchestrator()?), interval, page, size);

    if options.once {
        let report = scheduler.run_once(&cancel).await;
        let output = serde_json::to_value(&report)?;
        if report.state == RunState::Failed {
            anyhow::bail!(
                "sync run failed ({}): {}",
                report.error_class.map(|c| c.as_str()).unwrap_or("internal"),
                report.error.as_deref().unwrap_or("no detail")
            );
        }
        return Ok(output);
    }

    let stats = scheduler.run(cancel).await;
    Ok(serde_json::to_value(stats)?)
}

// =============================================================================
// invalidate
// =============================================================================

/// Drops cache entries. With neither a key nor a tier, drops the dashboard set.
pub async fn invalidate(
    app: &App,
    tier: Option<CacheTier>,
    key: Option<String>,
) -> anyhow::Result<Value> {
    let mut removed = 0u64;

    if let Some(key) = &key {
        if app.cache.invalidate(key).await? {
            removed += 1;
        }
    }
    if let Some(tier) = tier {
        removed += app.cache.invalidate_tier(tier).await?;
    }
    if key.is_none() && tier.is_none() {
        removed += app.cache.invalidate_dashboard().await?;
    }

    info!(removed, "Cache invalidated");
    Ok(json!({ "removed": removed }))
}

// =============================================================================
// dashboard
// =============================================================================

pub async fn dashboard(app: &App, change_limit: u32) -> anyhow::Result<Value> {
    let overview = app.dashboard().overview(change_limit).await?;
    Ok(serde_json::to_value(overview)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use storewatch_core::Platform;
    use storewatch_sync::StorewatchConfig;

    async fn app(dir: &std::path::Path, script: Option<&str>) -> App {
        let mut config = StorewatchConfig::default();
        config.database.path = dir.join("storewatch.db");
        if let Some(script) = script {
            config.collector.command = "sh".into();
            config.collector.args = vec!["-c".into(), script.into()];
            config.collector.timeout_secs = 5;
            config.collector.cache_dir = dir.join("collector-cache");
            config.collector.platforms = vec![Platform::Grab];
        }
        App::connect(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_sync_once_then_dashboard() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(
            dir.path(),
            Some(r#"echo '{"grab":[{"shopId":"S1","itemId":"7","available":true}]}'"#),
        )
        .await;

        let options = SyncOptions {
            once: true,
            ..Default::default()
        };
        let report = sync(&app, options, CancellationToken::new()).await.unwrap();
        assert_eq!(report["state"], "completed");
        assert_eq!(report["reconcile"]["snapshots_written"], 1);

        let overview = dashboard(&app, 10).await.unwrap();
        assert_eq!(overview["item_kpis"]["total_items"], 1);
        assert_eq!(overview["recent_changes"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_once_failure_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), Some("echo 'no json here'; exit 1")).await;

        let options = SyncOptions {
            once: true,
            ..Default::default()
        };
        let err = sync(&app, options, CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("collector"));
    }

    #[tokio::test]
    async fn test_invalidate_defaults_to_dashboard_keys() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), None).await;

        app.dashboard().item_kpis().await.unwrap();
        app.dashboard().shop_names().await.unwrap();

        let out = invalidate(&app, None, None).await.unwrap();
        assert_eq!(out["removed"], 1);

        let out = invalidate(&app, Some(CacheTier::VerySlow), None).await.unwrap();
        assert_eq!(out["removed"], 1);

        let out = invalidate(&app, None, Some("dashboard:missing".into())).await.unwrap();
        assert_eq!(out["removed"], 0);
    }
}
