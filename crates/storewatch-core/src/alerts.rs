//! # Alert Rules
//!
//! Computes alert-worthy conditions from already-loaded read models. Delivery
//! (email, SMS) is someone else's job; this only decides what is wrong.
//!
//! ## Rules
//! | Kind               | Severity | Fires when                                          |
//! |--------------------|----------|-----------------------------------------------------|
//! | `shop_offline`     | warning  | a shop is offline on a platform                     |
//! | `low_availability` | warning  | a shop's available/total item ratio < threshold     |
//! | `last_run_failed`  | critical | the most recent finished run failed                 |
//! | `partial_coverage` | warning  | the latest completed run had failed sources         |
//! | `stale_data`       | critical | no completed run within `stale_after`               |

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{OfflineShop, Platform, RunStatus, ShopAvailability, SyncRun};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ShopOffline,
    LowAvailability,
    LastRunFailed,
    PartialCoverage,
    StaleData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

/// One alert-worthy condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: Severity,
    pub shop_id: Option<String>,
    pub platform: Option<Platform>,
    pub message: String,
}

/// Thresholds for [`evaluate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertRules {
    /// Minimum acceptable available/total ratio per shop (0.0 to 1.0).
    pub availability_threshold: f64,
    /// Maximum age of the latest completed run.
    pub stale_after: Duration,
}

impl Default for AlertRules {
    fn default() -> Self {
        AlertRules {
            availability_threshold: 0.5,
            stale_after: Duration::hours(1),
        }
    }
}

/// Inputs loaded by the dashboard before evaluating.
#[derive(Debug, Clone, Copy)]
pub struct AlertInputs<'a> {
    pub offline: &'a [OfflineShop],
    pub availability: &'a [ShopAvailability],
    /// Most recent run that is no longer running.
    pub last_finished: Option<&'a SyncRun>,
    /// Most recent completed run.
    pub last_completed: Option<&'a SyncRun>,
    pub now: DateTime<Utc>,
}

/// Evaluates every rule. Critical alerts sort first.
pub fn evaluate(rules: &AlertRules, inputs: AlertInputs<'_>) -> Vec<Alert> {
    let mut alerts = Vec::new();

    for shop in inputs.offline {
        let label = shop.name.as_deref().unwrap_or(&shop.shop_id);
        let mut message = format!("{} is offline on {}", label, shop.platform);
        if let Some(err) = &shop.last_error {
            message.push_str(&format!(" ({})", err));
        }
        alerts.push(Alert {
            kind: AlertKind::ShopOffline,
            severity: Severity::Warning,
            shop_id: Some(shop.shop_id.clone()),
            platform: Some(shop.platform),
            message,
        });
    }

    for shop in inputs.availability.iter().filter(|s| s.total > 0) {
        let ratio = shop.available as f64 / shop.total as f64;
        if ratio < rules.availability_threshold {
            let label = shop.name.as_deref().unwrap_or(&shop.shop_id);
            alerts.push(Alert {
                kind: AlertKind::LowAvailability,
                severity: Severity::Warning,
                shop_id: Some(shop.shop_id.clone()),
                platform: None,
                message: format!(
                    "{} has {}/{} items available ({:.0}%)",
                    label,
                    shop.available,
                    shop.total,
                    ratio * 100.0
                ),
            });
        }
    }

    if let Some(run) = inputs.last_finished.filter(|r| r.status == RunStatus::Failed) {
        let class = run.error_class.map(|c| c.as_str()).unwrap_or("internal");
        alerts.push(Alert {
            kind: AlertKind::LastRunFailed,
            severity: Severity::Critical,
            shop_id: None,
            platform: None,
            message: format!(
                "run {} failed ({}): {}",
                run.id,
                class,
                run.error_message.as_deref().unwrap_or("no detail")
            ),
        });
    }

    if let Some(run) = inputs.last_completed.filter(|r| r.is_partial()) {
        alerts.push(Alert {
            kind: AlertKind::PartialCoverage,
            severity: Severity::Warning,
            shop_id: None,
            platform: None,
            message: format!(
                "run {} completed with partial data; failed sources: {}",
                run.id,
                run.failed().join(", ")
            ),
        });
    }

    let fresh = inputs
        .last_completed
        .and_then(|r| r.finished_at)
        .map(|at| inputs.now - at <= rules.stale_after)
        .unwrap_or(false);
    if !fresh {
        let message = match inputs.last_completed.and_then(|r| r.finished_at) {
            Some(at) => format!("no completed sync since {}", at.to_rfc3339()),
            None => "no sync run has completed yet".to_string(),
        };
        alerts.push(Alert {
            kind: AlertKind::StaleData,
            severity: Severity::Critical,
            shop_id: None,
            platform: None,
            message,
        });
    }

    alerts.sort_by(|a, b| b.severity.cmp(&a.severity));
    alerts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorClass;

    fn run(id: i64, status: RunStatus, finished_at: DateTime<Utc>, failed: &str) -> SyncRun {
        SyncRun {
            id,
            job_name: "store-sync".to_string(),
            status,
            started_at: finished_at,
            finished_at: Some(finished_at),
            snapshots_written: 1,
            changes_emitted: 0,
            covered_sources: "[]".to_string(),
            failed_sources: failed.to_string(),
            error_class: (status == RunStatus::Failed).then_some(ErrorClass::Timeout),
            error_message: (status == RunStatus::Failed).then(|| "collector timed out".to_string()),
        }
    }

    #[test]
    fn test_healthy_state_has_no_alerts() {
        let now = Utc::now();
        let ok = run(3, RunStatus::Completed, now - Duration::minutes(5), "[]");
        let availability = [ShopAvailability {
            shop_id: "S1".into(),
            name: Some("Central".into()),
            total: 10,
            available: 9,
        }];

        let alerts = evaluate(
            &AlertRules::default(),
            AlertInputs {
                offline: &[],
                availability: &availability,
                last_finished: Some(&ok),
                last_completed: Some(&ok),
                now,
            },
        );
        assert!(alerts.is_empty(), "{:?}", alerts);
    }

    #[test]
    fn test_every_rule_fires() {
        let now = Utc::now();
        let completed = run(3, RunStatus::Completed, now - Duration::hours(3), r#"["partner"]"#);
        let failed = run(4, RunStatus::Failed, now - Duration::minutes(1), "[]");
        let offline = [OfflineShop {
            shop_id: "S1".into(),
            name: Some("Central".into()),
            platform: Platform::Grab,
            last_checked_at: now,
            last_error: None,
        }];
        let availability = [ShopAvailability {
            shop_id: "S2".into(),
            name: None,
            total: 4,
            available: 1,
        }];

        let alerts = evaluate(
            &AlertRules::default(),
            AlertInputs {
                offline: &offline,
                availability: &availability,
                last_finished: Some(&failed),
                last_completed: Some(&completed),
                now,
            },
        );

        let kinds: Vec<_> = alerts.iter().map(|a| a.kind).collect();
        assert_eq!(alerts.len(), 5);
        assert!(kinds.contains(&AlertKind::ShopOffline));
        assert!(kinds.contains(&AlertKind::LowAvailability));
        assert!(kinds.contains(&AlertKind::LastRunFailed));
        assert!(kinds.contains(&AlertKind::PartialCoverage));
        assert!(kinds.contains(&AlertKind::StaleData));
        assert_eq!(alerts[0].severity, Severity::Critical);
        assert!(alerts.iter().any(|a| a.message.contains("timeout")));
    }

    #[test]
    fn test_never_completed_is_stale() {
        let alerts = evaluate(
            &AlertRules::default(),
            AlertInputs {
                offline: &[],
                availability: &[],
                last_finished: None,
                last_completed: None,
                now: Utc::now(),
            },
        );
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::StaleData);
    }
}
