//! # Scheduler
//!
//! Periodic driver for [`SyncOrchestrator::run_once`].
//!
//! ```text
//!   interval tick ──► spawn run_once ──► RunReport ──► stats
//!        │                 │
//!        │                 └─ lease held by the previous tick → Skipped
//!        │
//!   cancel token ──► stop ticking, cancel in-flight collector, drain tasks
//! ```
//!
//! Missed ticks are skipped rather than burst. Runs are spawned so a long
//! collector never delays the next tick; overlap is resolved by the run lease.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::orchestrator::{RunReport, RunState, SyncOrchestrator};

/// Counts of finished runs by outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub completed: u64,
    pub partial: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl SchedulerStats {
    fn record(&mut self, report: &RunReport) {
        match report.state {
            RunState::Completed if report.is_partial() => self.partial += 1,
            RunState::Completed => self.completed += 1,
            RunState::Skipped => self.skipped += 1,
            RunState::Failed => self.failed += 1,
            RunState::Idle | RunState::Running => {}
        }
    }

    pub fn total(&self) -> u64 {
        self.completed + self.partial + self.failed + self.skipped
    }
}

/// Ticks the orchestrator until cancelled.
pub struct Scheduler {
    orchestrator: Arc<SyncOrchestrator>,
    interval: Duration,
    page: u32,
    size: u32,
}

impl Scheduler {
    pub fn new(
        orchestrator: Arc<SyncOrchestrator>,
        interval: Duration,
        page: u32,
        size: u32,
    ) -> Self {
        Scheduler {
            orchestrator,
            interval,
            page,
            size,
        }
    }

    /// Runs a single sync in the foreground.
    pub async fn run_once(&self, cancel: &CancellationToken) -> RunReport {
        self.orchestrator.run_once(self.page, self.size, cancel).await
    }

    /// Ticks until `cancel` fires, then waits for in-flight runs.
    ///
    /// The first tick fires immediately.
    pub async fn run(&self, cancel: CancellationToken) -> SchedulerStats {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tasks: JoinSet<RunReport> = JoinSet::new();
        let mut stats = SchedulerStats::default();

        info!(
            interval_secs = self.interval.as_secs(),
            page = self.page,
            size = self.size,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(in_flight = tasks.len(), "Scheduler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    debug!("Scheduler tick");
                    let orchestrator = Arc::clone(&self.orchestrator);
                    let token = cancel.clone();
                    let (page, size) = (self.page, self.size);
                    tasks.spawn(async move { orchestrator.run_once(page, size, &token).await });
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    Self::reap(joined, &mut stats);
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            Self::reap(joined, &mut stats);
        }

        info!(
            completed = stats.completed,
            partial = stats.partial,
            failed = stats.failed,
            skipped = stats.skipped,
            "Scheduler stopped"
        );
        stats
    }

    fn reap(joined: Result<RunReport, tokio::task::JoinError>, stats: &mut SchedulerStats) {
        match joined {
            Ok(report) => {
                debug!(run_id = ?report.run_id, state = %report.state, "Run finished");
                stats.record(&report);
            }
            Err(e) => {
                error!(error = %e, "Run task panicked");
                stats.failed += 1;
            }
        }
    }
}
