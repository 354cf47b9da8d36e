// src/recovery.rs
//! Stall Recovery.
//!
//! A worker that crashes or hangs while holding a claim never reports back;
//! its item would sit in `processing` forever. Recovery finds such items by
//! claim age alone and puts them back in `pending`, or in `error` once the
//! attempt ceiling is exceeded.
//!
//! Every transition goes through `move_item`, so racing a worker that
//! completes at the same instant is harmless: whichever move lands second is
//! a no-op.

use chrono::{DateTime, Utc};
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::clock::DynClock;
use crate::error::QueueResult;
use crate::item::{Item, Stage};
use crate::queue::DynStageQueue;
use crate::telemetry::ensure_metrics_described;

pub const MAX_ATTEMPTS_EXCEEDED: &str = "max attempts exceeded";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub errored: usize,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.requeued + self.errored
    }
}

pub struct StallRecovery {
    queue: DynStageQueue,
    clock: DynClock,
    max_processing_age: Duration,
    max_attempts: u32,
}

impl StallRecovery {
    pub fn new(
        queue: DynStageQueue,
        clock: DynClock,
        max_processing_age: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            queue,
            clock,
            max_processing_age,
            max_attempts,
        }
    }

    /// Recover with the configured age.
    pub async fn run(&self) -> QueueResult<RecoveryReport> {
        self.recover_report(self.max_processing_age).await
    }

    /// Move every claim older than `max_processing_age` out of `processing`.
    /// Returns how many items were moved.
    pub async fn recover_stalled(&self, max_processing_age: Duration) -> QueueResult<usize> {
        Ok(self.recover_report(max_processing_age).await?.total())
    }

    pub async fn recover_report(
        &self,
        max_processing_age: Duration,
    ) -> QueueResult<RecoveryReport> {
        ensure_metrics_described();
        let now = self.clock.now();
        let mut report = RecoveryReport::default();

        for item in self.queue.list(Stage::Processing, 0).await? {
            if !is_stalled(&item, now, max_processing_age) {
                continue;
            }

            let mut next = item.clone();
            next.updated_at = now;
            let to = if item.attempts > self.max_attempts {
                next.last_error = Some(MAX_ATTEMPTS_EXCEEDED.to_string());
                Stage::Error
            } else {
                next.claimed_at = None;
                next.stall_count += 1;
                Stage::Pending
            };

            if !self.queue.move_item(&next, Stage::Processing, to).await? {
                // Completed or recovered by someone else in the meantime.
                continue;
            }
            match to {
                Stage::Error => {
                    report.errored += 1;
                    counter!("pipeline_errors_total").increment(1);
                    tracing::warn!(
                        target: "recovery",
                        id = %item.id,
                        attempts = item.attempts,
                        "stalled item exceeded max attempts"
                    );
                }
                _ => {
                    report.requeued += 1;
                    counter!("pipeline_stalls_recovered_total").increment(1);
                    tracing::info!(
                        target: "recovery",
                        id = %item.id,
                        attempts = item.attempts,
                        stall_count = next.stall_count,
                        "stalled item requeued"
                    );
                }
            }
        }

        if report.total() > 0 {
            tracing::info!(
                target: "recovery",
                requeued = report.requeued,
                errored = report.errored,
                "stall recovery pass"
            );
        }
        Ok(report)
    }
}

fn is_stalled(item: &Item, now: DateTime<Utc>, max_age: Duration) -> bool {
    let since = item.claimed_at.unwrap_or(item.updated_at);
    match now.signed_duration_since(since).to_std() {
        Ok(age) => age > max_age,
        // claimed in the future relative to our clock
        Err(_) => false,
    }
}

/// Run recovery every `interval` on its own task.
pub fn spawn_recovery_task(recovery: Arc<StallRecovery>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = recovery.run().await {
                tracing::error!(target: "recovery", error = %e, "stall recovery failed");
            }
        }
    })
}
