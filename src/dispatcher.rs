// src/dispatcher.rs
//! Work Dispatcher: the claim / complete / fail lifecycle.
//!
//! `claim_next` never blocks; polling and backoff belong to the caller (see
//! [`spawn_dispatch_worker`]). Delivery is at-least-once: a slow worker whose
//! claim was recovered as stalled may see its `complete` turn into a no-op
//! while another worker processes the same item again.

use anyhow::Result;
use async_trait::async_trait;
use metrics::counter;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::clock::DynClock;
use crate::config::DispatchConfig;
use crate::error::QueueResult;
use crate::item::{Item, Stage};
use crate::queue::DynStageQueue;
use crate::recovery::StallRecovery;
use crate::telemetry::ensure_metrics_described;

/// Stage-specific work performed while an item is claimed (translation,
/// formatting, ...). Implementations enforce their own call timeouts.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn handle(&self, item: &Item) -> Result<Value>;
    fn name(&self) -> &'static str;
}

#[derive(Clone)]
pub struct WorkDispatcher {
    queue: DynStageQueue,
    clock: DynClock,
}

impl WorkDispatcher {
    pub fn new(queue: DynStageQueue, clock: DynClock) -> Self {
        Self { queue, clock }
    }

    pub fn queue(&self) -> &DynStageQueue {
        &self.queue
    }

    /// Claim the head of `pending`: stamp `claimed_at`, bump `attempts`, and
    /// move it to `processing` in one step. `None` when nothing is pending.
    pub async fn claim_next(&self) -> QueueResult<Option<Item>> {
        ensure_metrics_described();
        let now = self.clock.now();
        let claimed = self
            .queue
            .pop_into(Stage::Pending, Stage::Processing, &|it: &mut Item| {
                it.claimed_at = Some(now);
                it.attempts += 1;
                it.updated_at = now;
            })
            .await?;

        if let Some(it) = &claimed {
            counter!("pipeline_claims_total").increment(1);
            tracing::debug!(target: "dispatcher", id = %it.id, attempts = it.attempts, "claimed");
        }
        Ok(claimed)
    }

    /// `processing -> completed` with `result` attached. Returns `false` if
    /// the claim was lost (recovered as stalled) before this call.
    pub async fn complete(&self, item: &Item, result: Value) -> QueueResult<bool> {
        let mut done = item.clone();
        done.result = Some(result);
        done.updated_at = self.clock.now();

        let moved = self
            .queue
            .move_item(&done, Stage::Processing, Stage::Completed)
            .await?;
        if moved {
            counter!("pipeline_completed_total").increment(1);
            tracing::debug!(target: "dispatcher", id = %item.id, "completed");
        } else {
            tracing::warn!(
                target: "dispatcher",
                id = %item.id,
                "complete ignored: claim no longer held"
            );
        }
        Ok(moved)
    }

    /// `processing -> error` with `last_error` attached. Returns `false` if
    /// the claim was lost before this call.
    pub async fn fail(&self, item: &Item, error: &str) -> QueueResult<bool> {
        let mut failed = item.clone();
        failed.last_error = Some(error.to_string());
        failed.updated_at = self.clock.now();

        let moved = self
            .queue
            .move_item(&failed, Stage::Processing, Stage::Error)
            .await?;
        if moved {
            counter!("pipeline_errors_total").increment(1);
            tracing::warn!(
                target: "dispatcher",
                id = %item.id,
                attempts = item.attempts,
                error,
                "moved to error"
            );
        } else {
            tracing::warn!(
                target: "dispatcher",
                id = %item.id,
                "fail ignored: claim no longer held"
            );
        }
        Ok(moved)
    }

    /// Claim one item and run `handler` on it. Returns `Ok(false)` when
    /// `pending` was empty. Handler errors become `fail` transitions.
    pub async fn run_once(&self, handler: &dyn StageHandler) -> QueueResult<bool> {
        let Some(item) = self.claim_next().await? else {
            return Ok(false);
        };
        match handler.handle(&item).await {
            Ok(result) => {
                self.complete(&item, result).await?;
            }
            Err(e) => {
                self.fail(&item, &format!("{e:#}")).await?;
            }
        }
        Ok(true)
    }
}

/// Options for [`spawn_dispatch_worker`].
#[derive(Clone)]
pub struct DispatchWorkerCfg {
    pub poll_interval: std::time::Duration,
    /// Run stall recovery before each dispatch cycle.
    pub recovery: Option<Arc<StallRecovery>>,
}

impl DispatchWorkerCfg {
    pub fn with_recovery(mut self, recovery: Arc<StallRecovery>) -> Self {
        self.recovery = Some(recovery);
        self
    }
}

impl From<&DispatchConfig> for DispatchWorkerCfg {
    fn from(c: &DispatchConfig) -> Self {
        Self {
            poll_interval: c.poll_interval(),
            recovery: None,
        }
    }
}

/// Spawn a worker loop that keeps claiming and handling items.
///
/// Sleeps `poll_interval` whenever `pending` is empty or the store reports an
/// error; one bad item never stops the loop.
pub fn spawn_dispatch_worker(
    dispatcher: WorkDispatcher,
    handler: Arc<dyn StageHandler>,
    cfg: DispatchWorkerCfg,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(target: "dispatcher", handler = handler.name(), "dispatch worker started");
        loop {
            if let Some(rec) = &cfg.recovery {
                if let Err(e) = rec.run().await {
                    tracing::warn!(
                        target: "dispatcher",
                        error = %e,
                        "stall recovery before dispatch failed"
                    );
                }
            }

            match dispatcher.run_once(handler.as_ref()).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        target: "dispatcher",
                        handler = handler.name(),
                        error = %e,
                        "dispatch cycle failed"
                    );
                }
            }
            tokio::time::sleep(cfg.poll_interval).await;
        }
    })
}
