// src/batch.rs
//! Rate-Limited Batch Processor.
//!
//! Specialized dispatcher for the quota-limited generation API. Throttling is
//! two-tier: a fixed sleep after every item (success or not) and a sleep
//! between batches in the driving loop. Both sleeps happen on the worker's own
//! task and are the quota guarantee; do not parallelize them away.
//!
//! Failed generations go to `failed` (not `error`) so they can be retried in
//! bulk with [`BatchProcessor::retry_failed`].

use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::clock::DynClock;
use crate::config::BatchConfig;
use crate::error::{QueueError, QueueResult};
use crate::fingerprint::fingerprint;
use crate::generate::{is_empty_artifact, Generator};
use crate::item::{Item, Stage};
use crate::queue::DynStageQueue;
use crate::stats::{PipelineStats, StatsAggregator, Throttle};
use crate::telemetry::ensure_metrics_described;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AddOutcome {
    pub added: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub processed: usize,
    pub success: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryOutcome {
    pub readded: usize,
}

pub struct BatchProcessor {
    queue: DynStageQueue,
    generator: Arc<dyn Generator>,
    clock: DynClock,
    cfg: BatchConfig,
}

impl BatchProcessor {
    pub fn new(
        queue: DynStageQueue,
        generator: Arc<dyn Generator>,
        clock: DynClock,
        cfg: BatchConfig,
    ) -> Self {
        Self {
            queue,
            generator,
            clock,
            cfg,
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.cfg
    }

    pub fn queue(&self) -> &DynStageQueue {
        &self.queue
    }

    /// True if the payload already carries a generated artifact.
    pub fn has_artifact(&self, payload: &Value) -> bool {
        payload
            .get(&self.cfg.artifact_field)
            .is_some_and(|v| !is_empty_artifact(v))
    }

    /// Queue payloads for generation.
    ///
    /// Skips payloads that already carry an artifact, and payloads whose item
    /// is already somewhere in this queue. The fingerprint store is not
    /// consulted here.
    pub async fn add_to_queue(&self, payloads: Vec<Value>) -> QueueResult<AddOutcome> {
        let mut out = AddOutcome::default();
        for payload in payloads {
            if self.has_artifact(&payload) {
                out.skipped += 1;
                continue;
            }
            let id = fingerprint(&payload);
            if self.queue.get(&id).await?.is_some() {
                out.skipped += 1;
                continue;
            }
            match self
                .queue
                .push(Stage::Pending, Item::new(id, payload, self.clock.now()))
                .await
            {
                Ok(()) => out.added += 1,
                // lost a race with another add for the same id
                Err(QueueError::Invalid(_)) => out.skipped += 1,
                Err(e) => return Err(e),
            }
        }
        tracing::info!(
            target: "batch",
            added = out.added,
            skipped = out.skipped,
            "added to generation queue"
        );
        Ok(out)
    }

    /// Claim up to `batch_size` items and run each through the generator,
    /// sleeping the inter-item delay after every call.
    ///
    /// Generation failures move the item to `failed` and never abort the
    /// batch. Store errors do abort it; items still claimed at that point are
    /// left to stall recovery.
    pub async fn process_batch(&self, batch_size: usize) -> QueueResult<BatchOutcome> {
        ensure_metrics_described();
        let claimed = self.claim_batch(batch_size).await?;
        let mut out = BatchOutcome::default();
        if claimed.is_empty() {
            return Ok(out);
        }
        tracing::info!(
            target: "batch",
            size = claimed.len(),
            generator = self.generator.name(),
            "batch started"
        );

        for item in claimed {
            let res = self.generator.generate(&item.payload).await;
            out.processed += 1;
            match res {
                Ok(artifact) => {
                    if self.finish_success(&item, artifact).await? {
                        out.success += 1;
                    }
                }
                Err(e) => {
                    if self.finish_failure(&item, &format!("{e:#}")).await? {
                        out.failed += 1;
                    }
                }
            }
            tokio::time::sleep(self.cfg.inter_item_delay()).await;
        }

        tracing::info!(
            target: "batch",
            processed = out.processed,
            success = out.success,
            failed = out.failed,
            "batch finished"
        );
        Ok(out)
    }

    /// Move everything in `failed` back to `pending`. `attempts` is kept so
    /// repeated permanent failures stay visible.
    pub async fn retry_failed(&self) -> QueueResult<RetryOutcome> {
        let now = self.clock.now();
        let mut out = RetryOutcome::default();
        for item in self.queue.list(Stage::Failed, 0).await? {
            let mut next = item.clone();
            next.claimed_at = None;
            next.updated_at = now;
            if self
                .queue
                .move_item(&next, Stage::Failed, Stage::Pending)
                .await?
            {
                out.readded += 1;
            }
        }
        if out.readded > 0 {
            tracing::info!(target: "batch", readded = out.readded, "failed items requeued");
        }
        Ok(out)
    }

    pub async fn get_stats(&self) -> QueueResult<PipelineStats> {
        StatsAggregator::new(self.queue.clone(), Throttle::from(&self.cfg))
            .get_stats()
            .await
    }

    async fn claim_batch(&self, batch_size: usize) -> QueueResult<Vec<Item>> {
        let now = self.clock.now();
        let mut claimed = Vec::with_capacity(batch_size);
        for _ in 0..batch_size {
            let next = self
                .queue
                .pop_into(Stage::Pending, Stage::Processing, &|it: &mut Item| {
                    it.claimed_at = Some(now);
                    it.attempts += 1;
                    it.updated_at = now;
                })
                .await?;
            match next {
                Some(it) => {
                    counter!("pipeline_claims_total").increment(1);
                    claimed.push(it);
                }
                None => break,
            }
        }
        Ok(claimed)
    }

    async fn finish_success(&self, item: &Item, artifact: Value) -> QueueResult<bool> {
        let mut done = item.clone();
        if let Value::Object(m) = &mut done.payload {
            m.insert(self.cfg.artifact_field.clone(), artifact.clone());
        }
        done.result = Some(artifact);
        done.last_error = None;
        done.updated_at = self.clock.now();

        let moved = self
            .queue
            .move_item(&done, Stage::Processing, Stage::Completed)
            .await?;
        if moved {
            counter!("pipeline_generation_success_total").increment(1);
            counter!("pipeline_completed_total").increment(1);
            tracing::debug!(target: "batch", id = %item.id, "generated");
        } else {
            tracing::warn!(
                target: "batch",
                id = %item.id,
                "generated but claim was lost; result dropped"
            );
        }
        Ok(moved)
    }

    async fn finish_failure(&self, item: &Item, error: &str) -> QueueResult<bool> {
        let mut failed = item.clone();
        failed.last_error = Some(error.to_string());
        failed.updated_at = self.clock.now();

        let moved = self
            .queue
            .move_item(&failed, Stage::Processing, Stage::Failed)
            .await?;
        counter!("pipeline_generation_failed_total").increment(1);
        tracing::warn!(
            target: "batch",
            id = %item.id,
            attempts = item.attempts,
            error,
            "generation failed"
        );
        Ok(moved)
    }
}

/// Spawn the batch loop: optionally requeue `failed`, run one batch, then
/// sleep the inter-batch delay. Store errors are logged and the loop carries
/// on after the same delay.
pub fn spawn_batch_worker(processor: Arc<BatchProcessor>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cfg = processor.config().clone();
        let pause: Duration = cfg.inter_batch_delay();
        tracing::info!(
            target: "batch",
            batch_size = cfg.batch_size,
            inter_item_ms = cfg.inter_item_delay_ms,
            inter_batch_ms = cfg.inter_batch_delay_ms,
            "batch worker started"
        );
        loop {
            if cfg.auto_retry_failed {
                if let Err(e) = processor.retry_failed().await {
                    tracing::error!(target: "batch", error = %e, "retry_failed failed");
                }
            }
            if let Err(e) = processor.process_batch(cfg.batch_size).await {
                tracing::error!(target: "batch", error = %e, "batch aborted");
            }
            tokio::time::sleep(pause).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::queue::MemoryStageQueue;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use serde_json::json;

    struct Never;

    #[async_trait]
    impl Generator for Never {
        async fn generate(&self, _payload: &Value) -> anyhow::Result<Value> {
            Err(anyhow!("unreachable"))
        }
        fn name(&self) -> &'static str {
            "never"
        }
    }

    fn processor() -> BatchProcessor {
        BatchProcessor::new(
            Arc::new(MemoryStageQueue::new()),
            Arc::new(Never),
            Arc::new(SystemClock),
            BatchConfig::default(),
        )
    }

    #[test]
    fn artifact_marker_detection() {
        let p = processor();
        assert!(p.has_artifact(&json!({ "generated_image": "https://x/1.png" })));
        assert!(!p.has_artifact(&json!({ "generated_image": "" })));
        assert!(!p.has_artifact(&json!({ "generated_image": null })));
        assert!(!p.has_artifact(&json!({ "title": "X" })));
    }

    #[tokio::test]
    async fn empty_queue_processes_nothing_without_sleeping() {
        let p = processor();
        let out = p.process_batch(5).await.unwrap();
        assert_eq!(out, BatchOutcome::default());
    }
}
