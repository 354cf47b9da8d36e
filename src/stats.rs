// src/stats.rs
//! Stats Aggregator: read-only view over the stage queue.

use metrics::gauge;
use serde::Serialize;
use std::time::Duration;

use crate::config::BatchConfig;
use crate::error::QueueResult;
use crate::item::Stage;
use crate::queue::DynStageQueue;

/// Throttle parameters the remaining-time estimate is based on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttle {
    pub batch_size: usize,
    pub inter_item_delay: Duration,
    pub inter_batch_delay: Duration,
}

impl Throttle {
    /// No delays at all: the estimate is always zero.
    pub fn unthrottled() -> Self {
        Self {
            batch_size: 1,
            inter_item_delay: Duration::ZERO,
            inter_batch_delay: Duration::ZERO,
        }
    }
}

impl From<&BatchConfig> for Throttle {
    fn from(c: &BatchConfig) -> Self {
        Self {
            batch_size: c.batch_size.max(1),
            inter_item_delay: c.inter_item_delay(),
            inter_batch_delay: c.inter_batch_delay(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub error: usize,
    pub failed: usize,
    /// Estimate only: assumes every pending item goes through the throttle
    /// once and ignores collaborator latency, retries and new arrivals.
    pub estimated_time_remaining_secs: u64,
}

/// Linear model: one inter-item delay per pending item plus one inter-batch
/// delay per (partial) batch. An estimate, not a guarantee.
pub fn estimate_remaining(pending: usize, throttle: &Throttle) -> Duration {
    if pending == 0 {
        return Duration::ZERO;
    }
    let batches = pending.div_ceil(throttle.batch_size.max(1));
    let items = throttle
        .inter_item_delay
        .saturating_mul(u32::try_from(pending).unwrap_or(u32::MAX));
    let pauses = throttle
        .inter_batch_delay
        .saturating_mul(u32::try_from(batches).unwrap_or(u32::MAX));
    items.saturating_add(pauses)
}

#[derive(Clone)]
pub struct StatsAggregator {
    queue: DynStageQueue,
    throttle: Throttle,
}

impl StatsAggregator {
    pub fn new(queue: DynStageQueue, throttle: Throttle) -> Self {
        Self { queue, throttle }
    }

    /// Counts straight from the queue, so they always reflect ground truth.
    /// Safe to call concurrently with workers.
    pub async fn get_stats(&self) -> QueueResult<PipelineStats> {
        let c = self.queue.counts().await?;
        let eta = estimate_remaining(c.pending, &self.throttle);

        for stage in Stage::ALL {
            gauge!("pipeline_stage_items", "stage" => stage.as_str()).set(c.get(stage) as f64);
        }
        gauge!("pipeline_estimated_remaining_secs").set(eta.as_secs_f64());

        Ok(PipelineStats {
            pending: c.pending,
            processing: c.processing,
            completed: c.completed,
            error: c.error,
            failed: c.failed,
            estimated_time_remaining_secs: eta.as_secs(),
        })
    }
}
