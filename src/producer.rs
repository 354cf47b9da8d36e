// src/producer.rs
//! Producer side: dedup against the fingerprint store, then push to `pending`.
//!
//! The two stores are never locked together. The fingerprint is recorded
//! before the push, so a crash (or a store failure) between the two leaves a
//! fingerprint with no queued item. That under-enqueue is accepted; the
//! opposite (flooding the queue with duplicates) is not.

use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::clock::DynClock;
use crate::error::{QueueError, QueueResult};
use crate::fingerprint::{fingerprint, FingerprintStore};
use crate::item::{Item, Stage};
use crate::queue::DynStageQueue;
use crate::telemetry::ensure_metrics_described;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueReason {
    Queued,
    Duplicate,
    /// Fingerprint store was unreachable and the producer runs best-effort.
    QueuedWithoutDedup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnqueueOutcome {
    pub enqueued: bool,
    pub reason: EnqueueReason,
    pub id: String,
}

pub struct Producer {
    queue: DynStageQueue,
    fingerprints: Arc<dyn FingerprintStore>,
    clock: DynClock,
    best_effort: bool,
}

impl Producer {
    pub fn new(
        queue: DynStageQueue,
        fingerprints: Arc<dyn FingerprintStore>,
        clock: DynClock,
    ) -> Self {
        Self {
            queue,
            fingerprints,
            clock,
            best_effort: false,
        }
    }

    /// When the fingerprint store is unavailable, enqueue anyway instead of
    /// failing. Off by default.
    pub fn best_effort(mut self, on: bool) -> Self {
        self.best_effort = on;
        self
    }

    pub async fn enqueue(&self, payload: Value) -> QueueResult<EnqueueOutcome> {
        ensure_metrics_described();
        let fp = fingerprint(&payload);

        let reason = match self.fingerprints.insert(&fp).await {
            Ok(true) => EnqueueReason::Queued,
            // Present already, either long ago or from a concurrent producer.
            Ok(false) => {
                counter!("pipeline_duplicates_total").increment(1);
                tracing::debug!(target: "producer", id = %fp, "duplicate suppressed");
                return Ok(EnqueueOutcome {
                    enqueued: false,
                    reason: EnqueueReason::Duplicate,
                    id: fp,
                });
            }
            Err(e) if self.best_effort && e.is_unavailable() => {
                tracing::warn!(
                    target: "producer",
                    id = %fp,
                    error = %e,
                    "fingerprint store unavailable; enqueueing without dedup"
                );
                EnqueueReason::QueuedWithoutDedup
            }
            Err(e) => return Err(e),
        };

        let item = Item::new(fp.clone(), payload, self.clock.now());
        match self.queue.push(Stage::Pending, item).await {
            Ok(()) => {}
            // Same id already sits in some stage; only reachable when the
            // fingerprint store did not catch it.
            Err(QueueError::Invalid(_)) => {
                counter!("pipeline_duplicates_total").increment(1);
                return Ok(EnqueueOutcome {
                    enqueued: false,
                    reason: EnqueueReason::Duplicate,
                    id: fp,
                });
            }
            Err(e) => return Err(e),
        }
        counter!("pipeline_enqueued_total").increment(1);
        tracing::info!(target: "producer", id = %fp, ?reason, "item enqueued");

        Ok(EnqueueOutcome {
            enqueued: true,
            reason,
            id: fp,
        })
    }
}
