// src/cleanup.rs
//! Retention cleanup: the only place finished items leave the queue for good.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::clock::{Clock, DynClock};
use crate::error::{QueueError, QueueResult};
use crate::item::{Item, Stage};
use crate::queue::{DynStageQueue, StageQueue};

/// Remove `completed`/`error` items last touched more than `retention` ago.
/// Returns the removed items so the caller can archive them.
pub async fn cleanup_finished(
    queue: &dyn StageQueue,
    clock: &dyn Clock,
    stage: Stage,
    retention: Duration,
) -> QueueResult<Vec<Item>> {
    if !stage.is_terminal() {
        return Err(QueueError::Invalid(format!(
            "cleanup only applies to completed/error, not {stage}"
        )));
    }
    // A retention beyond chrono's range keeps everything.
    let cutoff = chrono::Duration::from_std(retention)
        .ok()
        .and_then(|r| clock.now().checked_sub_signed(r))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    let removed = queue.purge(stage, cutoff).await?;
    if !removed.is_empty() {
        tracing::info!(
            target: "queue",
            %stage,
            removed = removed.len(),
            %cutoff,
            "retention cleanup"
        );
    }
    Ok(removed)
}

/// Daily cleanup of both terminal stages on each queue. Wire this from app startup.
pub fn spawn_daily_cleanup_task(
    queues: Vec<DynStageQueue>,
    clock: DynClock,
    retention: Duration,
) -> JoinHandle<()> {
    let period = Duration::from_secs(24 * 3600);
    tokio::spawn(async move {
        loop {
            for q in &queues {
                for stage in [Stage::Completed, Stage::Error] {
                    if let Err(e) =
                        cleanup_finished(q.as_ref(), clock.as_ref(), stage, retention).await
                    {
                        tracing::warn!(
                            target: "queue",
                            %stage,
                            error = %e,
                            "retention cleanup failed"
                        );
                    }
                }
            }
            tokio::time::sleep(period).await;
        }
    })
}
