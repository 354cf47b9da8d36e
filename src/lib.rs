// src/lib.rs
// Public library surface for the service binary and integration tests.

pub mod api;
pub mod batch;
pub mod cleanup;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fingerprint;
pub mod generate;
pub mod item;
pub mod producer;
pub mod queue;
pub mod recovery;
pub mod stats;
pub mod telemetry;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::batch::{AddOutcome, BatchOutcome, BatchProcessor, RetryOutcome};
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::dispatcher::{StageHandler, WorkDispatcher};
pub use crate::error::{QueueError, QueueResult};
pub use crate::item::{Item, Stage};
pub use crate::producer::{EnqueueOutcome, EnqueueReason, Producer};
pub use crate::queue::{FileStageQueue, MemoryStageQueue, StageQueue};
pub use crate::recovery::StallRecovery;
pub use crate::stats::{PipelineStats, StatsAggregator};

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tracing::{info, warn};

use crate::clock::DynClock;
use crate::config::PipelineConfig;
use crate::fingerprint::FileFingerprintStore;
use crate::generate::{DisabledGenerator, Generator, HttpGenerator};
use crate::queue::DynStageQueue;
use crate::stats::Throttle;
use crate::telemetry::Metrics;

/// Open the file-backed stores under `cfg.state_dir` and wire the components.
pub async fn build_state(cfg: &PipelineConfig, clock: DynClock) -> anyhow::Result<api::AppState> {
    let content: DynStageQueue = Arc::new(
        FileStageQueue::open(cfg.content_queue_path())
            .await
            .context("opening content queue")?,
    );
    let images: DynStageQueue = Arc::new(
        FileStageQueue::open(cfg.image_queue_path())
            .await
            .context("opening image queue")?,
    );
    let fingerprints = Arc::new(
        FileFingerprintStore::open(cfg.fingerprints_path())
            .await
            .context("opening fingerprint store")?,
    );

    let generator: Arc<dyn Generator> = match HttpGenerator::from_config(&cfg.generator)? {
        Some(g) => Arc::new(g),
        None => Arc::new(DisabledGenerator),
    };

    let producer = Producer::new(content.clone(), fingerprints, clock.clone())
        .best_effort(cfg.best_effort_dedup);
    let recovery = |q: &DynStageQueue| {
        Arc::new(StallRecovery::new(
            q.clone(),
            clock.clone(),
            cfg.dispatch.max_processing_age(),
            cfg.dispatch.max_attempts,
        ))
    };

    Ok(api::AppState {
        content: content.clone(),
        producer: Arc::new(producer),
        // Nothing throttles the content queue, so it gets no delay-based estimate.
        content_stats: StatsAggregator::new(content.clone(), Throttle::unthrottled()),
        content_recovery: recovery(&content),
        image_recovery: recovery(&images),
        images: Arc::new(BatchProcessor::new(
            images,
            generator,
            clock.clone(),
            cfg.batch.clone(),
        )),
    })
}

/// Build the full service: stores, background tasks and the HTTP router.
///
/// Spawns stall recovery for both queues, daily retention cleanup, and the
/// batch worker when a generator endpoint is configured.
pub async fn app() -> anyhow::Result<Router> {
    app_from_config(config::load_config_default()?).await
}

pub async fn app_from_config(cfg: PipelineConfig) -> anyhow::Result<Router> {
    let clock: DynClock = Arc::new(SystemClock);
    let state = build_state(&cfg, clock.clone()).await?;

    // Recorder first: the background tasks describe metrics on their first run.
    let metrics = match Metrics::init() {
        Ok(m) => Some(m),
        Err(e) => {
            warn!(error = %e, "prometheus recorder not installed; /metrics disabled");
            None
        }
    };

    let interval = cfg.dispatch.recovery_interval();
    recovery::spawn_recovery_task(state.content_recovery.clone(), interval);
    recovery::spawn_recovery_task(state.image_recovery.clone(), interval);
    cleanup::spawn_daily_cleanup_task(
        vec![state.content.clone(), state.images.queue().clone()],
        clock,
        cfg.retention.retention(),
    );

    let has_generator = cfg
        .generator
        .endpoint
        .as_deref()
        .is_some_and(|e| !e.trim().is_empty());
    if has_generator {
        batch::spawn_batch_worker(state.images.clone());
    } else {
        warn!("no generator endpoint configured; batch worker not started");
    }

    let mut router = api::router(state);
    if let Some(m) = metrics {
        router = router.merge(m.router());
    }

    info!(state_dir = %cfg.state_dir.display(), "pipeline service ready");
    Ok(router)
}
