use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;

use crate::batch::{AddOutcome, BatchProcessor, RetryOutcome};
use crate::error::QueueError;
use crate::producer::{EnqueueOutcome, Producer};
use crate::queue::DynStageQueue;
use crate::recovery::{RecoveryReport, StallRecovery};
use crate::stats::{PipelineStats, StatsAggregator};

#[derive(Clone)]
pub struct AppState {
    pub content: DynStageQueue,
    pub producer: Arc<Producer>,
    pub content_stats: StatsAggregator,
    pub content_recovery: Arc<StallRecovery>,
    pub images: Arc<BatchProcessor>,
    pub image_recovery: Arc<StallRecovery>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/stats", get(stats))
        .route("/enqueue", post(enqueue))
        .route("/batch/enqueue", post(batch_enqueue))
        .route("/batch/retry-failed", post(batch_retry_failed))
        .route("/recover", post(recover))
        .with_state(state)
}

type ApiError = (StatusCode, String);

fn to_api_error(e: QueueError) -> ApiError {
    let status = if e.is_unavailable() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, e.to_string())
}

#[derive(serde::Serialize)]
struct StatsResp {
    content: PipelineStats,
    images: PipelineStats,
}

async fn stats(State(state): State<AppState>) -> Result<Json<StatsResp>, ApiError> {
    let content = state.content_stats.get_stats().await.map_err(to_api_error)?;
    let images = state.images.get_stats().await.map_err(to_api_error)?;
    Ok(Json(StatsResp { content, images }))
}

async fn enqueue(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<EnqueueOutcome>, ApiError> {
    let out = state.producer.enqueue(payload).await.map_err(to_api_error)?;
    Ok(Json(out))
}

async fn batch_enqueue(
    State(state): State<AppState>,
    Json(payloads): Json<Vec<Value>>,
) -> Result<Json<AddOutcome>, ApiError> {
    let out = state
        .images
        .add_to_queue(payloads)
        .await
        .map_err(to_api_error)?;
    Ok(Json(out))
}

async fn batch_retry_failed(
    State(state): State<AppState>,
) -> Result<Json<RetryOutcome>, ApiError> {
    let out = state.images.retry_failed().await.map_err(to_api_error)?;
    Ok(Json(out))
}

#[derive(serde::Serialize)]
struct RecoverResp {
    content_requeued: usize,
    content_errored: usize,
    images_requeued: usize,
    images_errored: usize,
}

async fn recover(State(state): State<AppState>) -> Result<Json<RecoverResp>, ApiError> {
    let c: RecoveryReport = state.content_recovery.run().await.map_err(to_api_error)?;
    let i: RecoveryReport = state.image_recovery.run().await.map_err(to_api_error)?;
    Ok(Json(RecoverResp {
        content_requeued: c.requeued,
        content_errored: c.errored,
        images_requeued: i.requeued,
        images_errored: i.errored,
    }))
}
