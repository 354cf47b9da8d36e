// src/telemetry.rs
//! Tracing setup, metric descriptions and the Prometheus `/metrics` route.

use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// One-time metrics registration (so series show up on /metrics).
pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("pipeline_enqueued_total", "Items accepted by producers.");
        describe_counter!(
            "pipeline_duplicates_total",
            "Enqueue attempts suppressed by fingerprint dedup."
        );
        describe_counter!("pipeline_claims_total", "Items claimed out of pending.");
        describe_counter!("pipeline_completed_total", "Items moved to completed.");
        describe_counter!("pipeline_errors_total", "Items moved to error.");
        describe_counter!(
            "pipeline_stalls_recovered_total",
            "Stalled claims moved back to pending."
        );
        describe_counter!(
            "pipeline_generation_success_total",
            "Successful calls to the generation API."
        );
        describe_counter!(
            "pipeline_generation_failed_total",
            "Failed calls to the generation API."
        );
        describe_gauge!("pipeline_stage_items", "Items per stage at last stats read.");
        describe_gauge!(
            "pipeline_estimated_remaining_secs",
            "Estimated seconds to drain pending at the configured throttle."
        );
    });
}

/// Install the global tracing subscriber.
///
/// Filter comes from `RUST_LOG` (default `feed_pipeline=info,warn`);
/// `LOG_FORMAT=json` switches to JSON lines. Calling twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("feed_pipeline=info,warn"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let res = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .try_init()
    };
    if res.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder.
    pub fn init() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder()?;
        ensure_metrics_described();
        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
