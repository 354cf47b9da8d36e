//! Pipeline service: binary entrypoint.
//! Opens the stage queues, starts the background workers and serves the
//! stats/control API.

use shuttle_axum::ShuttleAxum;

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();

    feed_pipeline::telemetry::init_tracing();

    let router = feed_pipeline::app().await?;
    Ok(router.into())
}
