// rest/mod.rs — Public REST API server.
//
// Axum HTTP server exposing the trace read path and the monitor API.
//
// Endpoints:
//   GET  /health
//   GET  /api/traces
//   GET  /api/trace
//   GET  /api/traces/export
//   /api/orgs/{org}/projects/{project}/agents/{agent}/monitors…  (see routes::monitors)

pub mod routes;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::AppContext;

pub async fn start_rest_server(
    ctx: Arc<AppContext>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let bind = format!("0.0.0.0:{}", ctx.config.port);
    let addr: SocketAddr = bind.parse()?;

    let router = build_router(ctx);

    info!("REST API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    let monitor_base = "/api/orgs/{org}/projects/{project}/agents/{agent}/monitors";

    Router::new()
        // Health (no auth)
        .route("/health", get(routes::health::health))
        // Trace read path
        .route("/api/traces", get(routes::traces::trace_overviews))
        .route("/api/trace", get(routes::traces::trace_by_id))
        .route("/api/traces/export", get(routes::traces::export_traces))
        // Monitors
        .route(
            monitor_base,
            get(routes::monitors::list_monitors).post(routes::monitors::create_monitor),
        )
        .route(
            &format!("{monitor_base}/{{id}}"),
            get(routes::monitors::get_monitor)
                .put(routes::monitors::update_monitor)
                .delete(routes::monitors::delete_monitor),
        )
        .route(
            &format!("{monitor_base}/{{id}}/start"),
            post(routes::monitors::start_monitor),
        )
        .route(
            &format!("{monitor_base}/{{id}}/stop"),
            post(routes::monitors::stop_monitor),
        )
        .route(
            &format!("{monitor_base}/{{id}}/runs"),
            get(routes::monitors::list_runs),
        )
        .route(
            &format!("{monitor_base}/{{id}}/runs/{{run_id}}/rerun"),
            post(routes::monitors::rerun_run),
        )
        .route(
            &format!("{monitor_base}/{{id}}/runs/{{run_id}}/logs"),
            get(routes::monitors::run_logs),
        )
        .route(
            &format!("{monitor_base}/{{id}}/scores"),
            get(routes::monitors::scores_summary),
        )
        .route(
            &format!("{monitor_base}/{{id}}/scores/series"),
            get(routes::monitors::scores_series),
        )
        .route(
            &format!("{monitor_base}/{{id}}/traces/{{trace_id}}/scores"),
            get(routes::monitors::trace_scores),
        )
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}
