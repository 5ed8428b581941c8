use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::metrics::metrics_handler;
use super::scheduler_hook;
use super::state::{GuardedJobScheduler, ServerState};

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 500;

#[derive(Serialize)]
struct HealthStatus {
    pub status: &'static str,
    pub uptime: String,
    pub registered_jobs: usize,
}

#[derive(Deserialize, Debug)]
struct HistoryQuery {
    pub limit: Option<usize>,
}

fn format_uptime(duration: Duration) -> String {
    let total_seconds = duration.as_secs();

    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
}

async fn health(State(state): State<ServerState>) -> impl IntoResponse {
    Json(HealthStatus {
        status: "ok",
        uptime: format_uptime(state.start_time.elapsed()),
        registered_jobs: state.scheduler.registry().len(),
    })
}

async fn list_jobs(State(scheduler): State<GuardedJobScheduler>) -> Response {
    match scheduler.list_jobs() {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => {
            error!("Failed to list jobs: {}", e);
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

async fn get_job_history(
    State(scheduler): State<GuardedJobScheduler>,
    Path(name): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    match scheduler.job_history(&name, limit) {
        Ok(Some(runs)) => Json(runs).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!("Failed to read history of job {}: {}", name, e);
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

pub fn make_app(state: ServerState) -> Router {
    let admin_routes: Router = Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/{name}/history", get(get_job_history))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(health))
        .with_state(state.clone())
        .nest("/v1/admin", admin_routes)
        .layer(middleware::from_fn_with_state(state, scheduler_hook))
}

pub fn make_metrics_app() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

pub async fn run_server(state: ServerState, port: u16, metrics_port: u16) -> Result<()> {
    let app = make_app(state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;
    let metrics_listener = TcpListener::bind(format!("0.0.0.0:{}", metrics_port))
        .await
        .with_context(|| format!("Failed to bind metrics port {}", metrics_port))?;

    tokio::spawn(async move {
        if let Err(e) = axum::serve(metrics_listener, make_metrics_app()).await {
            error!("Metrics server stopped: {}", e);
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal");
            }
        })
        .await?;
    Ok(())
}
