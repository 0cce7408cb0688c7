//! JSON API over the sync pipeline: source listing, latest-update lookup and
//! on-demand source runs.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use isync_sync::SyncPipeline;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info};

pub const CRATE_NAME: &str = "isync-web";

#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<SyncPipeline>,
    // One on-demand source run at a time.
    run_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self {
            pipeline,
            run_lock: Arc::new(Mutex::new(())),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceRow {
    pub source_id: String,
    pub kind: String,
    pub table: String,
    pub partitions: Vec<Option<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatestUpdate {
    pub source_id: String,
    pub table: String,
    pub partition: Option<String>,
    pub sync_point: &'static str,
    pub latest_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Default)]
struct LatestUpdateQuery {
    partition: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/sources", get(sources_handler))
        .route("/api/sources/{id}/latest-update", get(latest_update_handler))
        .route("/api/sources/{id}/sync", post(sync_source_handler))
        .with_state(state)
}

pub async fn serve(pipeline: Arc<SyncPipeline>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving sync api");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "service": CRATE_NAME }))
}

async fn sources_handler(State(state): State<AppState>) -> Json<Vec<SourceRow>> {
    let rows = state
        .pipeline
        .adapters()
        .map(|adapter| SourceRow {
            source_id: adapter.source_id().to_string(),
            kind: adapter.kind().to_string(),
            table: adapter.table().name().to_string(),
            partitions: adapter.partitions(),
        })
        .collect();
    Json(rows)
}

async fn latest_update_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LatestUpdateQuery>,
) -> Response {
    let Some(adapter) = state.pipeline.adapter(&id) else {
        return not_found(&id);
    };
    let table = adapter.table().name().to_string();
    match state.pipeline.sync_point(&id, query.partition.as_deref()).await {
        Ok(point) => Json(LatestUpdate {
            source_id: id,
            table,
            partition: query.partition,
            sync_point: point.label(),
            latest_update: point.since(),
        })
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn sync_source_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if state.pipeline.adapter(&id).is_none() {
        return not_found(&id);
    }
    let _guard = state.run_lock.lock().await;
    match state.pipeline.run_source(&id).await {
        Ok(summary) => {
            let status = if summary.is_success() {
                StatusCode::OK
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (status, Json(summary)).into_response()
        }
        Err(err) => server_error(err),
    }
}

fn not_found(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("unknown source {id}") })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = ?err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}
