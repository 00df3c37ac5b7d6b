use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use remedy_core::{
    types::ErrorStatus,
    updater::UpdateRequest,
};

use crate::AppState;

// ── Error helper ──────────────────────────────────────────────────────────

pub(crate) fn internal(e: impl std::fmt::Display) -> StatusCode {
    tracing::error!("internal error: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

// ── Request/query types ───────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct ErrorsQuery {
    pub status: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct UpdateBody {
    pub modules: Vec<String>,
    #[serde(default = "default_backup")]
    pub backup_before: bool,
}

fn default_backup() -> bool {
    true
}

// ── Health ────────────────────────────────────────────────────────────────

pub(crate) async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// ── Errors ────────────────────────────────────────────────────────────────

pub(crate) async fn list_errors(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ErrorsQuery>,
) -> Result<Json<Value>, StatusCode> {
    let status = q.status.as_deref().map(ErrorStatus::from_str);
    let errors = state.db.list_errors(status).map_err(internal)?;
    Ok(Json(json!(errors)))
}

pub(crate) async fn get_error(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let error = state
        .db
        .get_error(&id)
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    let attempts = state.db.list_attempts(&id).map_err(internal)?;
    Ok(Json(json!({
        "error": error,
        "attempts": attempts,
    })))
}

pub(crate) async fn retry_error(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let accepted = state.engine.retry(&id).await.map_err(internal)?;
    if !accepted {
        return Err(StatusCode::CONFLICT);
    }
    Ok(Json(json!({ "queued": true })))
}

pub(crate) async fn ignore_error(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let accepted = state.engine.ignore(&id).await.map_err(internal)?;
    if !accepted {
        return Err(StatusCode::CONFLICT);
    }
    Ok(Json(json!({ "ignored": true })))
}

// ── Status ────────────────────────────────────────────────────────────────

pub(crate) async fn get_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, StatusCode> {
    let counts = state.db.status_counts().map_err(internal)?;
    let mut by_status = serde_json::Map::new();
    for (status, count) in counts {
        by_status.insert(status, json!(count));
    }
    Ok(Json(json!({
        "uptime_s": state.start_time.elapsed().as_secs(),
        "active_fixes": state.engine.active_fix_count().await,
        "updating": state.updater.is_updating(),
        "errors": Value::Object(by_status),
    })))
}

// ── Snapshots ─────────────────────────────────────────────────────────────

pub(crate) async fn list_snapshots(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, StatusCode> {
    let snapshots = state.db.list_snapshots().map_err(internal)?;
    Ok(Json(json!(snapshots)))
}

// ── Module updates ────────────────────────────────────────────────────────

pub(crate) async fn trigger_update(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UpdateBody>,
) -> Result<Json<Value>, StatusCode> {
    if body.modules.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let outcome = state
        .updater
        .update_modules(UpdateRequest {
            modules: body.modules,
            backup_before: body.backup_before,
        })
        .await;
    Ok(Json(json!(outcome)))
}

// ── SSE: engine transition events ─────────────────────────────────────────

pub(crate) async fn sse_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let rx = state.event_tx.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|event| {
        event
            .ok()
            .and_then(|e| serde_json::to_string(&e).ok())
            .map(|data| Ok(Event::default().data(data)))
    });
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("ping"),
    )
}

// ── SSE: process logs — replays ring buffer history then streams live ─────

pub(crate) async fn sse_logs(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let history: Vec<String> = state
        .log_ring
        .lock()
        .map(|ring| ring.iter().cloned().collect())
        .unwrap_or_default();
    let rx = state.log_tx.subscribe();

    let replay = tokio_stream::iter(history.into_iter().map(|data| Ok(Event::default().data(data))));
    let live = BroadcastStream::new(rx)
        .filter_map(|msg| msg.ok().map(|data| Ok(Event::default().data(data))));

    Sse::new(replay.chain(live)).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("ping"),
    )
}
