use crate::config::{ConfigPatch, MonitorConfig};
use crate::monitor::{HistoryEntry, Monitor, MonitorError};
use crate::snapshot::MetricKind;
use crate::store::StoreError;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

const DEFAULT_LOG_LINES: u32 = 100;

#[derive(Debug, Clone, Serialize)]
pub struct ApiStatus {
    pub running: bool,
    pub config: MonitorConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<usize>,
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsParams {
    pub app: Option<String>,
    pub lines: Option<u32>,
}

pub fn build_router(monitor: Monitor) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/status", get(status_handler))
        .route("/api/config", get(config_handler).put(update_config_handler))
        .route("/api/latest", get(latest_handler))
        .route("/api/history/:kind", get(history_handler))
        .route("/api/current/:kind", get(current_handler))
        .route("/api/processmanager/logs", get(logs_handler))
        .with_state(monitor)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn status_handler(State(monitor): State<Monitor>) -> impl IntoResponse {
    Json(ApiStatus {
        running: monitor.is_running(),
        config: monitor.config().await,
    })
}

async fn config_handler(State(monitor): State<Monitor>) -> impl IntoResponse {
    Json(monitor.config().await)
}

async fn update_config_handler(
    State(monitor): State<Monitor>,
    Json(patch): Json<ConfigPatch>,
) -> Response {
    match monitor.update_config(patch).await {
        Ok(config) => Json(config).into_response(),
        Err(MonitorError::Config(err)) => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
        Err(err) => monitor_error(err),
    }
}

async fn latest_handler(State(monitor): State<Monitor>) -> Response {
    match monitor.latest().await {
        Ok(latest) => Json(latest).into_response(),
        Err(err) => monitor_error(err),
    }
}

async fn history_handler(
    State(monitor): State<Monitor>,
    Path(kind): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Response {
    let kind = match kind.parse::<MetricKind>() {
        Ok(kind) => kind,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };
    let from = match parse_bound("from", params.from.as_deref()) {
        Ok(from) => from,
        Err(response) => return response,
    };
    let to = match parse_bound("to", params.to.as_deref()) {
        Ok(to) => to,
        Err(response) => return response,
    };

    match monitor.history(kind, params.limit, from, to).await {
        Ok(entries) => Json::<Vec<HistoryEntry>>(entries).into_response(),
        Err(err) => monitor_error(err),
    }
}

async fn current_handler(State(monitor): State<Monitor>, Path(kind): Path<String>) -> Response {
    match kind.parse::<MetricKind>() {
        Ok(kind) => Json(monitor.current(kind).await).into_response(),
        Err(err) => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    }
}

async fn logs_handler(
    State(monitor): State<Monitor>,
    Query(params): Query<LogsParams>,
) -> impl IntoResponse {
    let lines = params.lines.unwrap_or(DEFAULT_LOG_LINES);
    monitor
        .process_manager_logs(params.app.as_deref(), lines)
        .await
}

fn parse_bound(name: &str, value: Option<&str>) -> Result<Option<SystemTime>, Response> {
    let Some(value) = value.filter(|v| !v.trim().is_empty()) else {
        return Ok(None);
    };
    humantime::parse_rfc3339_weak(value.trim())
        .map(Some)
        .map_err(|err| {
            (
                StatusCode::BAD_REQUEST,
                format!("параметр {name} должен быть временем RFC 3339: {err}"),
            )
                .into_response()
        })
}

fn monitor_error(err: MonitorError) -> Response {
    let status = match &err {
        MonitorError::Store(StoreError::NotInitialized) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string()).into_response()
}
