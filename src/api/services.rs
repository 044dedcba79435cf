use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use http_body_util::BodyExt;
use std::collections::HashMap;

use super::{
    error::ApiError,
    models::{
        CreateTaskRequest, HealthResponse, ListParams, MetricsResponse, NetworkResponse,
        NetworkUpdate, PurgeRequest, PurgeResponse, TaskAcceptedResponse, TaskListResponse,
        TaskView,
    },
    state::AppState,
    utils::{clamp_limit, parse_content_type, parse_status_filter, validate_body_size},
    validation::validate_create,
};
use crate::store::ListQuery;

const MAX_PAYLOAD_SIZE: usize = 256 * 1024;

/// Task submission endpoint (POST /tasks)
///
/// Validates the body, persists a queued task and wakes the scheduler.
/// Returns 202 with the new task id; the transfer itself runs later.
pub async fn create_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Body,
) -> Result<impl IntoResponse, ApiError> {
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::InvalidPayload("missing Content-Type header".into()))?;
    parse_content_type(content_type)?;

    let body_bytes = read_body(body).await?;
    let request: CreateTaskRequest = serde_json::from_slice(&body_bytes)?;
    validate_create(&request).map_err(|e| ApiError::InvalidPayload(e.to_string()))?;

    let task_id = state.manager.enqueue(request.into())?;

    Ok((StatusCode::ACCEPTED, Json(TaskAcceptedResponse { task_id })))
}

async fn read_body(body: axum::body::Body) -> Result<Vec<u8>, ApiError> {
    let data = body
        .collect()
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
        .to_bytes()
        .to_vec();

    validate_body_size(&data, MAX_PAYLOAD_SIZE)?;

    Ok(data)
}

/// GET /tasks?status=&limit=
///
/// Priority order (high first), then oldest first.
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let query = ListQuery {
        status: parse_status_filter(params.status.as_deref())?,
        limit: Some(clamp_limit(params.limit)),
    };
    let tasks = state.manager.list(&query)?;
    Ok(Json(TaskListResponse::new(tasks)))
}

/// GET /tasks/{id}
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.manager.get(&id)?;
    Ok(Json(TaskView::from(task)))
}

/// DELETE /tasks/{id}
pub async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.manager.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /tasks/{id}/pause
pub async fn pause_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.manager.pause(&id).await?;
    Ok(Json(TaskView::from(task)))
}

/// POST /tasks/{id}/resume
pub async fn resume_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.manager.resume(&id)?;
    Ok(Json(TaskView::from(task)))
}

/// POST /tasks/{id}/cancel
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.manager.cancel(&id).await?;
    Ok(Json(TaskView::from(task)))
}

/// POST /tasks/{id}/retry
pub async fn retry_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.manager.retry(&id)?;
    Ok(Json(TaskView::from(task)))
}

/// GET /contents/{identifier}/tasks
pub async fn content_tasks(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let tasks = state.manager.list_by_content(&identifier)?;
    Ok(Json(TaskListResponse::new(tasks)))
}

/// PUT /network
pub async fn set_network(
    State(state): State<AppState>,
    Json(update): Json<NetworkUpdate>,
) -> impl IntoResponse {
    let changed = state.manager.set_network(update.link);
    Json(NetworkResponse {
        link: update.link,
        changed,
    })
}

/// POST /events/foreground
///
/// The host app came to the foreground: run a scheduling pass now instead
/// of waiting for the next tick.
pub async fn foreground(State(state): State<AppState>) -> impl IntoResponse {
    state.manager.wake();
    StatusCode::ACCEPTED
}

/// POST /maintenance/purge?older_than_days=
pub async fn purge(
    State(state): State<AppState>,
    Query(request): Query<PurgeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let max_age = match request.older_than_days {
        Some(days) => chrono::Duration::days(i64::from(days)),
        None => state.config.retention.completed_ttl(),
    };
    let purged = state.manager.purge_completed(max_age)?;
    Ok(Json(PurgeResponse { purged }))
}

/// GET /metrics
pub async fn metrics(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let stats = state.manager.stats()?;
    Ok(Json(MetricsResponse {
        counters: state.manager.metrics(),
        tasks: stats.counts,
        active_workers: state.manager.active_workers(),
        worker_capacity: state.manager.worker_capacity(),
        link: state.manager.network(),
    }))
}

/// Health check endpoint (GET /health)
///
/// Reports the store as unhealthy when it cannot be read; returns 503 then.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let mut components = HashMap::new();
    components.insert("api".to_string(), "healthy".to_string());

    let store_status = match state.manager.stats() {
        Ok(_) => "healthy".to_string(),
        Err(e) => {
            tracing::warn!(error = %e, "Store health check failed");
            "unhealthy".to_string()
        }
    };
    components.insert("store".to_string(), store_status);
    components.insert(
        "workers".to_string(),
        format!(
            "{}/{} busy",
            state.manager.active_workers(),
            state.manager.worker_capacity()
        ),
    );

    let healthy = components.get("store").is_some_and(|s| s == "healthy");
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        components,
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    (status_code, Json(response))
}
