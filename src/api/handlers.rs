//! Control-plane HTTP handlers.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, instrument};

use crate::session::{CreateSessionRequest, CreateSessionResponse, SessionRecord, SessionStats};

use super::error::{ApiError, ApiResult};
use super::state::{AppState, SERVICE_NAME};

/// Body for delete acknowledgements.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

/// Health probe.
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
    }))
}

/// Create a new session.
#[instrument(skip(state, request), fields(user_id = %request.user_id))]
pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<CreateSessionResponse>)> {
    if request.user_id.trim().is_empty() {
        return Err(ApiError::bad_request("user_id is required"));
    }

    let response = state.engine.create_session(request).await?;
    info!(session_id = %response.session_id, "created session");
    Ok((StatusCode::CREATED, Json(response)))
}

/// Get a session by id.
#[instrument(skip(state))]
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionRecord>> {
    match state.engine.get_session(&session_id).await? {
        Some(record) => Ok(Json(record)),
        None => Err(ApiError::not_found(format!(
            "session {session_id} not found"
        ))),
    }
}

/// List all sessions. Always a JSON array, never null.
#[instrument(skip(state))]
pub async fn list_sessions(State(state): State<AppState>) -> ApiResult<Json<Vec<SessionRecord>>> {
    let sessions = state.engine.list_sessions().await?;
    Ok(Json(sessions))
}

/// Session counters.
#[instrument(skip(state))]
pub async fn session_stats(State(state): State<AppState>) -> ApiResult<Json<SessionStats>> {
    let stats = state.engine.session_stats().await?;
    Ok(Json(stats))
}

/// Delete one session.
#[instrument(skip(state))]
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<MessageResponse>> {
    state.engine.delete_session(&session_id).await?;
    info!(session_id = %session_id, "deleted session");
    Ok(Json(MessageResponse {
        message: "session deleted".to_string(),
    }))
}

/// Delete every session.
#[instrument(skip(state))]
pub async fn delete_all_sessions(
    State(state): State<AppState>,
) -> ApiResult<Json<MessageResponse>> {
    let deleted = state.engine.delete_all_sessions().await?;
    info!(deleted, "deleted all sessions");
    Ok(Json(MessageResponse {
        message: format!("all sessions deleted ({deleted})"),
    }))
}

/// All MIG slices with their allocation state.
#[instrument(skip(state))]
pub async fn list_gpus(State(state): State<AppState>) -> Json<Value> {
    let gpus = state.engine.gpu_snapshot();
    let count = gpus.len();
    Json(json!({
        "gpus": gpus,
        "count": count,
    }))
}

/// The supported MIG profile catalog.
#[instrument(skip(state))]
pub async fn list_profiles(State(state): State<AppState>) -> Json<Value> {
    let profiles = state.engine.profiles();
    Json(json!({
        "profiles": profiles,
    }))
}

/// The currently free MIG slices.
#[instrument(skip(state))]
pub async fn list_available_gpus(State(state): State<AppState>) -> Json<Value> {
    let available = state.engine.gpu_snapshot_free();
    let count = available.len();
    Json(json!({
        "available_instances": available,
        "count": count,
    }))
}
