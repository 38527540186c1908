use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub success: bool,
}

async fn ok() -> Result<Json<ControlResponse>, ApiError> {
    Ok(Json(ControlResponse { success: true }))
}

/// `POST /workflow/control/{id}/pause`
pub async fn pause(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<ControlResponse>, ApiError> {
    state.job_manager.pause(id).await?;
    ok().await
}

/// `POST /workflow/control/{id}/resume`
pub async fn resume(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<ControlResponse>, ApiError> {
    state.job_manager.resume(id).await?;
    ok().await
}

/// `POST /workflow/control/{id}/cancel`
pub async fn cancel(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<ControlResponse>, ApiError> {
    state.job_manager.cancel(id).await?;
    ok().await
}

/// `POST /workflow/control/{id}/restart`
pub async fn restart(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<ControlResponse>, ApiError> {
    state.job_manager.restart(id).await?;
    ok().await
}
