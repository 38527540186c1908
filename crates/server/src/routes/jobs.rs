use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use aphrodite_core::progress_bus::ProgressEvent;
use db::models::job::{BadgeType, Job, JobSource, JobStatus};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct BatchJobRequest {
    pub owner: String,
    pub name: String,
    pub priority: Option<i64>,
    pub poster_ids: Vec<String>,
    pub badge_types: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct BatchJobResponse {
    pub jobs: Vec<Job>,
}

/// `POST /workflow/jobs/batch` — the manual submission entry point. Splits
/// and dispatches through the job manager; never touches the pool or the
/// pipeline directly.
pub async fn submit_batch(
    State(state): State<AppState>,
    Json(body): Json<BatchJobRequest>,
) -> Result<Json<BatchJobResponse>, ApiError> {
    if body.poster_ids.is_empty() {
        return Err(ApiError::BadRequest("poster_ids must not be empty".into()));
    }
    let badge_types: Vec<BadgeType> = body
        .badge_types
        .iter()
        .filter_map(|s| BadgeType::from_str(s))
        .collect();
    if badge_types.is_empty() {
        return Err(ApiError::BadRequest("badge_types must contain at least one recognized badge type".into()));
    }

    let jobs = state
        .job_manager
        .create_and_dispatch(aphrodite_core::job_manager::BatchRequest {
            owner: body.owner,
            name: body.name,
            source: JobSource::Manual,
            priority: body.priority,
            poster_ids: body.poster_ids,
            badge_types,
        })
        .await?;

    Ok(Json(BatchJobResponse { jobs }))
}

/// `GET /workflow/jobs/{id}`
pub async fn get_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Job>, ApiError> {
    let job = state.job_manager.get(id).await?.ok_or_else(|| ApiError::NotFound(format!("job {id} not found")))?;
    Ok(Json(job))
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub owner: String,
    pub status: Option<String>,
}

/// `GET /workflow/jobs?owner=&status=`
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let status = match query.status {
        Some(s) => Some(JobStatus::from_str(&s).ok_or_else(|| ApiError::BadRequest(format!("unknown status {s:?}")))?),
        None => None,
    };
    let jobs = state.job_manager.list_for_owner(&query.owner, status).await?;
    Ok(Json(jobs))
}

#[derive(Debug, Serialize)]
pub struct BroadcastAck {
    pub delivered: bool,
}

/// `POST /workflow/jobs/broadcast-progress/{id}` — worker-facing. Re-reads
/// the job's stored counters and republishes them on the bus; used when a
/// worker process has no direct `ProgressBus` handle of its own.
pub async fn broadcast_progress(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<BroadcastAck>, ApiError> {
    let job = state.job_manager.get(id).await?.ok_or_else(|| ApiError::NotFound(format!("job {id} not found")))?;
    state
        .progress_bus
        .publish(ProgressEvent {
            job_id: id,
            total_posters: job.total_posters,
            completed_posters: job.completed_posters,
            failed_posters: job.failed_posters,
            current_poster_id: None,
            timestamp: chrono::Utc::now(),
        })
        .await;
    Ok(Json(BroadcastAck { delivered: true }))
}
