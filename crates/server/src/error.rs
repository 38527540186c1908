use axum::{Json, http::StatusCode, response::{IntoResponse, Response}};
use serde::Serialize;
use thiserror::Error;

use aphrodite_core::{AphroditeError, ErrorKind};
use db::models::job::JobError;
use db::models::schedule::ScheduleError;
use db::models::schedule_execution::ScheduleExecutionError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Aphrodite(#[from] AphroditeError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    ScheduleExecution(#[from] ScheduleExecutionError),
    #[error(transparent)]
    JobManager(#[from] aphrodite_core::job_manager::JobManagerError),
    #[error(transparent)]
    Scheduler(#[from] aphrodite_core::scheduler::SchedulerError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    MediaClient(#[from] aphrodite_core::media_client::MediaClientError),
    #[error(transparent)]
    Analytics(#[from] aphrodite_core::analytics::AnalyticsError),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
}

#[derive(Debug, Serialize)]
struct ApiResponse {
    success: bool,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Aphrodite(e) => status_for_kind(e.kind()),
            ApiError::Job(JobError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Job(JobError::InvalidTransition(..)) => StatusCode::CONFLICT,
            ApiError::Job(JobError::EmptyPosterList | JobError::UnknownBadgeType(_)) => StatusCode::BAD_REQUEST,
            ApiError::Job(JobError::Database(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Schedule(ScheduleError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Schedule(ScheduleError::Database(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ScheduleExecution(ScheduleExecutionError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::ScheduleExecution(ScheduleExecutionError::Database(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::JobManager(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Scheduler(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::MediaClient(aphrodite_core::media_client::MediaClientError::ItemNotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::MediaClient(e) if e.is_retryable() => StatusCode::REQUEST_TIMEOUT,
            ApiError::MediaClient(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Analytics(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
        };

        (status, Json(ApiResponse { success: false, message: self.to_string() })).into_response()
    }
}

/// Maps an [`ErrorKind`] to its HTTP status per the kind table, rather than
/// re-deriving status from the wrapped Rust error type.
fn status_for_kind(kind: ErrorKind) -> StatusCode {
    StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}
