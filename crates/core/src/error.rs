use serde::Serialize;
use thiserror::Error;

use crate::media_client::MediaClientError;
use db::models::activity_details::DetailError;
use db::models::job::JobError;
use db::models::media_activity::ActivityError;
use db::models::poster_status::PosterStatusError;
use db::models::schedule::ScheduleError;
use db::models::schedule_execution::ScheduleExecutionError;

/// Stable error kinds, independent of the underlying Rust error types —
/// used for HTTP status mapping and for persisted `error_message` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    ItemMissing,
    PosterMissing,
    UploadVerificationFailed,
    NetworkTransient,
    DispatchFailed,
    TagUpdateFailed,
    ComposerFailed,
    StoreConflict,
    SchedulerCatchUpSkipped,
}

impl ErrorKind {
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::InvalidInput => 400,
            ErrorKind::ItemMissing | ErrorKind::PosterMissing => 404,
            ErrorKind::UploadVerificationFailed | ErrorKind::NetworkTransient => 408,
            ErrorKind::StoreConflict => 409,
            ErrorKind::DispatchFailed
            | ErrorKind::TagUpdateFailed
            | ErrorKind::ComposerFailed
            | ErrorKind::SchedulerCatchUpSkipped => 500,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::NetworkTransient | ErrorKind::UploadVerificationFailed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::ItemMissing => "item_missing",
            ErrorKind::PosterMissing => "poster_missing",
            ErrorKind::UploadVerificationFailed => "upload_verification_failed",
            ErrorKind::NetworkTransient => "network_transient",
            ErrorKind::DispatchFailed => "dispatch_failed",
            ErrorKind::TagUpdateFailed => "tag_update_failed",
            ErrorKind::ComposerFailed => "composer_failed",
            ErrorKind::StoreConflict => "store_conflict",
            ErrorKind::SchedulerCatchUpSkipped => "scheduler_catch_up_skipped",
        }
    }
}

/// Aggregate error for the workflow core. Mirrors the top-level
/// aggregate-error convention of wrapping each component's error type
/// behind `#[from]`.
#[derive(Debug, Error)]
pub enum AphroditeError {
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    PosterStatus(#[from] PosterStatusError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    ScheduleExecution(#[from] ScheduleExecutionError),
    #[error(transparent)]
    Activity(#[from] ActivityError),
    #[error(transparent)]
    Detail(#[from] DetailError),
    #[error(transparent)]
    MediaClient(#[from] MediaClientError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("{kind:?}: {message}")]
    Kind { kind: ErrorKind, message: String },
}

impl AphroditeError {
    /// Collapses the underlying Rust error type into one of the stable
    /// kinds used for HTTP status mapping and persisted error summaries.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AphroditeError::Job(JobError::NotFound(_)) => ErrorKind::ItemMissing,
            AphroditeError::Job(JobError::InvalidTransition(..)) => ErrorKind::StoreConflict,
            AphroditeError::Job(JobError::EmptyPosterList | JobError::UnknownBadgeType(_)) => {
                ErrorKind::InvalidInput
            }
            AphroditeError::Job(JobError::Database(_)) => ErrorKind::DispatchFailed,
            AphroditeError::PosterStatus(PosterStatusError::NotFound(..)) => ErrorKind::PosterMissing,
            AphroditeError::PosterStatus(PosterStatusError::Database(_)) => ErrorKind::DispatchFailed,
            AphroditeError::Schedule(ScheduleError::NotFound(_)) => ErrorKind::ItemMissing,
            AphroditeError::Schedule(ScheduleError::Database(_)) => ErrorKind::DispatchFailed,
            AphroditeError::ScheduleExecution(_) => ErrorKind::DispatchFailed,
            AphroditeError::Activity(_) => ErrorKind::DispatchFailed,
            AphroditeError::Detail(_) => ErrorKind::DispatchFailed,
            AphroditeError::MediaClient(_) => ErrorKind::NetworkTransient,
            AphroditeError::Database(_) => ErrorKind::DispatchFailed,
            AphroditeError::Kind { kind, .. } => *kind,
        }
    }
}
