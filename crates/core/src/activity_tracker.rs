//! Activity tracker (C4): façade over the append-only activity log and its
//! per-type detail tables. Callers start an activity, do their work, then
//! report completion with whatever detail row applies — the tracker never
//! makes decisions, it only records what happened.

use serde_json::Value;
use sqlx::SqlitePool;
use uuid::Uuid;

use db::models::activity_details::{BadgeApplicationDetail, DetailError, PerformanceMetricDetail, PosterReplacementDetail};
use db::models::media_activity::{ActivityError, ActivityType, InitiatedBy, MediaActivity, StartActivity};

pub struct ActivityTracker {
    pool: SqlitePool,
    system_version: String,
}

impl ActivityTracker {
    pub fn new(pool: SqlitePool, system_version: impl Into<String>) -> Self {
        ActivityTracker { pool, system_version: system_version.into() }
    }

    pub async fn start(&self, data: StartActivity<'_>) -> Result<Uuid, ActivityError> {
        MediaActivity::start(&self.pool, data, &self.system_version).await
    }

    pub async fn complete(&self, id: Uuid, result_data: Option<Value>) -> Result<(), ActivityError> {
        MediaActivity::complete(&self.pool, id, true, result_data, None).await
    }

    pub async fn fail(&self, id: Uuid, error_message: &str) -> Result<(), ActivityError> {
        MediaActivity::fail(&self.pool, id, error_message).await
    }

    pub async fn find(&self, id: Uuid) -> Result<Option<MediaActivity>, ActivityError> {
        MediaActivity::find_by_id(&self.pool, id).await
    }

    pub async fn log_badge_application(&self, detail: &BadgeApplicationDetail) -> Result<(), DetailError> {
        BadgeApplicationDetail::log(&self.pool, detail).await
    }

    pub async fn log_poster_replacement(&self, detail: &PosterReplacementDetail) -> Result<(), DetailError> {
        PosterReplacementDetail::log(&self.pool, detail).await
    }

    pub async fn log_performance_metric(&self, detail: &PerformanceMetricDetail) -> Result<(), DetailError> {
        PerformanceMetricDetail::log(&self.pool, detail).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Convenience constructor for the common case: a badge-application pass
/// kicked off on behalf of a batch job poster.
pub fn batch_poster_activity<'a>(media_id: &'a str, batch_job_id: Uuid, badge_types: Option<Value>) -> StartActivity<'a> {
    StartActivity {
        media_id,
        jellyfin_id: Some(media_id),
        activity_type: ActivityType::BadgeApplication,
        activity_subtype: None,
        initiated_by: InitiatedBy::BatchOperation,
        user_id: None,
        batch_job_id: Some(batch_job_id),
        parent_activity_id: None,
        input_parameters: badge_types,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_then_double_complete_reports_already_completed() {
        use db::models::job::{BadgeType, CreateJob, Job, JobSource};

        let pool = db::DBService::new_in_memory().await.unwrap().pool;
        let job = Job::create(
            &pool,
            CreateJob {
                owner: "alice".into(),
                name: "activity test job".into(),
                source: JobSource::Manual,
                priority: 5,
                selected_poster_ids: vec!["item-1".into()],
                badge_types: vec![BadgeType::Audio],
            },
        )
        .await
        .unwrap();

        let tracker = ActivityTracker::new(pool, "0.1.0-test");
        let id = tracker.start(batch_poster_activity("item-1", job.id, None)).await.unwrap();
        tracker.complete(id, None).await.unwrap();
        let err = tracker.complete(id, None).await.unwrap_err();
        assert!(matches!(err, ActivityError::AlreadyCompleted(_)));
    }
}
