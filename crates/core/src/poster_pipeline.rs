//! Poster pipeline (C5): the seven-stage per-poster workflow — resolve,
//! download, detect, compose, upload, tag, record — run once per poster id
//! in a job. Each stage's failure mode determines whether the caller should
//! retry the poster or give up on it immediately.

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use uuid::Uuid;

use crate::activity_tracker::ActivityTracker;
use crate::detectors::{CachedDetectors, DetectorError, PosterComposer};
use crate::media_client::{MediaClientError, MediaServerClient};
use db::models::activity_details::{BadgeApplicationDetail, PerBadgeResult, PerformanceMetricDetail};
use db::models::job::BadgeType;
use db::models::media_activity::{ActivityType, InitiatedBy, StartActivity};

pub const OVERLAY_TAG: &str = "aphrodite-overlay";

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("item missing: {0}")]
    ItemMissing(String),
    #[error("poster missing: {0}")]
    PosterMissing(String),
    #[error("{0}")]
    NetworkTransient(String),
    #[error("upload verification failed: {0}")]
    UploadVerificationFailed(String),
    #[error("tag update failed: {0}")]
    TagUpdateFailed(String),
    #[error("composer failed: {0}")]
    ComposerFailed(String),
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::NetworkTransient(_) | PipelineError::UploadVerificationFailed(_))
    }
}

impl From<MediaClientError> for PipelineError {
    fn from(e: MediaClientError) -> Self {
        match e {
            MediaClientError::ItemNotFound(id) => PipelineError::ItemMissing(id),
            MediaClientError::PosterMissing(id) => PipelineError::PosterMissing(id),
            MediaClientError::UploadVerificationFailed(id) => PipelineError::UploadVerificationFailed(id),
            other if other.is_retryable() => PipelineError::NetworkTransient(other.to_string()),
            other => PipelineError::TagUpdateFailed(other.to_string()),
        }
    }
}

impl From<DetectorError> for PipelineError {
    fn from(e: DetectorError) -> Self {
        PipelineError::ComposerFailed(e.to_string())
    }
}

#[derive(Debug)]
pub struct PipelineOutcome {
    pub output_path: Option<String>,
    /// Set when stage 6 (tag) failed. Non-fatal: the poster already
    /// uploaded successfully, so this is surfaced for visibility rather
    /// than turned into an `Err`.
    pub tag_warning: Option<String>,
}

/// Stateless worker for a single poster's run through the pipeline. Holds
/// no job-specific state so one instance serves every poster in a batch.
pub struct PosterPipeline {
    client: Arc<dyn MediaServerClient>,
    detectors: Arc<CachedDetectors>,
    composer: Arc<dyn PosterComposer>,
    tracker: Arc<ActivityTracker>,
}

impl PosterPipeline {
    pub fn new(
        client: Arc<dyn MediaServerClient>,
        detectors: Arc<CachedDetectors>,
        composer: Arc<dyn PosterComposer>,
        tracker: Arc<ActivityTracker>,
    ) -> Self {
        PosterPipeline { client, detectors, composer, tracker }
    }

    pub async fn run(
        &self,
        poster_id: &str,
        badge_types: &[BadgeType],
        batch_job_id: Uuid,
    ) -> Result<PipelineOutcome, PipelineError> {
        let activity_id = self
            .tracker
            .start(StartActivity {
                media_id: poster_id,
                jellyfin_id: Some(poster_id),
                activity_type: ActivityType::BadgeApplication,
                activity_subtype: None,
                initiated_by: InitiatedBy::BatchOperation,
                user_id: None,
                batch_job_id: Some(batch_job_id),
                parent_activity_id: None,
                input_parameters: Some(json!({ "badge_types": badge_types })),
            })
            .await
            .map_err(|e| PipelineError::TagUpdateFailed(e.to_string()))?;

        match self.run_stages(poster_id, badge_types, activity_id).await {
            Ok(outcome) => {
                let result_data = json!({ "output_path": outcome.output_path, "tag_warning": outcome.tag_warning });
                let _ = self.tracker.complete(activity_id, Some(result_data)).await;
                Ok(outcome)
            }
            Err(e) => {
                let _ = self.tracker.fail(activity_id, &e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn run_stages(
        &self,
        poster_id: &str,
        badge_types: &[BadgeType],
        activity_id: Uuid,
    ) -> Result<PipelineOutcome, PipelineError> {
        let pipeline_started = Instant::now();

        // 1. resolve — fetch the item so we know it exists and can be badged.
        let stage_started = Instant::now();
        let item = self.client.get_item(poster_id).await?;
        let resolve_ms = stage_started.elapsed().as_millis() as i64;

        // 2. download — fetch the current primary image.
        let stage_started = Instant::now();
        let original = self.client.download_poster(poster_id).await?;
        let download_ms = stage_started.elapsed().as_millis() as i64;

        // 3. detect — gather the facts each requested badge type needs.
        let stage_started = Instant::now();
        let facts = self.detectors.facts_for(&item).await?;
        let detect_ms = stage_started.elapsed().as_millis() as i64;

        // 4. compose — render the overlay onto the original image.
        let stage_started = Instant::now();
        let composed = self.composer.compose(&original, &facts).await?;
        let compose_ms = stage_started.elapsed().as_millis() as i64;

        // 5. upload — push the composited image back, verified by the client.
        let stage_started = Instant::now();
        self.client.upload_poster(poster_id, &composed).await?;
        let upload_ms = stage_started.elapsed().as_millis() as i64;

        // 6. tag — mark the item so a future scan can tell it was already
        // badged. Non-fatal: the poster already uploaded, so a tagging
        // hiccup is recorded rather than failing the whole poster.
        let stage_started = Instant::now();
        let tag_warning = match self.client.add_tag(poster_id, OVERLAY_TAG).await {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!("tag update failed for poster {poster_id}: {e}");
                Some(e.to_string())
            }
        };
        let tag_ms = stage_started.elapsed().as_millis() as i64;

        let stage_timings = json!({
            "resolve_ms": resolve_ms,
            "download_ms": download_ms,
            "detect_ms": detect_ms,
            "compose_ms": compose_ms,
            "upload_ms": upload_ms,
            "tag_ms": tag_ms,
        });

        // 7. record — persist a detail row describing what happened.
        let per_badge = badge_types
            .iter()
            .map(|b| PerBadgeResult { kind: b.as_str().to_string(), success: true, error: tag_warning.clone() })
            .collect();
        let output_path = utils::assets::modified_poster_path(poster_id, "jpg").to_string_lossy().to_string();
        let _ = self
            .tracker
            .log_badge_application(&BadgeApplicationDetail {
                activity_id,
                badge_types: badge_types.iter().map(|b| b.as_str().to_string()).collect(),
                settings_snapshot: None,
                input_path: None,
                output_path: Some(output_path.clone()),
                intermediate_paths: vec![],
                per_badge_results: per_badge,
                final_width: item.width,
                final_height: item.height,
                final_size_bytes: Some(composed.len() as i64),
                stage_timings_ms: Some(stage_timings.clone()),
            })
            .await;

        let bottleneck_stage = [
            ("resolve", resolve_ms),
            ("download", download_ms),
            ("detect", detect_ms),
            ("compose", compose_ms),
            ("upload", upload_ms),
            ("tag", tag_ms),
        ]
        .into_iter()
        .max_by_key(|(_, ms)| *ms)
        .map(|(name, _)| name.to_string());

        let _ = self
            .tracker
            .log_performance_metric(&PerformanceMetricDetail {
                activity_id,
                peak_cpu_percent: None,
                peak_memory_mb: None,
                disk_read_bytes: None,
                disk_write_bytes: None,
                network_read_bytes: None,
                network_write_bytes: None,
                stage_timings_ms: Some(json!({
                    "resolve_ms": resolve_ms,
                    "download_ms": download_ms,
                    "detect_ms": detect_ms,
                    "compose_ms": compose_ms,
                    "upload_ms": upload_ms,
                    "tag_ms": tag_ms,
                    "total_ms": pipeline_started.elapsed().as_millis() as i64,
                })),
                bottleneck_stage,
                concurrent_operations: None,
            })
            .await;

        Ok(PipelineOutcome { output_path: Some(output_path), tag_warning })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::{CommunityReviewDetector, DimensionResolutionDetector, NoopAwardsDetector, StreamAudioDetector, StubComposer};
    use crate::media_client::{MediaItem, StubMediaServer};
    use db::models::job::{BadgeType, CreateJob, Job, JobSource};

    async fn make_pipeline() -> (PosterPipeline, Arc<StubMediaServer>, Uuid) {
        let pool = db::DBService::new_in_memory().await.unwrap().pool;
        let job = Job::create(
            &pool,
            CreateJob {
                owner: "alice".into(),
                name: "pipeline test".into(),
                source: JobSource::Manual,
                priority: 5,
                selected_poster_ids: vec!["item-1".into()],
                badge_types: vec![BadgeType::Audio],
            },
        )
        .await
        .unwrap();

        let server = Arc::new(StubMediaServer::new());
        server.seed_item(MediaItem {
            id: "item-1".into(),
            name: "Example".into(),
            library_id: "lib-1".into(),
            item_type: "Movie".into(),
            tags: vec![],
            has_poster: true,
            media_streams: serde_json::json!([{"Type": "Audio", "Codec": "truehd", "Profile": "Atmos"}]),
            community_rating: Some(7.0),
            official_rating: None,
            width: Some(1920),
            height: Some(1080),
            series_id: None,
        });
        server.seed_poster("item-1", b"\xff\xd8\xfforiginal".to_vec());

        let detectors = Arc::new(CachedDetectors::new(
            Arc::new(StreamAudioDetector::new(server.clone())),
            Arc::new(DimensionResolutionDetector),
            Arc::new(CommunityReviewDetector),
            Arc::new(NoopAwardsDetector),
        ));
        let tracker = Arc::new(ActivityTracker::new(pool, "0.1.0-test"));
        let pipeline = PosterPipeline::new(server.clone(), detectors, Arc::new(StubComposer), tracker);
        (pipeline, server, job.id)
    }

    #[tokio::test]
    async fn successful_run_uploads_composed_image_and_tags_item() {
        let (pipeline, server, job_id) = make_pipeline().await;
        let outcome = pipeline.run("item-1", &[BadgeType::Audio], job_id).await.unwrap();
        assert!(outcome.output_path.is_some());

        let uploaded = server.download_poster("item-1").await.unwrap();
        assert!(uploaded.windows(8).any(|w| w == b"|badges:"));

        let tags = server.get_tags("item-1").await.unwrap();
        assert!(tags.iter().any(|t| t == OVERLAY_TAG));
    }

    #[tokio::test]
    async fn missing_item_is_not_retryable() {
        let (pipeline, _server, job_id) = make_pipeline().await;
        let err = pipeline.run("does-not-exist", &[BadgeType::Audio], job_id).await.unwrap_err();
        assert!(matches!(err, PipelineError::ItemMissing(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn upload_verification_failure_is_retryable() {
        let (pipeline, server, job_id) = make_pipeline().await;
        server.fail_upload_verification_for.lock().unwrap().insert("item-1".to_string());
        let err = pipeline.run("item-1", &[BadgeType::Audio], job_id).await.unwrap_err();
        assert!(matches!(err, PipelineError::UploadVerificationFailed(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn tag_update_failure_does_not_fail_the_poster() {
        let (pipeline, server, job_id) = make_pipeline().await;
        server.fail_tag_update_for.lock().unwrap().insert("item-1".to_string());
        let outcome = pipeline.run("item-1", &[BadgeType::Audio], job_id).await.unwrap();
        assert!(outcome.output_path.is_some());
        assert!(outcome.tag_warning.is_some());

        // Upload still happened even though tagging failed afterward.
        let uploaded = server.download_poster("item-1").await.unwrap();
        assert!(uploaded.windows(8).any(|w| w == b"|badges:"));
    }
}
