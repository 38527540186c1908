//! Batch worker (C6): runs every poster in a job through the poster
//! pipeline with bounded per-job concurrency. The process-wide cap on how
//! many jobs run at once lives one level up, in the job manager's
//! dispatcher — by the time a worker is constructed its job has already
//! been claimed and counted against that budget.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::activity_tracker::ActivityTracker;
use crate::config::Config;
use crate::poster_pipeline::{PipelineError, PosterPipeline};
use crate::progress_bus::{ProgressBus, ProgressEvent};
use db::models::job::{Job, JobError};
use db::models::poster_status::{PosterState, PosterStatus, PosterStatusError};

#[derive(Debug, thiserror::Error)]
pub enum BatchWorkerError {
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    PosterStatus(#[from] PosterStatusError),
}

/// One job's run through the worker. Cheap to construct; the real shared
/// state (db pool, media client, detectors) lives behind the pipeline.
pub struct BatchWorker {
    pool: sqlx::SqlitePool,
    pipeline: Arc<PosterPipeline>,
    bus: Arc<ProgressBus>,
    max_concurrent_posters: usize,
    max_poster_retries: u32,
}

impl BatchWorker {
    pub fn new(pool: sqlx::SqlitePool, pipeline: Arc<PosterPipeline>, bus: Arc<ProgressBus>, config: &Config) -> Self {
        BatchWorker {
            pool,
            pipeline,
            bus,
            max_concurrent_posters: config.max_concurrent_posters_per_job,
            max_poster_retries: config.max_poster_retries,
        }
    }

    /// Runs the job to completion (or until cooperatively paused/cancelled).
    /// The caller is expected to have already claimed the job (moved it to
    /// `running` and reserved it against the process-wide job budget), so
    /// this should be spawned on its own task, not awaited inline from a
    /// request handler.
    pub async fn run(&self, job_id: Uuid) -> Result<(), BatchWorkerError> {
        let job = Job::find_by_id(&self.pool, job_id).await?.ok_or(JobError::NotFound(job_id))?;

        let local_permits = Arc::new(Semaphore::new(self.max_concurrent_posters));

        // A retryable failure leaves its poster `processing` rather than
        // terminal, so each pass re-snapshots the non-terminal rows. Every
        // poster either completes, fails outright, or exhausts its retry
        // budget and is marked `failed` — so this always terminates.
        loop {
            let pending = PosterStatus::find_by_job(&self.pool, job_id)
                .await?
                .into_iter()
                .filter(|p| !p.status.is_terminal())
                .collect::<Vec<_>>();
            if pending.is_empty() {
                break;
            }

            let mut tasks: JoinSet<()> = JoinSet::new();
            for poster in pending {
                if self.should_stop(job_id).await? {
                    while tasks.join_next().await.is_some() {}
                    return Ok(());
                }

                if poster.status == PosterState::Pending {
                    PosterStatus::mark_processing(&self.pool, job_id, &poster.poster_id).await?;
                }

                let permit = local_permits.clone().acquire_owned().await.expect("semaphore not closed");
                let pool = self.pool.clone();
                let pipeline = self.pipeline.clone();
                let bus = self.bus.clone();
                let badge_types = job.badge_types.clone();
                let poster_id = poster.poster_id.clone();
                let retry_count = poster.retry_count as u32;
                let max_retries = self.max_poster_retries;

                tasks.spawn(async move {
                    let _permit = permit;
                    let result = pipeline.run(&poster_id, &badge_types, job_id).await;
                    record_poster_result(&pool, job_id, &poster_id, result, retry_count, max_retries).await;
                    publish_progress(&pool, &bus, job_id).await;
                });

                // Cap in-flight tasks so we don't hold the whole job's
                // poster list in memory as spawned futures.
                if tasks.len() >= self.max_concurrent_posters {
                    tasks.join_next().await;
                }
            }
            while tasks.join_next().await.is_some() {}
        }

        self.finalize(job_id).await
    }

    async fn should_stop(&self, job_id: Uuid) -> Result<bool, BatchWorkerError> {
        let job = Job::find_by_id(&self.pool, job_id).await?.ok_or(JobError::NotFound(job_id))?;
        Ok(job.status != db::models::job::JobStatus::Running)
    }

    async fn finalize(&self, job_id: Uuid) -> Result<(), BatchWorkerError> {
        let job = Job::find_by_id(&self.pool, job_id).await?.ok_or(JobError::NotFound(job_id))?;
        if job.status != db::models::job::JobStatus::Running {
            // Paused or cancelled mid-run; leave status as-is.
            return Ok(());
        }
        let error_summary = PosterStatus::most_frequent_error(&self.pool, job_id).await?;
        Job::mark_completed(&self.pool, job_id, error_summary.as_deref()).await?;
        publish_progress(&self.pool, &self.bus, job_id).await;
        Ok(())
    }
}

/// A retryable failure leaves the poster `processing` with `retry_count`
/// incremented rather than immediately re-running it in this pass — the
/// next worker run (or an explicit job restart) picks it back up.
async fn record_poster_result(
    pool: &sqlx::SqlitePool,
    job_id: Uuid,
    poster_id: &str,
    result: Result<crate::poster_pipeline::PipelineOutcome, PipelineError>,
    previous_retries: u32,
    max_retries: u32,
) {
    match result {
        Ok(outcome) => {
            let _ = PosterStatus::mark_terminal(pool, job_id, poster_id, PosterState::Completed, outcome.output_path.as_deref(), None).await;
            let _ = Job::increment_completed(pool, job_id).await;
        }
        Err(e) if e.is_retryable() && previous_retries < max_retries => {
            let _ = PosterStatus::mark_retry(pool, job_id, poster_id).await;
        }
        Err(e) => {
            let _ = PosterStatus::mark_terminal(pool, job_id, poster_id, PosterState::Failed, None, Some(&e.to_string())).await;
            let _ = Job::increment_failed(pool, job_id).await;
        }
    }
}

async fn publish_progress(pool: &sqlx::SqlitePool, bus: &ProgressBus, job_id: Uuid) {
    if let Ok(Some(job)) = Job::find_by_id(pool, job_id).await {
        bus.publish(ProgressEvent {
            job_id,
            total_posters: job.total_posters,
            completed_posters: job.completed_posters,
            failed_posters: job.failed_posters,
            current_poster_id: None,
            timestamp: chrono::Utc::now(),
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity_tracker::ActivityTracker;
    use crate::detectors::{CachedDetectors, CommunityReviewDetector, DimensionResolutionDetector, NoopAwardsDetector, StreamAudioDetector, StubComposer};
    use crate::media_client::{MediaItem, StubMediaServer};
    use db::models::job::{BadgeType, CreateJob, JobSource};
    use db::models::poster_status::PosterStatus as Poster;

    #[tokio::test]
    async fn worker_processes_every_poster_and_marks_job_completed() {
        let pool = db::DBService::new_in_memory().await.unwrap().pool;
        let job = Job::create(
            &pool,
            CreateJob {
                owner: "alice".into(),
                name: "batch".into(),
                source: JobSource::Manual,
                priority: 5,
                selected_poster_ids: vec!["item-1".into(), "item-2".into()],
                badge_types: vec![BadgeType::Audio],
            },
        )
        .await
        .unwrap();
        Poster::seed_for_job(&pool, job.id, &job.selected_poster_ids).await.unwrap();

        let server = Arc::new(StubMediaServer::new());
        for id in ["item-1", "item-2"] {
            server.seed_item(MediaItem {
                id: id.into(),
                name: "Example".into(),
                library_id: "lib-1".into(),
                item_type: "Movie".into(),
                tags: vec![],
                has_poster: true,
                media_streams: serde_json::json!([]),
                community_rating: None,
                official_rating: None,
                width: Some(1920),
                height: Some(1080),
                series_id: None,
            });
            server.seed_poster(id, b"\xff\xd8\xfforiginal".to_vec());
        }

        let detectors = Arc::new(CachedDetectors::new(
            Arc::new(StreamAudioDetector::new(server.clone())),
            Arc::new(DimensionResolutionDetector),
            Arc::new(CommunityReviewDetector),
            Arc::new(NoopAwardsDetector),
        ));
        let tracker = Arc::new(ActivityTracker::new(pool.clone(), "0.1.0-test"));
        let pipeline = Arc::new(PosterPipeline::new(server, detectors, Arc::new(StubComposer), tracker));
        let bus = Arc::new(ProgressBus::new(None));
        let config = Config::default();
        let worker = BatchWorker::new(pool.clone(), pipeline, bus, &config);

        Job::mark_running(&pool, job.id).await.unwrap();
        worker.run(job.id).await.unwrap();

        let reloaded = Job::find_by_id(&pool, job.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, db::models::job::JobStatus::Completed);
        assert_eq!(reloaded.completed_posters, 2);
        assert_eq!(reloaded.failed_posters, 0);
    }
}
