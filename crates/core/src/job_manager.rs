//! Job manager (C7): the entry point batch requests and schedules dispatch
//! through. Validates and splits oversized requests, persists the job and
//! its poster rows, and hands execution off to a [`BatchWorker`] on a
//! spawned task so the caller never blocks on a whole batch completing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use uuid::Uuid;

use crate::batch_worker::BatchWorker;
use crate::config::Config;
use crate::poster_pipeline::PosterPipeline;
use crate::progress_bus::ProgressBus;
use db::models::job::{BadgeType, CreateJob, Job, JobError, JobSource, JobStatus, MAX_POSTERS_PER_JOB};
use db::models::poster_status::{PosterStatus, PosterStatusError};

#[derive(Debug, thiserror::Error)]
pub enum JobManagerError {
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    PosterStatus(#[from] PosterStatusError),
}

pub struct BatchRequest {
    pub owner: String,
    pub name: String,
    pub source: JobSource,
    pub priority: Option<i64>,
    pub poster_ids: Vec<String>,
    pub badge_types: Vec<BadgeType>,
}

/// Coordinates job lifecycle and dispatch. One instance is shared (behind
/// an `Arc`) across the HTTP layer and the scheduler.
pub struct JobManager {
    pool: sqlx::SqlitePool,
    pipeline: Arc<PosterPipeline>,
    bus: Arc<ProgressBus>,
    global_jobs_semaphore: Arc<Semaphore>,
    dispatch_signal: Arc<Notify>,
    config: Config,
}

impl JobManager {
    pub fn new(pool: sqlx::SqlitePool, pipeline: Arc<PosterPipeline>, bus: Arc<ProgressBus>, config: Config) -> Self {
        let global_jobs_semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        JobManager { pool, pipeline, bus, global_jobs_semaphore, dispatch_signal: Arc::new(Notify::new()), config }
    }

    /// Spawns the background dispatcher that pulls queued jobs in priority
    /// order. Call once per `JobManager`; `create_and_dispatch`/`resume`/
    /// `restart` only flip a job's status to `queued` and nudge this loop
    /// awake rather than running a job themselves.
    pub fn spawn_dispatcher(&self) {
        let pool = self.pool.clone();
        let pipeline = self.pipeline.clone();
        let bus = self.bus.clone();
        let global_jobs_semaphore = self.global_jobs_semaphore.clone();
        let dispatch_signal = self.dispatch_signal.clone();
        let config = self.config.clone();
        tokio::spawn(async move { run_dispatch_loop(pool, pipeline, bus, global_jobs_semaphore, dispatch_signal, config).await });
    }

    /// Splits a request wider than [`MAX_POSTERS_PER_JOB`] into multiple
    /// jobs so no single job's poster list exceeds the cap. Each resulting
    /// job is dispatched independently.
    pub async fn create_and_dispatch(&self, request: BatchRequest) -> Result<Vec<Job>, JobManagerError> {
        let priority = request.priority.unwrap_or(db::models::job::DEFAULT_PRIORITY).clamp(1, 10);
        let chunks: Vec<&[String]> = request.poster_ids.chunks(MAX_POSTERS_PER_JOB).collect();
        let mut jobs = Vec::with_capacity(chunks.len());

        for (index, chunk) in chunks.iter().enumerate() {
            let name = if chunks.len() > 1 { format!("{} (part {}/{})", request.name, index + 1, chunks.len()) } else { request.name.clone() };
            let job = Job::create(
                &self.pool,
                CreateJob {
                    owner: request.owner.clone(),
                    name,
                    source: request.source,
                    priority,
                    selected_poster_ids: chunk.to_vec(),
                    badge_types: request.badge_types.clone(),
                },
            )
            .await?;
            PosterStatus::seed_for_job(&self.pool, job.id, chunk).await?;
            jobs.push(job);
        }

        self.dispatch_signal.notify_one();
        Ok(jobs)
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Option<Job>, JobManagerError> {
        Ok(Job::find_by_id(&self.pool, job_id).await?)
    }

    pub async fn list_for_owner(&self, owner: &str, status: Option<JobStatus>) -> Result<Vec<Job>, JobManagerError> {
        Ok(Job::list_for_owner(&self.pool, owner, status).await?)
    }

    pub async fn pause(&self, job_id: Uuid) -> Result<(), JobManagerError> {
        Ok(Job::pause(&self.pool, job_id).await?)
    }

    pub async fn resume(&self, job_id: Uuid) -> Result<(), JobManagerError> {
        Job::resume(&self.pool, job_id).await?;
        self.dispatch_signal.notify_one();
        Ok(())
    }

    pub async fn cancel(&self, job_id: Uuid) -> Result<(), JobManagerError> {
        Ok(Job::cancel(&self.pool, job_id).await?)
    }

    /// Restarts a stuck or failed job. Already-`completed` poster rows are
    /// left alone; the worker picks up wherever poster state left off.
    pub async fn restart(&self, job_id: Uuid) -> Result<(), JobManagerError> {
        Job::restart(&self.pool, job_id).await?;
        self.dispatch_signal.notify_one();
        Ok(())
    }
}

/// Pulls the highest-priority queued job (oldest first on ties) under the
/// process-wide semaphore, so a burst of low-priority submissions can never
/// starve a high-priority one just because it arrived first: every slot
/// that frees up re-reads the queue instead of running whatever it was
/// handed at creation time.
async fn run_dispatch_loop(
    pool: sqlx::SqlitePool,
    pipeline: Arc<PosterPipeline>,
    bus: Arc<ProgressBus>,
    global_jobs_semaphore: Arc<Semaphore>,
    dispatch_signal: Arc<Notify>,
    config: Config,
) {
    loop {
        let permit = match global_jobs_semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let job = loop {
            match Job::next_queued(&pool).await {
                Ok(Some(job)) => match Job::mark_running(&pool, job.id).await {
                    Ok(()) => break job,
                    // Lost a race with a cancel/pause; try the next candidate.
                    Err(JobError::InvalidTransition(..)) => continue,
                    Err(e) => {
                        tracing::error!("failed to claim queued job {}: {e}", job.id);
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                },
                Ok(None) => dispatch_signal.notified().await,
                Err(e) => {
                    tracing::error!("failed to query next queued job: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        };

        let pool = pool.clone();
        let pipeline = pipeline.clone();
        let bus = bus.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let worker = BatchWorker::new(pool, pipeline, bus, &config);
            if let Err(e) = worker.run(job.id).await {
                tracing::error!("batch worker for job {} exited with error: {e}", job.id);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity_tracker::ActivityTracker;
    use crate::detectors::{CachedDetectors, CommunityReviewDetector, DimensionResolutionDetector, NoopAwardsDetector, StreamAudioDetector, StubComposer};
    use crate::media_client::{MediaItem, StubMediaServer};

    fn sample_item(id: &str) -> MediaItem {
        MediaItem {
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
        }
    }

    async fn make_manager() -> (JobManager, sqlx::SqlitePool) {
        let pool = db::DBService::new_in_memory().await.unwrap().pool;
        let server = Arc::new(StubMediaServer::new());
        server.seed_item(sample_item("item-1"));
        server.seed_poster("item-1", b"\xff\xd8\xfforiginal".to_vec());
        let detectors = Arc::new(CachedDetectors::new(
            Arc::new(StreamAudioDetector::new(server.clone())),
            Arc::new(DimensionResolutionDetector),
            Arc::new(CommunityReviewDetector),
            Arc::new(NoopAwardsDetector),
        ));
        let tracker = Arc::new(ActivityTracker::new(pool.clone(), "0.1.0-test"));
        let pipeline = Arc::new(PosterPipeline::new(server, detectors, Arc::new(StubComposer), tracker));
        let bus = Arc::new(ProgressBus::new(None));
        let manager = JobManager::new(pool.clone(), pipeline, bus, Config::default());
        (manager, pool)
    }

    #[tokio::test]
    async fn create_and_dispatch_clamps_priority_to_valid_range() {
        let (manager, _pool) = make_manager().await;
        let jobs = manager
            .create_and_dispatch(BatchRequest {
                owner: "alice".into(),
                name: "clamp test".into(),
                source: JobSource::Manual,
                priority: Some(99),
                poster_ids: vec!["item-1".into()],
                badge_types: vec![BadgeType::Audio],
            })
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].priority, 10);
    }

    #[tokio::test]
    async fn oversized_request_splits_into_multiple_jobs() {
        let (manager, _pool) = make_manager().await;
        let poster_ids: Vec<String> = (0..(MAX_POSTERS_PER_JOB + 10)).map(|i| format!("item-{i}")).collect();
        let jobs = manager
            .create_and_dispatch(BatchRequest {
                owner: "alice".into(),
                name: "big batch".into(),
                source: JobSource::Manual,
                priority: None,
                poster_ids,
                badge_types: vec![BadgeType::Audio],
            })
            .await
            .unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].total_posters, MAX_POSTERS_PER_JOB as i64);
        assert_eq!(jobs[1].total_posters, 10);
    }

    #[tokio::test]
    async fn dispatcher_starts_higher_priority_job_before_an_older_lower_priority_one() {
        let pool = db::DBService::new_in_memory().await.unwrap().pool;
        let server = Arc::new(StubMediaServer::new());
        server.seed_item(sample_item("item-1"));
        server.seed_poster("item-1", b"\xff\xd8\xfforiginal".to_vec());
        server.seed_item(sample_item("item-2"));
        server.seed_poster("item-2", b"\xff\xd8\xfforiginal".to_vec());
        let detectors = Arc::new(CachedDetectors::new(
            Arc::new(StreamAudioDetector::new(server.clone())),
            Arc::new(DimensionResolutionDetector),
            Arc::new(CommunityReviewDetector),
            Arc::new(NoopAwardsDetector),
        ));
        let tracker = Arc::new(ActivityTracker::new(pool.clone(), "0.1.0-test"));
        let pipeline = Arc::new(PosterPipeline::new(server, detectors, Arc::new(StubComposer), tracker));
        let bus = Arc::new(ProgressBus::new(None));
        let config = Config { max_concurrent_jobs: 1, ..Config::default() };
        let manager = JobManager::new(pool.clone(), pipeline, bus, config);

        // Queue the low-priority job first so a naive "run what you're
        // handed" dispatcher would start it before the one submitted later.
        let low = manager
            .create_and_dispatch(BatchRequest {
                owner: "alice".into(),
                name: "low priority".into(),
                source: JobSource::Manual,
                priority: Some(8),
                poster_ids: vec!["item-1".into()],
                badge_types: vec![BadgeType::Audio],
            })
            .await
            .unwrap()
            .remove(0);
        let high = manager
            .create_and_dispatch(BatchRequest {
                owner: "alice".into(),
                name: "high priority".into(),
                source: JobSource::Manual,
                priority: Some(1),
                poster_ids: vec!["item-2".into()],
                badge_types: vec![BadgeType::Audio],
            })
            .await
            .unwrap()
            .remove(0);

        manager.spawn_dispatcher();

        for _ in 0..500 {
            let l = Job::find_by_id(&pool, low.id).await.unwrap().unwrap();
            let h = Job::find_by_id(&pool, high.id).await.unwrap().unwrap();
            if l.status == JobStatus::Completed && h.status == JobStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let low = Job::find_by_id(&pool, low.id).await.unwrap().unwrap();
        let high = Job::find_by_id(&pool, high.id).await.unwrap().unwrap();
        assert_eq!(low.status, JobStatus::Completed);
        assert_eq!(high.status, JobStatus::Completed);
        assert!(high.started_at.unwrap() <= low.started_at.unwrap(), "higher-priority job should have started first");
    }
}
