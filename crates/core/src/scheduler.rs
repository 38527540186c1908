//! Scheduler (C8): a per-minute tick loop that evaluates every enabled
//! schedule's cron expression in its own timezone, and creates a batch job
//! for any schedule that came due since the last tick — without creating a
//! duplicate if one already ran inside the grace window.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use uuid::Uuid;

use crate::job_manager::{BatchRequest, JobManager, JobManagerError};
use crate::media_client::MediaServerClient;
use db::models::job::{BadgeType, JobSource};
use db::models::schedule::{Schedule, ScheduleError};
use db::models::schedule_execution::{ItemsProcessed, ScheduleExecution, ScheduleExecutionError, ScheduleExecutionStatus};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    ScheduleExecution(#[from] ScheduleExecutionError),
    #[error(transparent)]
    JobManager(#[from] JobManagerError),
    #[error("invalid cron expression {0:?}: {1}")]
    InvalidCron(String, String),
    #[error("invalid timezone {0:?}")]
    InvalidTimezone(String),
}

pub struct SchedulerConfig {
    pub grace_window: ChronoDuration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig { grace_window: ChronoDuration::minutes(10) }
    }
}

pub struct Scheduler {
    pool: sqlx::SqlitePool,
    media_client: Arc<dyn MediaServerClient>,
    job_manager: Arc<JobManager>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(pool: sqlx::SqlitePool, media_client: Arc<dyn MediaServerClient>, job_manager: Arc<JobManager>, config: SchedulerConfig) -> Self {
        Scheduler { pool, media_client, job_manager, config }
    }

    /// Runs forever, ticking once a minute. Each schedule's evaluation is
    /// isolated: one schedule's error doesn't stop the others from running
    /// this tick or future ticks.
    pub async fn run(&self, tick_interval: std::time::Duration) {
        let mut interval = tokio::time::interval(tick_interval);
        loop {
            interval.tick().await;
            if let Err(e) = self.tick(Utc::now()).await {
                tracing::error!("scheduler tick failed: {e}");
            }
        }
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        let schedules = Schedule::list_enabled(&self.pool).await?;
        for schedule in schedules {
            if let Err(e) = self.evaluate_schedule(&schedule, now).await {
                tracing::warn!("schedule {} failed this tick: {e}", schedule.id);
            }
        }
        Ok(())
    }

    async fn evaluate_schedule(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        let tz: Tz = schedule.timezone.parse().map_err(|_| SchedulerError::InvalidTimezone(schedule.timezone.clone()))?;
        let cron_schedule = CronSchedule::from_str(&schedule.cron_expression)
            .map_err(|e| SchedulerError::InvalidCron(schedule.cron_expression.clone(), e.to_string()))?;

        let now_local = now.with_timezone(&tz);
        // `cron` only iterates forward, so the most recent fire time is
        // found by scanning forward from a safe lookback point and keeping
        // the last occurrence that isn't after `now`.
        let lookback = now_local - self.config.grace_window - ChronoDuration::days(1);
        let Some(prev_fire_local) = cron_schedule.after(&lookback).take_while(|t| *t <= now_local).last() else {
            return Ok(());
        };
        let prev_fire_utc = prev_fire_local.with_timezone(&Utc);

        // Due only if the most recent scheduled fire time is inside the
        // grace window looking backward from now; anything older than that
        // was either already handled or is a catch-up we deliberately skip.
        if now - prev_fire_utc > self.config.grace_window {
            return Ok(());
        }

        if ScheduleExecution::exists_in_window(&self.pool, schedule.id, prev_fire_utc - self.config.grace_window, prev_fire_utc + self.config.grace_window).await? {
            return Ok(());
        }

        self.execute(schedule).await?;
        Ok(())
    }

    /// Runs a schedule immediately regardless of cron timing, always
    /// creating a new execution row — used by the manual "run now" action.
    pub async fn execute_schedule_now(&self, schedule_id: Uuid) -> Result<Uuid, SchedulerError> {
        let schedule = Schedule::find_by_id(&self.pool, schedule_id).await?.ok_or(ScheduleError::NotFound(schedule_id))?;
        self.execute(&schedule).await
    }

    /// Jobs created from a schedule are owned by the fixed `"scheduler"`
    /// account rather than any individual user.
    const SCHEDULER_OWNER: &'static str = "scheduler";

    async fn execute(&self, schedule: &Schedule) -> Result<Uuid, SchedulerError> {
        let execution = ScheduleExecution::create(&self.pool, schedule.id).await?;

        let mut candidates = Vec::new();
        for library_id in &schedule.target_library_ids {
            match self.media_client.list_library_items(library_id).await {
                Ok(items) => candidates.extend(items),
                Err(e) => tracing::warn!("schedule {}: failed to list library {library_id}: {e}", schedule.id),
            }
        }

        let total_seen = candidates.len() as i64;
        let selected: Vec<String> = candidates
            .into_iter()
            .filter(|item| item.item_type == "Movie" || item.item_type == "Series")
            .filter(|item| schedule.reprocess_all || !item.tags.iter().any(|t| t == crate::poster_pipeline::OVERLAY_TAG))
            .map(|item| item.id)
            .collect();
        let skipped = total_seen - selected.len() as i64;
        let now = Utc::now();

        if selected.is_empty() {
            ScheduleExecution::complete(
                &self.pool,
                execution.id,
                ScheduleExecutionStatus::Completed,
                &ItemsProcessed { total_seen, enqueued: 0, skipped, created_job_ids: vec![] },
                None,
            )
            .await?;
            Schedule::record_run(&self.pool, schedule.id, now, None).await?;
            return Ok(execution.id);
        }

        let jobs = self
            .job_manager
            .create_and_dispatch(BatchRequest {
                owner: Self::SCHEDULER_OWNER.to_string(),
                name: format!("scheduled: {}", schedule.name),
                source: JobSource::Scheduled,
                priority: None,
                poster_ids: selected,
                badge_types: schedule.badge_types.clone(),
            })
            .await?;

        let created_job_ids = jobs.iter().map(|j| j.id).collect::<Vec<_>>();
        let enqueued = jobs.iter().map(|j| j.total_posters).sum();
        ScheduleExecution::complete(
            &self.pool,
            execution.id,
            ScheduleExecutionStatus::Completed,
            &ItemsProcessed { total_seen, enqueued, skipped, created_job_ids },
            None,
        )
        .await?;
        Schedule::record_run(&self.pool, schedule.id, now, None).await?;
        Ok(execution.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity_tracker::ActivityTracker;
    use crate::detectors::{CachedDetectors, CommunityReviewDetector, DimensionResolutionDetector, NoopAwardsDetector, StreamAudioDetector, StubComposer};
    use crate::media_client::{MediaItem, StubMediaServer};
    use crate::poster_pipeline::PosterPipeline;
    use crate::progress_bus::ProgressBus;
    use db::models::schedule::CreateSchedule;

    async fn make_scheduler() -> (Scheduler, sqlx::SqlitePool, Arc<StubMediaServer>) {
        let pool = db::DBService::new_in_memory().await.unwrap().pool;
        let server = Arc::new(StubMediaServer::new());
        server.seed_item(MediaItem {
            id: "item-1".into(),
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
        server.seed_poster("item-1", b"\xff\xd8\xfforiginal".to_vec());

        let detectors = Arc::new(CachedDetectors::new(
            Arc::new(StreamAudioDetector::new(server.clone())),
            Arc::new(DimensionResolutionDetector),
            Arc::new(CommunityReviewDetector),
            Arc::new(NoopAwardsDetector),
        ));
        let tracker = Arc::new(ActivityTracker::new(pool.clone(), "0.1.0-test"));
        let pipeline = Arc::new(PosterPipeline::new(server.clone(), detectors, Arc::new(StubComposer), tracker));
        let bus = Arc::new(ProgressBus::new(None));
        let job_manager = Arc::new(JobManager::new(pool.clone(), pipeline, bus, crate::config::Config::default()));
        let scheduler = Scheduler::new(pool.clone(), server.clone(), job_manager, SchedulerConfig::default());
        (scheduler, pool, server)
    }

    #[tokio::test]
    async fn execute_schedule_now_creates_execution_and_dispatches_job() {
        let (scheduler, pool, _server) = make_scheduler().await;
        let schedule = Schedule::create(
            &pool,
            CreateSchedule {
                name: "nightly".into(),
                cron_expression: "0 0 3 * * *".into(),
                timezone: "UTC".into(),
                target_library_ids: vec!["lib-1".into()],
                badge_types: vec![BadgeType::Audio],
                reprocess_all: false,
            },
        )
        .await
        .unwrap();

        scheduler.execute_schedule_now(schedule.id).await.unwrap();

        let history = ScheduleExecution::history(&pool, Some(schedule.id), 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, ScheduleExecutionStatus::Completed);
        assert_eq!(history[0].items_processed.as_ref().unwrap().enqueued, 1);
    }

    #[tokio::test]
    async fn tick_skips_schedule_already_executed_in_grace_window() {
        let (scheduler, pool, _server) = make_scheduler().await;
        let schedule = Schedule::create(
            &pool,
            CreateSchedule {
                name: "every minute".into(),
                cron_expression: "* * * * * *".into(),
                timezone: "UTC".into(),
                target_library_ids: vec!["lib-1".into()],
                badge_types: vec![BadgeType::Audio],
                reprocess_all: true,
            },
        )
        .await
        .unwrap();

        let now = Utc::now();
        scheduler.tick(now).await.unwrap();
        let after_first = ScheduleExecution::history(&pool, Some(schedule.id), 10).await.unwrap().len();
        assert_eq!(after_first, 1);

        scheduler.tick(now + ChronoDuration::seconds(30)).await.unwrap();
        let after_second = ScheduleExecution::history(&pool, Some(schedule.id), 10).await.unwrap().len();
        assert_eq!(after_second, 1, "second tick within the grace window must not duplicate the run");
    }
}
