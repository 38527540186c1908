use std::sync::Arc;

use aphrodite_core::activity_tracker::ActivityTracker;
use aphrodite_core::config::{self, Config};
use aphrodite_core::detectors::{CachedDetectors, CommunityReviewDetector, DimensionResolutionDetector, NoopAwardsDetector, StreamAudioDetector, StubComposer};
use aphrodite_core::job_manager::JobManager;
use aphrodite_core::media_client::{JellyfinClient, MediaServerClient};
use aphrodite_core::poster_pipeline::PosterPipeline;
use aphrodite_core::progress_bus::ProgressBus;
use aphrodite_core::scheduler::{Scheduler, SchedulerConfig};
use server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    utils::logging::init_tracing();

    let config = config::load_config_from_file(&utils::assets::config_path()).await;

    let db = db::DBService::new().await?;
    let pool = db.pool.clone();

    let media_client: Arc<dyn MediaServerClient> = Arc::new(JellyfinClient::with_max_upload_attempts(
        config.jellyfin_url.clone(),
        config.jellyfin_api_key.clone(),
        config.jellyfin_user_id.clone(),
        config.max_upload_attempts,
    ));

    let detectors = Arc::new(CachedDetectors::new(
        Arc::new(StreamAudioDetector::new(media_client.clone())),
        Arc::new(DimensionResolutionDetector),
        Arc::new(CommunityReviewDetector),
        Arc::new(NoopAwardsDetector),
    ));
    let tracker = Arc::new(ActivityTracker::new(pool.clone(), utils::version::APP_VERSION));
    let pipeline = Arc::new(PosterPipeline::new(media_client.clone(), detectors, Arc::new(StubComposer), tracker));

    let progress_bus = Arc::new(ProgressBus::new(config.redis_url.as_deref()));
    let job_manager = Arc::new(JobManager::new(pool.clone(), pipeline, progress_bus.clone(), config.clone()));
    job_manager.spawn_dispatcher();

    let scheduler_config = SchedulerConfig { grace_window: chrono::Duration::minutes(config.scheduler_grace_minutes) };
    let scheduler = Arc::new(Scheduler::new(pool.clone(), media_client.clone(), job_manager.clone(), scheduler_config));

    let scheduler_handle = scheduler.clone();
    let tick_interval = std::time::Duration::from_secs(config.scheduler_tick_seconds);
    tokio::spawn(async move { scheduler_handle.run(tick_interval).await });

    if let Some(redis_url) = config.redis_url.clone() {
        let bridge_bus = progress_bus.clone();
        tokio::spawn(async move { aphrodite_core::progress_bus::run_redis_bridge(bridge_bus, redis_url).await });
    }

    let state = AppState { pool, job_manager, scheduler, progress_bus, media_client };
    let app = server::routes::router(state);

    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let addr = format!("{host}:{port}");

    tracing::info!("aphrodite listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
