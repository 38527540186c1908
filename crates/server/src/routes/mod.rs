pub mod analytics;
pub mod control;
pub mod jobs;
pub mod progress;
pub mod schedules;

use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::middleware::request_id_middleware;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/workflow/jobs/batch", post(jobs::submit_batch))
        .route("/workflow/jobs/{id}", get(jobs::get_job))
        .route("/workflow/jobs", get(jobs::list_jobs))
        .route("/workflow/jobs/broadcast-progress/{id}", post(jobs::broadcast_progress))
        .route("/workflow/control/{id}/pause", post(control::pause))
        .route("/workflow/control/{id}/resume", post(control::resume))
        .route("/workflow/control/{id}/cancel", post(control::cancel))
        .route("/workflow/control/{id}/restart", post(control::restart))
        .route("/workflow/progress/{job_id}", get(progress::job_progress_ws))
        .route("/schedules", get(schedules::list_schedules).post(schedules::create_schedule))
        .route(
            "/schedules/{id}",
            get(schedules::get_schedule).put(schedules::update_schedule).delete(schedules::delete_schedule),
        )
        .route("/schedules/{id}/enabled", put(schedules::set_enabled))
        .route("/schedules/{id}/execute", post(schedules::execute_now))
        .route("/schedules/executions/history", get(schedules::execution_history))
        .route("/schedules/config/badge-types", get(schedules::badge_type_options))
        .route("/schedules/config/cron-presets", get(schedules::cron_presets))
        .route("/schedules/config/libraries", get(schedules::library_options))
        .route("/activity", get(analytics::list_activity))
        .route("/activity/summary", get(analytics::activity_summary))
        .route("/activity/suggestions", get(analytics::suggestions))
        .route("/activity/batch/{batch_job_id}/summary", get(analytics::batch_job_summary))
        .route("/activity/users/{user_id}/summary", get(analytics::user_activity_summary))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
