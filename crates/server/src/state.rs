use std::sync::Arc;

use aphrodite_core::job_manager::JobManager;
use aphrodite_core::media_client::MediaServerClient;
use aphrodite_core::progress_bus::ProgressBus;
use aphrodite_core::scheduler::Scheduler;

/// Shared state handed to every route. The HTTP layer never touches the
/// pool or the pipeline directly — everything goes through C7/C8/C9.
#[derive(Clone)]
pub struct AppState {
    pub pool: sqlx::SqlitePool,
    pub job_manager: Arc<JobManager>,
    pub scheduler: Arc<Scheduler>,
    pub progress_bus: Arc<ProgressBus>,
    pub media_client: Arc<dyn MediaServerClient>,
}
