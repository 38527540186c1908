use std::path::Path;

use serde::{Deserialize, Serialize};

/// Process configuration. Loaded once at startup from a JSON document on
/// disk, overridden by environment variables, then held behind
/// `Arc<RwLock<Config>>` so it can be hot-reloaded by a settings surface
/// outside this core's scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub jellyfin_url: String,
    pub jellyfin_api_key: String,
    pub jellyfin_user_id: String,
    pub redis_url: Option<String>,
    pub max_posters_per_job: usize,
    pub max_concurrent_jobs: usize,
    pub max_concurrent_posters_per_job: usize,
    pub max_poster_retries: u32,
    pub max_upload_attempts: u32,
    pub scheduler_tick_seconds: u64,
    pub scheduler_grace_minutes: i64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            jellyfin_url: String::new(),
            jellyfin_api_key: String::new(),
            jellyfin_user_id: String::new(),
            redis_url: None,
            max_posters_per_job: db::models::job::MAX_POSTERS_PER_JOB,
            max_concurrent_jobs: 3,
            max_concurrent_posters_per_job: 3,
            max_poster_retries: 3,
            max_upload_attempts: 3,
            scheduler_tick_seconds: 60,
            scheduler_grace_minutes: 10,
        }
    }
}

impl Config {
    /// Environment variables win over the file; the file wins over
    /// built-in defaults.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("APHRODITE_JELLYFIN_URL") {
            self.jellyfin_url = v;
        }
        if let Ok(v) = std::env::var("APHRODITE_JELLYFIN_API_KEY") {
            self.jellyfin_api_key = v;
        }
        if let Ok(v) = std::env::var("APHRODITE_JELLYFIN_USER_ID") {
            self.jellyfin_user_id = v;
        }
        if let Ok(v) = std::env::var("APHRODITE_REDIS_URL") {
            self.redis_url = Some(v);
        }
    }
}

pub async fn load_config_from_file(path: &Path) -> Config {
    let mut config = match tokio::fs::read_to_string(path).await {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
            tracing::warn!("failed to parse config at {}: {e}, using defaults", path.display());
            Config::default()
        }),
        Err(_) => {
            tracing::info!("no config file at {}, using defaults", path.display());
            Config::default()
        }
    };
    config.apply_env_overrides();
    config
}

pub async fn save_config_to_file(config: &Config, path: &Path) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(config)?;
    tokio::fs::write(path, json).await
}
