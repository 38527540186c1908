use std::{env, path::PathBuf};

use directories::ProjectDirs;

const PROJECT_ROOT: &str = env!("CARGO_MANIFEST_DIR");
const ASSET_DIR_ENV: &str = "APHRODITE_ASSET_DIR";

/// Base directory for all durable Aphrodite state: the sqlite database,
/// config.json, and the poster cache. Overridable for tests and containers.
pub fn asset_dir() -> PathBuf {
    let path = if let Ok(custom_dir) = env::var(ASSET_DIR_ENV) {
        PathBuf::from(custom_dir)
    } else if cfg!(debug_assertions) {
        PathBuf::from(PROJECT_ROOT).join("../../dev_assets")
    } else {
        ProjectDirs::from("media", "aphrodite", "aphrodite")
            .expect("OS didn't give us a home directory")
            .data_dir()
            .to_path_buf()
    };

    if !path.exists() {
        std::fs::create_dir_all(&path).expect("failed to create asset directory");
    }

    path
}

pub fn config_path() -> PathBuf {
    asset_dir().join("config.json")
}

/// `posters/original/{item_id}.{ext}` — the pristine poster, kept so badge
/// application is always reversible.
pub fn original_poster_path(item_id: &str, ext: &str) -> PathBuf {
    asset_dir().join("posters").join("original").join(format!("{item_id}.{ext}"))
}

/// `posters/modified/{item_id}.{ext}` — the badged poster uploaded back to
/// the media server.
pub fn modified_poster_path(item_id: &str, ext: &str) -> PathBuf {
    asset_dir().join("posters").join("modified").join(format!("{item_id}.{ext}"))
}

/// Scratch directory for one job's intermediate composition artifacts.
/// Deleted in full once the job reaches a terminal status.
pub fn job_temp_dir(job_id: uuid::Uuid) -> PathBuf {
    asset_dir().join("tmp").join(job_id.to_string())
}

pub fn ensure_parent(path: &std::path::Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}
