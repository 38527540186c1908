use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

use super::media_activity::MediaActivity;

#[derive(Debug, Error)]
pub enum DetailError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("parent activity {0} does not exist; refusing to record orphan detail row")]
    OrphanParent(Uuid),
}

async fn require_parent(pool: &SqlitePool, activity_id: Uuid) -> Result<(), DetailError> {
    if !MediaActivity::exists(pool, activity_id).await.map_err(|_| DetailError::OrphanParent(activity_id))? {
        return Err(DetailError::OrphanParent(activity_id));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct PerBadgeResult {
    pub kind: String,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct BadgeApplicationDetail {
    pub activity_id: Uuid,
    pub badge_types: Vec<String>,
    pub settings_snapshot: Option<Value>,
    pub input_path: Option<String>,
    pub output_path: Option<String>,
    pub intermediate_paths: Vec<String>,
    pub per_badge_results: Vec<PerBadgeResult>,
    pub final_width: Option<i64>,
    pub final_height: Option<i64>,
    pub final_size_bytes: Option<i64>,
    pub stage_timings_ms: Option<Value>,
}

impl BadgeApplicationDetail {
    pub async fn log(pool: &SqlitePool, detail: &BadgeApplicationDetail) -> Result<(), DetailError> {
        require_parent(pool, detail.activity_id).await?;
        sqlx::query(
            "INSERT INTO badge_applications (activity_id, badge_types, settings_snapshot, input_path, \
             output_path, intermediate_paths, per_badge_results, final_width, final_height, \
             final_size_bytes, stage_timings_ms) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(detail.activity_id.to_string())
        .bind(serde_json::to_string(&detail.badge_types).unwrap())
        .bind(detail.settings_snapshot.as_ref().map(|v| v.to_string()))
        .bind(&detail.input_path)
        .bind(&detail.output_path)
        .bind(serde_json::to_string(&detail.intermediate_paths).unwrap())
        .bind(serde_json::to_string(&detail.per_badge_results).unwrap())
        .bind(detail.final_width)
        .bind(detail.final_height)
        .bind(detail.final_size_bytes)
        .bind(detail.stage_timings_ms.as_ref().map(|v| v.to_string()))
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct PosterReplacementDetail {
    pub activity_id: Uuid,
    pub source: String,
    pub source_id: Option<String>,
    pub search_query: Option<String>,
    pub search_result_count: Option<i64>,
    pub original_hash: Option<String>,
    pub original_width: Option<i64>,
    pub original_height: Option<i64>,
    pub original_size_bytes: Option<i64>,
    pub new_hash: Option<String>,
    pub new_width: Option<i64>,
    pub new_height: Option<i64>,
    pub new_size_bytes: Option<i64>,
    pub download_ms: Option<i64>,
    pub upload_ms: Option<i64>,
    pub tag_operations: Vec<String>,
    pub quality_score: Option<f64>,
}

impl PosterReplacementDetail {
    pub async fn log(pool: &SqlitePool, detail: &PosterReplacementDetail) -> Result<(), DetailError> {
        require_parent(pool, detail.activity_id).await?;
        sqlx::query(
            "INSERT INTO poster_replacements (activity_id, source, source_id, search_query, \
             search_result_count, original_hash, original_width, original_height, original_size_bytes, \
             new_hash, new_width, new_height, new_size_bytes, download_ms, upload_ms, tag_operations, \
             quality_score) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(detail.activity_id.to_string())
        .bind(&detail.source)
        .bind(&detail.source_id)
        .bind(&detail.search_query)
        .bind(detail.search_result_count)
        .bind(&detail.original_hash)
        .bind(detail.original_width)
        .bind(detail.original_height)
        .bind(detail.original_size_bytes)
        .bind(&detail.new_hash)
        .bind(detail.new_width)
        .bind(detail.new_height)
        .bind(detail.new_size_bytes)
        .bind(detail.download_ms)
        .bind(detail.upload_ms)
        .bind(serde_json::to_string(&detail.tag_operations).unwrap())
        .bind(detail.quality_score)
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct PerformanceMetricDetail {
    pub activity_id: Uuid,
    pub peak_cpu_percent: Option<f64>,
    pub peak_memory_mb: Option<f64>,
    pub disk_read_bytes: Option<i64>,
    pub disk_write_bytes: Option<i64>,
    pub network_read_bytes: Option<i64>,
    pub network_write_bytes: Option<i64>,
    pub stage_timings_ms: Option<Value>,
    pub bottleneck_stage: Option<String>,
    pub concurrent_operations: Option<i64>,
}

impl PerformanceMetricDetail {
    pub async fn log(pool: &SqlitePool, detail: &PerformanceMetricDetail) -> Result<(), DetailError> {
        require_parent(pool, detail.activity_id).await?;
        sqlx::query(
            "INSERT INTO performance_metrics (activity_id, peak_cpu_percent, peak_memory_mb, \
             disk_read_bytes, disk_write_bytes, network_read_bytes, network_write_bytes, \
             stage_timings_ms, bottleneck_stage, concurrent_operations) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(detail.activity_id.to_string())
        .bind(detail.peak_cpu_percent)
        .bind(detail.peak_memory_mb)
        .bind(detail.disk_read_bytes)
        .bind(detail.disk_write_bytes)
        .bind(detail.network_read_bytes)
        .bind(detail.network_write_bytes)
        .bind(detail.stage_timings_ms.as_ref().map(|v| v.to_string()))
        .bind(&detail.bottleneck_stage)
        .bind(detail.concurrent_operations)
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DBService;
    use crate::models::media_activity::{ActivityType, InitiatedBy, StartActivity};

    #[tokio::test]
    async fn detail_insert_rejects_orphan_parent() {
        let pool = DBService::new_in_memory().await.unwrap().pool;
        let err = BadgeApplicationDetail::log(
            &pool,
            &BadgeApplicationDetail {
                activity_id: Uuid::new_v4(),
                badge_types: vec!["audio".into()],
                settings_snapshot: None,
                input_path: None,
                output_path: None,
                intermediate_paths: vec![],
                per_badge_results: vec![],
                final_width: None,
                final_height: None,
                final_size_bytes: None,
                stage_timings_ms: None,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DetailError::OrphanParent(_)));
    }

    #[tokio::test]
    async fn detail_insert_succeeds_with_real_parent() {
        let pool = DBService::new_in_memory().await.unwrap().pool;
        let activity_id = MediaActivity::start(
            &pool,
            StartActivity {
                media_id: "item-1",
                jellyfin_id: Some("item-1"),
                activity_type: ActivityType::BadgeApplication,
                activity_subtype: None,
                initiated_by: InitiatedBy::User,
                user_id: Some("alice"),
                batch_job_id: None,
                parent_activity_id: None,
                input_parameters: None,
            },
            "0.1.0",
        )
        .await
        .unwrap();

        BadgeApplicationDetail::log(
            &pool,
            &BadgeApplicationDetail {
                activity_id,
                badge_types: vec!["audio".into()],
                settings_snapshot: None,
                input_path: None,
                output_path: Some("posters/modified/item-1.jpg".into()),
                intermediate_paths: vec![],
                per_badge_results: vec![PerBadgeResult {
                    kind: "audio".into(),
                    success: true,
                    error: None,
                }],
                final_width: Some(1000),
                final_height: Some(1500),
                final_size_bytes: Some(204800),
                stage_timings_ms: None,
            },
        )
        .await
        .unwrap();
    }
}
