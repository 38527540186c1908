use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, Row, SqlitePool, sqlite::SqliteRow};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ActivityError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("activity {0} not found")]
    NotFound(Uuid),
    #[error("activity {0} already completed")]
    AlreadyCompleted(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    BadgeApplication,
    PosterReplacement,
    CustomUpload,
    Revert,
    TagManagement,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::BadgeApplication => "badge_application",
            ActivityType::PosterReplacement => "poster_replacement",
            ActivityType::CustomUpload => "custom_upload",
            ActivityType::Revert => "revert",
            ActivityType::TagManagement => "tag_management",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "badge_application" => ActivityType::BadgeApplication,
            "poster_replacement" => ActivityType::PosterReplacement,
            "custom_upload" => ActivityType::CustomUpload,
            "revert" => ActivityType::Revert,
            "tag_management" => ActivityType::TagManagement,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
pub enum InitiatedBy {
    User,
    ScheduledJob,
    BatchOperation,
    ApiCall,
    System,
}

impl InitiatedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            InitiatedBy::User => "user",
            InitiatedBy::ScheduledJob => "scheduled_job",
            InitiatedBy::BatchOperation => "batch_operation",
            InitiatedBy::ApiCall => "api_call",
            InitiatedBy::System => "system",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "user" => InitiatedBy::User,
            "scheduled_job" => InitiatedBy::ScheduledJob,
            "batch_operation" => InitiatedBy::BatchOperation,
            "api_call" => InitiatedBy::ApiCall,
            "system" => InitiatedBy::System,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Processing,
    Completed,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::Processing => "processing",
            ActivityStatus::Completed => "completed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "processing" => ActivityStatus::Processing,
            "completed" => ActivityStatus::Completed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct MediaActivity {
    pub id: Uuid,
    pub media_id: String,
    pub jellyfin_id: Option<String>,
    pub activity_type: ActivityType,
    pub activity_subtype: Option<String>,
    pub status: ActivityStatus,
    pub success: Option<bool>,
    pub initiated_by: InitiatedBy,
    pub user_id: Option<String>,
    pub batch_job_id: Option<Uuid>,
    pub parent_activity_id: Option<Uuid>,
    #[ts(type = "string")]
    pub started_at: DateTime<Utc>,
    #[ts(type = "string | null")]
    pub completed_at: Option<DateTime<Utc>>,
    pub processing_duration_ms: Option<i64>,
    pub input_parameters: Option<Value>,
    pub result_data: Option<Value>,
    pub additional_metadata: Option<Value>,
    pub error_message: Option<String>,
    pub system_version: String,
}

impl FromRow<'_, SqliteRow> for MediaActivity {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let id: String = row.try_get("id")?;
        let activity_type: String = row.try_get("activity_type")?;
        let status: String = row.try_get("status")?;
        let initiated_by: String = row.try_get("initiated_by")?;
        let batch_job_id: Option<String> = row.try_get("batch_job_id")?;
        let parent_activity_id: Option<String> = row.try_get("parent_activity_id")?;
        let input_parameters: Option<String> = row.try_get("input_parameters")?;
        let result_data: Option<String> = row.try_get("result_data")?;
        let additional_metadata: Option<String> = row.try_get("additional_metadata")?;

        Ok(MediaActivity {
            id: Uuid::parse_str(&id).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            media_id: row.try_get("media_id")?,
            jellyfin_id: row.try_get("jellyfin_id")?,
            activity_type: ActivityType::from_str(&activity_type)
                .ok_or_else(|| sqlx::Error::Decode(format!("invalid activity_type: {activity_type}").into()))?,
            activity_subtype: row.try_get("activity_subtype")?,
            status: ActivityStatus::from_str(&status)
                .ok_or_else(|| sqlx::Error::Decode(format!("invalid status: {status}").into()))?,
            success: row.try_get::<Option<i64>, _>("success")?.map(|v| v != 0),
            initiated_by: InitiatedBy::from_str(&initiated_by)
                .ok_or_else(|| sqlx::Error::Decode(format!("invalid initiated_by: {initiated_by}").into()))?,
            user_id: row.try_get("user_id")?,
            batch_job_id: batch_job_id
                .map(|s| Uuid::parse_str(&s))
                .transpose()
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            parent_activity_id: parent_activity_id
                .map(|s| Uuid::parse_str(&s))
                .transpose()
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            processing_duration_ms: row.try_get("processing_duration_ms")?,
            input_parameters: input_parameters.map(|s| serde_json::from_str(&s)).transpose().ok().flatten(),
            result_data: result_data.map(|s| serde_json::from_str(&s)).transpose().ok().flatten(),
            additional_metadata: additional_metadata.map(|s| serde_json::from_str(&s)).transpose().ok().flatten(),
            error_message: row.try_get("error_message")?,
            system_version: row.try_get("system_version")?,
        })
    }
}

pub struct StartActivity<'a> {
    pub media_id: &'a str,
    pub jellyfin_id: Option<&'a str>,
    pub activity_type: ActivityType,
    pub activity_subtype: Option<&'a str>,
    pub initiated_by: InitiatedBy,
    pub user_id: Option<&'a str>,
    pub batch_job_id: Option<Uuid>,
    pub parent_activity_id: Option<Uuid>,
    pub input_parameters: Option<Value>,
}

const SELECT_ACTIVITY: &str = "SELECT id, media_id, jellyfin_id, activity_type, activity_subtype, \
    status, success, initiated_by, user_id, batch_job_id, parent_activity_id, started_at, completed_at, \
    processing_duration_ms, input_parameters, result_data, additional_metadata, error_message, \
    system_version FROM media_activities";

impl MediaActivity {
    pub async fn start(
        pool: &SqlitePool,
        data: StartActivity<'_>,
        system_version: &str,
    ) -> Result<Uuid, ActivityError> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO media_activities (id, media_id, jellyfin_id, activity_type, activity_subtype, \
             status, initiated_by, user_id, batch_job_id, parent_activity_id, input_parameters, system_version) \
             VALUES (?, ?, ?, ?, ?, 'processing', ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(data.media_id)
        .bind(data.jellyfin_id)
        .bind(data.activity_type.as_str())
        .bind(data.activity_subtype)
        .bind(data.initiated_by.as_str())
        .bind(data.user_id)
        .bind(data.batch_job_id.map(|id| id.to_string()))
        .bind(data.parent_activity_id.map(|id| id.to_string()))
        .bind(data.input_parameters.map(|v| v.to_string()))
        .bind(system_version)
        .execute(pool)
        .await?;
        Ok(id)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<MediaActivity>, ActivityError> {
        let row = sqlx::query_as::<_, MediaActivity>(&format!("{SELECT_ACTIVITY} WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(pool)
            .await?;
        Ok(row)
    }

    /// Fills `completed_at`, `success`, `result_data`/`error_message`, and
    /// `processing_duration_ms` in one update. Idempotent guard: only rows
    /// still `processing` are affected.
    pub async fn complete(
        pool: &SqlitePool,
        id: Uuid,
        success: bool,
        result_data: Option<Value>,
        error_message: Option<&str>,
    ) -> Result<(), ActivityError> {
        let result = sqlx::query(
            "UPDATE media_activities SET status = 'completed', success = ?, result_data = ?, \
             error_message = ?, completed_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'), \
             processing_duration_ms = CAST((julianday(strftime('%Y-%m-%dT%H:%M:%fZ', 'now')) - julianday(started_at)) * 86400000 AS INTEGER) \
             WHERE id = ? AND status = 'processing'",
        )
        .bind(success as i64)
        .bind(result_data.map(|v| v.to_string()))
        .bind(error_message)
        .bind(id.to_string())
        .execute(pool)
        .await?;
        if result.rows_affected() == 0 {
            if Self::find_by_id(pool, id).await?.is_none() {
                return Err(ActivityError::NotFound(id));
            }
            return Err(ActivityError::AlreadyCompleted(id));
        }
        Ok(())
    }

    pub async fn fail(pool: &SqlitePool, id: Uuid, error_message: &str) -> Result<(), ActivityError> {
        Self::complete(pool, id, false, None, Some(error_message)).await
    }

    pub async fn exists(pool: &SqlitePool, id: Uuid) -> Result<bool, ActivityError> {
        Ok(Self::find_by_id(pool, id).await?.is_some())
    }
}
