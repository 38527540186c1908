use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Row, SqlitePool, sqlite::SqliteRow};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ScheduleExecutionError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("schedule execution {0} not found")]
    NotFound(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleExecutionStatus {
    Pending,
    Processing,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl ScheduleExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleExecutionStatus::Pending => "pending",
            ScheduleExecutionStatus::Processing => "processing",
            ScheduleExecutionStatus::Completed => "completed",
            ScheduleExecutionStatus::CompletedWithErrors => "completed_with_errors",
            ScheduleExecutionStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => ScheduleExecutionStatus::Pending,
            "processing" => ScheduleExecutionStatus::Processing,
            "completed" => ScheduleExecutionStatus::Completed,
            "completed_with_errors" => ScheduleExecutionStatus::CompletedWithErrors,
            "failed" => ScheduleExecutionStatus::Failed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
pub struct ItemsProcessed {
    pub total_seen: i64,
    pub enqueued: i64,
    pub skipped: i64,
    pub created_job_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct ScheduleExecution {
    pub id: Uuid,
    pub schedule_id: Uuid,
    pub status: ScheduleExecutionStatus,
    pub items_processed: Option<ItemsProcessed>,
    pub error_message: Option<String>,
    #[ts(type = "string")]
    pub created_at: DateTime<Utc>,
    #[ts(type = "string | null")]
    pub started_at: Option<DateTime<Utc>>,
    #[ts(type = "string | null")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl FromRow<'_, SqliteRow> for ScheduleExecution {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let id: String = row.try_get("id")?;
        let schedule_id: String = row.try_get("schedule_id")?;
        let status: String = row.try_get("status")?;
        let items_processed: Option<String> = row.try_get("items_processed")?;
        Ok(ScheduleExecution {
            id: Uuid::parse_str(&id).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            schedule_id: Uuid::parse_str(&schedule_id).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            status: ScheduleExecutionStatus::from_str(&status)
                .ok_or_else(|| sqlx::Error::Decode(format!("invalid execution status: {status}").into()))?,
            items_processed: items_processed
                .map(|json| serde_json::from_str(&json))
                .transpose()
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

const SELECT_EXECUTION: &str = "SELECT id, schedule_id, status, items_processed, error_message, \
    created_at, started_at, completed_at FROM schedule_executions";

impl ScheduleExecution {
    pub async fn create(
        pool: &SqlitePool,
        schedule_id: Uuid,
    ) -> Result<ScheduleExecution, ScheduleExecutionError> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO schedule_executions (id, schedule_id, status, started_at) \
             VALUES (?, ?, 'processing', strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))",
        )
        .bind(id.to_string())
        .bind(schedule_id.to_string())
        .execute(pool)
        .await?;
        Self::find_by_id(pool, id).await?.ok_or(ScheduleExecutionError::NotFound(id))
    }

    pub async fn find_by_id(
        pool: &SqlitePool,
        id: Uuid,
    ) -> Result<Option<ScheduleExecution>, ScheduleExecutionError> {
        let row = sqlx::query_as::<_, ScheduleExecution>(&format!("{SELECT_EXECUTION} WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(pool)
            .await?;
        Ok(row)
    }

    /// Any execution for `schedule_id` created within `[window_start, window_end]`.
    pub async fn exists_in_window(
        pool: &SqlitePool,
        schedule_id: Uuid,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<bool, ScheduleExecutionError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM schedule_executions WHERE schedule_id = ? AND created_at BETWEEN ? AND ? LIMIT 1",
        )
        .bind(schedule_id.to_string())
        .bind(window_start)
        .bind(window_end)
        .fetch_optional(pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn history(
        pool: &SqlitePool,
        schedule_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<ScheduleExecution>, ScheduleExecutionError> {
        let rows = if let Some(schedule_id) = schedule_id {
            sqlx::query_as::<_, ScheduleExecution>(&format!(
                "{SELECT_EXECUTION} WHERE schedule_id = ? ORDER BY created_at DESC LIMIT ?"
            ))
            .bind(schedule_id.to_string())
            .bind(limit)
            .fetch_all(pool)
            .await?
        } else {
            sqlx::query_as::<_, ScheduleExecution>(&format!("{SELECT_EXECUTION} ORDER BY created_at DESC LIMIT ?"))
                .bind(limit)
                .fetch_all(pool)
                .await?
        };
        Ok(rows)
    }

    pub async fn complete(
        pool: &SqlitePool,
        id: Uuid,
        status: ScheduleExecutionStatus,
        items_processed: &ItemsProcessed,
        error_message: Option<&str>,
    ) -> Result<(), ScheduleExecutionError> {
        sqlx::query(
            "UPDATE schedule_executions SET status = ?, items_processed = ?, error_message = ?, \
             completed_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(serde_json::to_string(items_processed).unwrap())
        .bind(error_message)
        .bind(id.to_string())
        .execute(pool)
        .await?;
        Ok(())
    }
}
