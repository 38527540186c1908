use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Row, SqlitePool, sqlite::SqliteRow};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

use super::job::BadgeType;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("schedule {0} not found")]
    NotFound(Uuid),
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct Schedule {
    pub id: Uuid,
    pub name: String,
    pub cron_expression: String,
    pub timezone: String,
    pub target_library_ids: Vec<String>,
    pub badge_types: Vec<BadgeType>,
    pub reprocess_all: bool,
    pub enabled: bool,
    #[ts(type = "string | null")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[ts(type = "string | null")]
    pub next_run_at: Option<DateTime<Utc>>,
}

impl FromRow<'_, SqliteRow> for Schedule {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let id: String = row.try_get("id")?;
        let library_ids: String = row.try_get("target_library_ids")?;
        let badge_types: String = row.try_get("badge_types")?;
        Ok(Schedule {
            id: Uuid::parse_str(&id).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            name: row.try_get("name")?,
            cron_expression: row.try_get("cron_expression")?,
            timezone: row.try_get("timezone")?,
            target_library_ids: serde_json::from_str(&library_ids)
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            badge_types: serde_json::from_str::<Vec<String>>(&badge_types)
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?
                .into_iter()
                .filter_map(|s| BadgeType::from_str(&s))
                .collect(),
            reprocess_all: row.try_get::<i64, _>("reprocess_all")? != 0,
            enabled: row.try_get::<i64, _>("enabled")? != 0,
            last_run_at: row.try_get("last_run_at")?,
            next_run_at: row.try_get("next_run_at")?,
        })
    }
}

pub struct CreateSchedule {
    pub name: String,
    pub cron_expression: String,
    pub timezone: String,
    pub target_library_ids: Vec<String>,
    pub badge_types: Vec<BadgeType>,
    pub reprocess_all: bool,
}

const SELECT_SCHEDULE: &str = "SELECT id, name, cron_expression, timezone, target_library_ids, \
    badge_types, reprocess_all, enabled, last_run_at, next_run_at FROM schedules";

impl Schedule {
    pub async fn create(pool: &SqlitePool, data: CreateSchedule) -> Result<Schedule, ScheduleError> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO schedules (id, name, cron_expression, timezone, target_library_ids, \
             badge_types, reprocess_all, enabled) VALUES (?, ?, ?, ?, ?, ?, ?, 1)",
        )
        .bind(id.to_string())
        .bind(&data.name)
        .bind(&data.cron_expression)
        .bind(&data.timezone)
        .bind(serde_json::to_string(&data.target_library_ids).unwrap())
        .bind(serde_json::to_string(&data.badge_types.iter().map(|b| b.as_str()).collect::<Vec<_>>()).unwrap())
        .bind(data.reprocess_all as i64)
        .execute(pool)
        .await?;
        Self::find_by_id(pool, id).await?.ok_or(ScheduleError::NotFound(id))
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Schedule>, ScheduleError> {
        let row = sqlx::query_as::<_, Schedule>(&format!("{SELECT_SCHEDULE} WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(pool)
            .await?;
        Ok(row)
    }

    pub async fn list_all(pool: &SqlitePool) -> Result<Vec<Schedule>, ScheduleError> {
        let rows = sqlx::query_as::<_, Schedule>(&format!("{SELECT_SCHEDULE} ORDER BY name ASC"))
            .fetch_all(pool)
            .await?;
        Ok(rows)
    }

    pub async fn list_enabled(pool: &SqlitePool) -> Result<Vec<Schedule>, ScheduleError> {
        let rows = sqlx::query_as::<_, Schedule>(&format!("{SELECT_SCHEDULE} WHERE enabled = 1"))
            .fetch_all(pool)
            .await?;
        Ok(rows)
    }

    pub async fn update(pool: &SqlitePool, id: Uuid, data: CreateSchedule) -> Result<Schedule, ScheduleError> {
        sqlx::query(
            "UPDATE schedules SET name = ?, cron_expression = ?, timezone = ?, target_library_ids = ?, \
             badge_types = ?, reprocess_all = ? WHERE id = ?",
        )
        .bind(&data.name)
        .bind(&data.cron_expression)
        .bind(&data.timezone)
        .bind(serde_json::to_string(&data.target_library_ids).unwrap())
        .bind(serde_json::to_string(&data.badge_types.iter().map(|b| b.as_str()).collect::<Vec<_>>()).unwrap())
        .bind(data.reprocess_all as i64)
        .bind(id.to_string())
        .execute(pool)
        .await?;
        Self::find_by_id(pool, id).await?.ok_or(ScheduleError::NotFound(id))
    }

    pub async fn set_enabled(pool: &SqlitePool, id: Uuid, enabled: bool) -> Result<(), ScheduleError> {
        sqlx::query("UPDATE schedules SET enabled = ? WHERE id = ?")
            .bind(enabled as i64)
            .bind(id.to_string())
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<(), ScheduleError> {
        sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(id.to_string())
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn record_run(
        pool: &SqlitePool,
        id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), ScheduleError> {
        sqlx::query("UPDATE schedules SET last_run_at = ?, next_run_at = ? WHERE id = ?")
            .bind(last_run_at)
            .bind(next_run_at)
            .bind(id.to_string())
            .execute(pool)
            .await?;
        Ok(())
    }
}
