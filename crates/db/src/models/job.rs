use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Row, SqlitePool, sqlite::SqliteRow};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("invalid transition: job {0} is {1}, cannot {2}")]
    InvalidTransition(Uuid, JobStatus, &'static str),
    #[error("poster list must not be empty")]
    EmptyPosterList,
    #[error("unknown badge type: {0}")]
    UnknownBadgeType(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
pub enum JobSource {
    Manual,
    Scheduled,
}

impl JobSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobSource::Manual => "manual",
            JobSource::Scheduled => "scheduled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(JobSource::Manual),
            "scheduled" => Some(JobSource::Scheduled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => JobStatus::Queued,
            "running" => JobStatus::Running,
            "paused" => JobStatus::Paused,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "cancelled" => JobStatus::Cancelled,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
pub enum BadgeType {
    Audio,
    Resolution,
    Review,
    Awards,
}

impl BadgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BadgeType::Audio => "audio",
            BadgeType::Resolution => "resolution",
            BadgeType::Review => "review",
            BadgeType::Awards => "awards",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "audio" => BadgeType::Audio,
            "resolution" => BadgeType::Resolution,
            "review" => BadgeType::Review,
            "awards" => BadgeType::Awards,
            _ => return None,
        })
    }
}

pub const MAX_POSTERS_PER_JOB: usize = 1000;
pub const DEFAULT_PRIORITY: i64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct Job {
    pub id: Uuid,
    pub owner: String,
    pub name: String,
    pub source: JobSource,
    pub status: JobStatus,
    pub priority: i64,
    pub selected_poster_ids: Vec<String>,
    pub badge_types: Vec<BadgeType>,
    pub total_posters: i64,
    pub completed_posters: i64,
    pub failed_posters: i64,
    pub error_summary: Option<String>,
    #[ts(type = "string")]
    pub created_at: DateTime<Utc>,
    #[ts(type = "string | null")]
    pub started_at: Option<DateTime<Utc>>,
    #[ts(type = "string | null")]
    pub completed_at: Option<DateTime<Utc>>,
    #[ts(type = "string | null")]
    pub estimated_completion: Option<DateTime<Utc>>,
}

impl FromRow<'_, SqliteRow> for Job {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let id: String = row.try_get("id")?;
        let status: String = row.try_get("status")?;
        let source: String = row.try_get("source")?;
        let poster_ids: String = row.try_get("selected_poster_ids")?;
        let badge_types: String = row.try_get("badge_types")?;

        Ok(Job {
            id: Uuid::parse_str(&id).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            owner: row.try_get("owner")?,
            name: row.try_get("name")?,
            source: JobSource::from_str(&source)
                .ok_or_else(|| sqlx::Error::Decode(format!("invalid job source: {source}").into()))?,
            status: JobStatus::from_str(&status)
                .ok_or_else(|| sqlx::Error::Decode(format!("invalid job status: {status}").into()))?,
            priority: row.try_get("priority")?,
            selected_poster_ids: serde_json::from_str(&poster_ids)
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            badge_types: serde_json::from_str::<Vec<String>>(&badge_types)
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?
                .into_iter()
                .filter_map(|s| BadgeType::from_str(&s))
                .collect(),
            total_posters: row.try_get("total_posters")?,
            completed_posters: row.try_get("completed_posters")?,
            failed_posters: row.try_get("failed_posters")?,
            error_summary: row.try_get("error_summary")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            estimated_completion: row.try_get("estimated_completion")?,
        })
    }
}

pub struct CreateJob {
    pub owner: String,
    pub name: String,
    pub source: JobSource,
    pub priority: i64,
    pub selected_poster_ids: Vec<String>,
    pub badge_types: Vec<BadgeType>,
}

const SELECT_JOB: &str = "SELECT id, owner, name, source, status, priority, selected_poster_ids, \
    badge_types, total_posters, completed_posters, failed_posters, error_summary, created_at, \
    started_at, completed_at, estimated_completion FROM jobs";

impl Job {
    pub async fn create(pool: &SqlitePool, data: CreateJob) -> Result<Job, JobError> {
        if data.selected_poster_ids.is_empty() {
            return Err(JobError::EmptyPosterList);
        }
        let id = Uuid::new_v4();
        let poster_ids_json = serde_json::to_string(&data.selected_poster_ids).unwrap();
        let badge_types_json =
            serde_json::to_string(&data.badge_types.iter().map(|b| b.as_str()).collect::<Vec<_>>())
                .unwrap();
        let total = data.selected_poster_ids.len() as i64;

        sqlx::query(
            "INSERT INTO jobs (id, owner, name, source, status, priority, selected_poster_ids, \
             badge_types, total_posters) VALUES (?, ?, ?, ?, 'queued', ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(&data.owner)
        .bind(&data.name)
        .bind(data.source.as_str())
        .bind(data.priority)
        .bind(&poster_ids_json)
        .bind(&badge_types_json)
        .bind(total)
        .execute(pool)
        .await?;

        Self::find_by_id(pool, id).await?.ok_or(JobError::NotFound(id))
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Job>, JobError> {
        let row = sqlx::query_as::<_, Job>(&format!("{SELECT_JOB} WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(pool)
            .await?;
        Ok(row)
    }

    pub async fn list_for_owner(
        pool: &SqlitePool,
        owner: &str,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, JobError> {
        let rows = if let Some(status) = status {
            sqlx::query_as::<_, Job>(&format!(
                "{SELECT_JOB} WHERE owner = ? AND status = ? ORDER BY created_at DESC"
            ))
            .bind(owner)
            .bind(status.as_str())
            .fetch_all(pool)
            .await?
        } else {
            sqlx::query_as::<_, Job>(&format!("{SELECT_JOB} WHERE owner = ? ORDER BY created_at DESC"))
                .bind(owner)
                .fetch_all(pool)
                .await?
        };
        Ok(rows)
    }

    /// Selects by `(priority ASC, created_at ASC)` among queued jobs.
    pub async fn next_queued(pool: &SqlitePool) -> Result<Option<Job>, JobError> {
        let row = sqlx::query_as::<_, Job>(&format!(
            "{SELECT_JOB} WHERE status = 'queued' ORDER BY priority ASC, created_at ASC LIMIT 1"
        ))
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    pub async fn mark_running(pool: &SqlitePool, id: Uuid) -> Result<(), JobError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'running', started_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') \
             WHERE id = ? AND status = 'queued'",
        )
        .bind(id.to_string())
        .execute(pool)
        .await?;
        if result.rows_affected() == 0 {
            let current = Self::find_by_id(pool, id).await?.ok_or(JobError::NotFound(id))?;
            return Err(JobError::InvalidTransition(id, current.status, "start running"));
        }
        Ok(())
    }

    pub async fn pause(pool: &SqlitePool, id: Uuid) -> Result<(), JobError> {
        Self::guarded_transition(pool, id, &["running"], "paused", "pause").await
    }

    pub async fn resume(pool: &SqlitePool, id: Uuid) -> Result<(), JobError> {
        Self::guarded_transition(pool, id, &["paused"], "queued", "resume").await
    }

    /// Cancel is allowed from any non-terminal state.
    pub async fn cancel(pool: &SqlitePool, id: Uuid) -> Result<(), JobError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'cancelled', completed_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') \
             WHERE id = ? AND status IN ('queued', 'running', 'paused')",
        )
        .bind(id.to_string())
        .execute(pool)
        .await?;
        if result.rows_affected() == 0 {
            let current = Self::find_by_id(pool, id).await?.ok_or(JobError::NotFound(id))?;
            return Err(JobError::InvalidTransition(id, current.status, "cancel"));
        }
        Ok(())
    }

    /// Restart clears `error_summary` and re-queues; allowed from `queued`
    /// (stuck) or `failed`. Does not reset poster rows.
    pub async fn restart(pool: &SqlitePool, id: Uuid) -> Result<(), JobError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'queued', error_summary = NULL, completed_at = NULL \
             WHERE id = ? AND status IN ('queued', 'failed')",
        )
        .bind(id.to_string())
        .execute(pool)
        .await?;
        if result.rows_affected() == 0 {
            let current = Self::find_by_id(pool, id).await?.ok_or(JobError::NotFound(id))?;
            return Err(JobError::InvalidTransition(id, current.status, "restart"));
        }
        Ok(())
    }

    async fn guarded_transition(
        pool: &SqlitePool,
        id: Uuid,
        from: &[&str],
        to: &str,
        action: &'static str,
    ) -> Result<(), JobError> {
        let placeholders = from.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!("UPDATE jobs SET status = ? WHERE id = ? AND status IN ({placeholders})");
        let mut query = sqlx::query(&sql).bind(to).bind(id.to_string());
        for state in from {
            query = query.bind(*state);
        }
        let result = query.execute(pool).await?;
        if result.rows_affected() == 0 {
            let current = Self::find_by_id(pool, id).await?.ok_or(JobError::NotFound(id))?;
            return Err(JobError::InvalidTransition(id, current.status, action));
        }
        Ok(())
    }

    /// Marks the job terminal once every poster row is terminal. Per the
    /// spec there is no distinct `completed_with_errors` job status: a job
    /// with failures is `completed` with a non-empty `error_summary`.
    pub async fn mark_completed(
        pool: &SqlitePool,
        id: Uuid,
        error_summary: Option<&str>,
    ) -> Result<(), JobError> {
        sqlx::query(
            "UPDATE jobs SET status = 'completed', completed_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'), \
             error_summary = ? WHERE id = ? AND status = 'running'",
        )
        .bind(error_summary)
        .bind(id.to_string())
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(pool: &SqlitePool, id: Uuid, error_summary: &str) -> Result<(), JobError> {
        sqlx::query(
            "UPDATE jobs SET status = 'failed', completed_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'), \
             error_summary = ? WHERE id = ?",
        )
        .bind(error_summary)
        .bind(id.to_string())
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn increment_completed(pool: &SqlitePool, id: Uuid) -> Result<(), JobError> {
        sqlx::query("UPDATE jobs SET completed_posters = completed_posters + 1 WHERE id = ?")
            .bind(id.to_string())
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn increment_failed(pool: &SqlitePool, id: Uuid) -> Result<(), JobError> {
        sqlx::query("UPDATE jobs SET failed_posters = failed_posters + 1 WHERE id = ?")
            .bind(id.to_string())
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn set_estimated_completion(
        pool: &SqlitePool,
        id: Uuid,
        eta: Option<DateTime<Utc>>,
    ) -> Result<(), JobError> {
        sqlx::query("UPDATE jobs SET estimated_completion = ? WHERE id = ?")
            .bind(eta)
            .bind(id.to_string())
            .execute(pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pool() -> SqlitePool {
        crate::DBService::new_in_memory().await.unwrap().pool
    }

    #[tokio::test]
    async fn create_rejects_empty_poster_list() {
        let pool = pool().await;
        let err = Job::create(
            &pool,
            CreateJob {
                owner: "alice".into(),
                name: "empty".into(),
                source: JobSource::Manual,
                priority: DEFAULT_PRIORITY,
                selected_poster_ids: vec![],
                badge_types: vec![BadgeType::Audio],
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, JobError::EmptyPosterList));
    }

    #[tokio::test]
    async fn priority_then_fifo_ordering() {
        let pool = pool().await;
        let j2 = Job::create(
            &pool,
            CreateJob {
                owner: "alice".into(),
                name: "low priority, created first".into(),
                source: JobSource::Manual,
                priority: 5,
                selected_poster_ids: vec!["a".into()],
                badge_types: vec![BadgeType::Audio],
            },
        )
        .await
        .unwrap();
        let j1 = Job::create(
            &pool,
            CreateJob {
                owner: "alice".into(),
                name: "high priority, created second".into(),
                source: JobSource::Manual,
                priority: 2,
                selected_poster_ids: vec!["b".into()],
                badge_types: vec![BadgeType::Audio],
            },
        )
        .await
        .unwrap();

        let next = Job::next_queued(&pool).await.unwrap().unwrap();
        assert_eq!(next.id, j1.id);
        assert_ne!(next.id, j2.id);
    }

    #[tokio::test]
    async fn restart_clears_error_summary_and_requeues() {
        let pool = pool().await;
        let job = Job::create(
            &pool,
            CreateJob {
                owner: "alice".into(),
                name: "retry me".into(),
                source: JobSource::Manual,
                priority: DEFAULT_PRIORITY,
                selected_poster_ids: vec!["a".into()],
                badge_types: vec![BadgeType::Audio],
            },
        )
        .await
        .unwrap();
        Job::mark_running(&pool, job.id).await.unwrap();
        Job::mark_failed(&pool, job.id, "poster_missing").await.unwrap();

        Job::restart(&pool, job.id).await.unwrap();
        let reloaded = Job::find_by_id(&pool, job.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Queued);
        assert_eq!(reloaded.error_summary, None);
    }
}
