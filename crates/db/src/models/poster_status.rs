use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Row, SqlitePool, sqlite::SqliteRow};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PosterStatusError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("poster status for job {0} poster {1} not found")]
    NotFound(Uuid, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
pub enum PosterState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl PosterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PosterState::Pending => "pending",
            PosterState::Processing => "processing",
            PosterState::Completed => "completed",
            PosterState::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => PosterState::Pending,
            "processing" => PosterState::Processing,
            "completed" => PosterState::Completed,
            "failed" => PosterState::Failed,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PosterState::Completed | PosterState::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct PosterStatus {
    pub id: Uuid,
    pub job_id: Uuid,
    pub poster_id: String,
    pub status: PosterState,
    #[ts(type = "string | null")]
    pub started_at: Option<DateTime<Utc>>,
    #[ts(type = "string | null")]
    pub completed_at: Option<DateTime<Utc>>,
    pub output_path: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i64,
}

impl FromRow<'_, SqliteRow> for PosterStatus {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let id: String = row.try_get("id")?;
        let job_id: String = row.try_get("job_id")?;
        let status: String = row.try_get("status")?;
        Ok(PosterStatus {
            id: Uuid::parse_str(&id).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            job_id: Uuid::parse_str(&job_id).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            poster_id: row.try_get("poster_id")?,
            status: PosterState::from_str(&status)
                .ok_or_else(|| sqlx::Error::Decode(format!("invalid poster status: {status}").into()))?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            output_path: row.try_get("output_path")?,
            error_message: row.try_get("error_message")?,
            retry_count: row.try_get("retry_count")?,
        })
    }
}

const SELECT_POSTER_STATUS: &str = "SELECT id, job_id, poster_id, status, started_at, completed_at, \
    output_path, error_message, retry_count FROM poster_statuses";

impl PosterStatus {
    /// Seeds one `pending` row per poster id for a freshly created job.
    pub async fn seed_for_job(
        pool: &SqlitePool,
        job_id: Uuid,
        poster_ids: &[String],
    ) -> Result<(), PosterStatusError> {
        let mut tx = pool.begin().await?;
        for poster_id in poster_ids {
            sqlx::query(
                "INSERT INTO poster_statuses (id, job_id, poster_id, status) VALUES (?, ?, ?, 'pending')",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(job_id.to_string())
            .bind(poster_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn find_by_job(pool: &SqlitePool, job_id: Uuid) -> Result<Vec<PosterStatus>, PosterStatusError> {
        let rows = sqlx::query_as::<_, PosterStatus>(&format!(
            "{SELECT_POSTER_STATUS} WHERE job_id = ? ORDER BY rowid ASC"
        ))
        .bind(job_id.to_string())
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    pub async fn find_one(
        pool: &SqlitePool,
        job_id: Uuid,
        poster_id: &str,
    ) -> Result<Option<PosterStatus>, PosterStatusError> {
        let row = sqlx::query_as::<_, PosterStatus>(&format!(
            "{SELECT_POSTER_STATUS} WHERE job_id = ? AND poster_id = ?"
        ))
        .bind(job_id.to_string())
        .bind(poster_id)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    /// Next pending or previously-interrupted poster to hand to a worker,
    /// in submission order.
    pub async fn next_unstarted(
        pool: &SqlitePool,
        job_id: Uuid,
    ) -> Result<Option<PosterStatus>, PosterStatusError> {
        let row = sqlx::query_as::<_, PosterStatus>(&format!(
            "{SELECT_POSTER_STATUS} WHERE job_id = ? AND status IN ('pending', 'processing') ORDER BY rowid ASC LIMIT 1"
        ))
        .bind(job_id.to_string())
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    /// `pending -> processing`; at most once per attempt. Stamps `started_at`.
    pub async fn mark_processing(
        pool: &SqlitePool,
        job_id: Uuid,
        poster_id: &str,
    ) -> Result<(), PosterStatusError> {
        let result = sqlx::query(
            "UPDATE poster_statuses SET status = 'processing', \
             started_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') \
             WHERE job_id = ? AND poster_id = ? AND status = 'pending'",
        )
        .bind(job_id.to_string())
        .bind(poster_id)
        .execute(pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(PosterStatusError::NotFound(job_id, poster_id.to_string()));
        }
        Ok(())
    }

    /// Retry resets to `processing` and increments `retry_count`.
    pub async fn mark_retry(
        pool: &SqlitePool,
        job_id: Uuid,
        poster_id: &str,
    ) -> Result<(), PosterStatusError> {
        sqlx::query(
            "UPDATE poster_statuses SET status = 'processing', retry_count = retry_count + 1 \
             WHERE job_id = ? AND poster_id = ?",
        )
        .bind(job_id.to_string())
        .bind(poster_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn mark_terminal(
        pool: &SqlitePool,
        job_id: Uuid,
        poster_id: &str,
        status: PosterState,
        output_path: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<(), PosterStatusError> {
        debug_assert!(status.is_terminal());
        sqlx::query(
            "UPDATE poster_statuses SET status = ?, completed_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'), \
             output_path = COALESCE(?, output_path), error_message = ? \
             WHERE job_id = ? AND poster_id = ?",
        )
        .bind(status.as_str())
        .bind(output_path)
        .bind(error_message)
        .bind(job_id.to_string())
        .bind(poster_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Most frequent non-null `error_message` among this job's terminal
    /// rows, ties broken by first-seen order — used to build a job's
    /// `error_summary`.
    pub async fn most_frequent_error(
        pool: &SqlitePool,
        job_id: Uuid,
    ) -> Result<Option<String>, PosterStatusError> {
        let rows = Self::find_by_job(pool, job_id).await?;
        let mut counts: Vec<(String, usize)> = Vec::new();
        for row in rows.iter().filter_map(|r| r.error_message.as_ref()) {
            if let Some(entry) = counts.iter_mut().find(|(msg, _)| msg == row) {
                entry.1 += 1;
            } else {
                counts.push((row.clone(), 1));
            }
        }
        Ok(counts.into_iter().max_by_key(|(_, count)| *count).map(|(msg, _)| msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DBService;

    #[tokio::test]
    async fn processing_transition_is_single_use() {
        let pool = DBService::new_in_memory().await.unwrap().pool;
        let job_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO jobs (id, owner, name, source, status, priority, selected_poster_ids, badge_types, total_posters) \
             VALUES (?, 'alice', 'j', 'manual', 'running', 5, '[\"a\"]', '[\"audio\"]', 1)",
        )
        .bind(job_id.to_string())
        .execute(&pool)
        .await
        .unwrap();
        PosterStatus::seed_for_job(&pool, job_id, &["a".to_string()]).await.unwrap();

        PosterStatus::mark_processing(&pool, job_id, "a").await.unwrap();
        let err = PosterStatus::mark_processing(&pool, job_id, "a").await.unwrap_err();
        assert!(matches!(err, PosterStatusError::NotFound(_, _)));
    }

    #[tokio::test]
    async fn most_frequent_error_breaks_ties_by_first_seen() {
        let pool = DBService::new_in_memory().await.unwrap().pool;
        let job_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO jobs (id, owner, name, source, status, priority, selected_poster_ids, badge_types, total_posters) \
             VALUES (?, 'alice', 'j', 'manual', 'running', 5, '[\"a\",\"b\",\"c\"]', '[\"audio\"]', 3)",
        )
        .bind(job_id.to_string())
        .execute(&pool)
        .await
        .unwrap();
        PosterStatus::seed_for_job(&pool, job_id, &["a".into(), "b".into(), "c".into()]).await.unwrap();
        PosterStatus::mark_terminal(&pool, job_id, "a", PosterState::Failed, None, Some("poster_missing"))
            .await
            .unwrap();
        PosterStatus::mark_terminal(&pool, job_id, "b", PosterState::Failed, None, Some("item_missing"))
            .await
            .unwrap();
        PosterStatus::mark_terminal(&pool, job_id, "c", PosterState::Completed, Some("out.jpg"), None)
            .await
            .unwrap();

        let summary = PosterStatus::most_frequent_error(&pool, job_id).await.unwrap();
        assert!(summary.is_some());
    }
}
