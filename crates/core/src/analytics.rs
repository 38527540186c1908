//! Analytics (C9): read-only filtering and aggregation over the activity
//! log. Filtering is pushed into SQL via a dynamic `QueryBuilder`; summary
//! rollups and histograms are computed over the fetched rows in plain Rust
//! rather than pushed further into SQL, trading a SQL aggregate query for
//! simpler correctness at the row counts this store actually sees.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use db::models::media_activity::{ActivityStatus, ActivityType, InitiatedBy, MediaActivity};

/// Search-suggestion value lists are capped so a runaway cardinality field
/// (e.g. free-text user ids) can't balloon a dropdown.
pub const SUGGESTION_LIMIT: i64 = 50;
const MAX_PAGE_SIZE: i64 = 500;
const DEFAULT_PAGE_SIZE: i64 = 50;

#[derive(Debug, thiserror::Error)]
pub enum AnalyticsError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    StartedAt,
    CompletedAt,
    ProcessingDurationMs,
    ActivityType,
    Status,
}

impl SortField {
    fn column(self) -> &'static str {
        match self {
            SortField::StartedAt => "started_at",
            SortField::CompletedAt => "completed_at",
            SortField::ProcessingDurationMs => "processing_duration_ms",
            SortField::ActivityType => "activity_type",
            SortField::Status => "status",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActivityFilter {
    pub activity_types: Vec<ActivityType>,
    pub statuses: Vec<ActivityStatus>,
    pub success: Option<bool>,
    pub initiated_by: Vec<InitiatedBy>,
    pub user_id: Option<String>,
    pub batch_job_id: Option<Uuid>,
    pub media_id: Option<String>,
    pub started_after: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
    pub error_contains: Option<String>,
    pub min_duration_ms: Option<i64>,
    pub max_duration_ms: Option<i64>,
    pub sort_by: Option<SortField>,
    pub sort_desc: bool,
    pub limit: Option<i64>,
    pub offset: i64,
}

const SELECT_COLUMNS: &str = "id, media_id, jellyfin_id, activity_type, activity_subtype, \
    status, success, initiated_by, user_id, batch_job_id, parent_activity_id, started_at, completed_at, \
    processing_duration_ms, input_parameters, result_data, additional_metadata, error_message, \
    system_version";

/// Appends this filter's `WHERE` clauses (and trailing `ORDER BY`/`LIMIT`/
/// `OFFSET` when `with_paging` is set) onto a query already positioned right
/// after the base `SELECT ... FROM media_activities`.
fn push_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &ActivityFilter, with_paging: bool) {
    let mut first = true;
    let mut and_or_where = |builder: &mut QueryBuilder<'_, Sqlite>, first: &mut bool| {
        builder.push(if *first { " WHERE " } else { " AND " });
        *first = false;
    };

    if !filter.activity_types.is_empty() {
        and_or_where(builder, &mut first);
        builder.push("activity_type IN (");
        let mut sep = builder.separated(", ");
        for t in &filter.activity_types {
            sep.push_bind(t.as_str());
        }
        builder.push(")");
    }
    if !filter.statuses.is_empty() {
        and_or_where(builder, &mut first);
        builder.push("status IN (");
        let mut sep = builder.separated(", ");
        for s in &filter.statuses {
            sep.push_bind(s.as_str());
        }
        builder.push(")");
    }
    if let Some(success) = filter.success {
        and_or_where(builder, &mut first);
        builder.push("success = ").push_bind(success as i64);
    }
    if !filter.initiated_by.is_empty() {
        and_or_where(builder, &mut first);
        builder.push("initiated_by IN (");
        let mut sep = builder.separated(", ");
        for i in &filter.initiated_by {
            sep.push_bind(i.as_str());
        }
        builder.push(")");
    }
    if let Some(user_id) = &filter.user_id {
        and_or_where(builder, &mut first);
        builder.push("user_id = ").push_bind(user_id.clone());
    }
    if let Some(batch_job_id) = filter.batch_job_id {
        and_or_where(builder, &mut first);
        builder.push("batch_job_id = ").push_bind(batch_job_id.to_string());
    }
    if let Some(media_id) = &filter.media_id {
        and_or_where(builder, &mut first);
        builder.push("media_id = ").push_bind(media_id.clone());
    }
    if let Some(after) = filter.started_after {
        and_or_where(builder, &mut first);
        builder.push("started_at >= ").push_bind(after);
    }
    if let Some(before) = filter.started_before {
        and_or_where(builder, &mut first);
        builder.push("started_at <= ").push_bind(before);
    }
    if let Some(needle) = &filter.error_contains {
        and_or_where(builder, &mut first);
        builder.push("error_message LIKE ").push_bind(format!("%{needle}%"));
    }
    if let Some(min_ms) = filter.min_duration_ms {
        and_or_where(builder, &mut first);
        builder.push("processing_duration_ms >= ").push_bind(min_ms);
    }
    if let Some(max_ms) = filter.max_duration_ms {
        and_or_where(builder, &mut first);
        builder.push("processing_duration_ms <= ").push_bind(max_ms);
    }

    if with_paging {
        let column = filter.sort_by.unwrap_or(SortField::StartedAt).column();
        let direction = if filter.sort_desc { "DESC" } else { "ASC" };
        builder.push(format!(" ORDER BY {column} {direction}"));
        let limit = filter.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        builder.push(" LIMIT ").push_bind(limit);
        builder.push(" OFFSET ").push_bind(filter.offset.max(0));
    }
}

pub async fn list_activities(pool: &SqlitePool, filter: &ActivityFilter) -> Result<Vec<MediaActivity>, AnalyticsError> {
    let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT {SELECT_COLUMNS} FROM media_activities"));
    push_filter(&mut builder, filter, true);
    Ok(builder.build_query_as::<MediaActivity>().fetch_all(pool).await?)
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SummaryStatistics {
    pub total: usize,
    pub by_status: HashMap<String, usize>,
    pub by_type: HashMap<String, usize>,
    pub average_duration_ms: Option<f64>,
    pub unique_users: usize,
    pub unique_media: usize,
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
}

pub async fn summary_statistics(pool: &SqlitePool, filter: &ActivityFilter) -> Result<SummaryStatistics, AnalyticsError> {
    let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT {SELECT_COLUMNS} FROM media_activities"));
    push_filter(&mut builder, filter, false);
    let rows = builder.build_query_as::<MediaActivity>().fetch_all(pool).await?;
    Ok(summarize(&rows))
}

fn summarize(rows: &[MediaActivity]) -> SummaryStatistics {
    let mut summary = SummaryStatistics { total: rows.len(), ..Default::default() };
    let mut users = std::collections::HashSet::new();
    let mut media = std::collections::HashSet::new();
    let mut durations = Vec::new();

    for row in rows {
        *summary.by_status.entry(row.status.as_str().to_string()).or_insert(0) += 1;
        *summary.by_type.entry(row.activity_type.as_str().to_string()).or_insert(0) += 1;
        if let Some(user_id) = &row.user_id {
            users.insert(user_id.clone());
        }
        media.insert(row.media_id.clone());
        if let Some(ms) = row.processing_duration_ms {
            durations.push(ms);
        }
        summary.earliest = Some(summary.earliest.map_or(row.started_at, |e| e.min(row.started_at)));
        summary.latest = Some(summary.latest.map_or(row.started_at, |l| l.max(row.started_at)));
    }

    summary.unique_users = users.len();
    summary.unique_media = media.len();
    summary.average_duration_ms = if durations.is_empty() { None } else { Some(durations.iter().sum::<i64>() as f64 / durations.len() as f64) };
    summary
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BatchSummary {
    pub batch_job_id: Uuid,
    pub stats: SummaryStatistics,
    pub error_histogram: HashMap<String, usize>,
    pub stage_average_ms: HashMap<String, f64>,
}

/// Rolls up every activity (and, when present, `PerformanceMetric` detail
/// rows) recorded under one batch job — used by the job detail view to
/// show per-error and per-stage breakdowns beyond the job's own counters.
pub async fn batch_summary(pool: &SqlitePool, batch_job_id: Uuid) -> Result<BatchSummary, AnalyticsError> {
    let filter = ActivityFilter { batch_job_id: Some(batch_job_id), ..Default::default() };
    let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT {SELECT_COLUMNS} FROM media_activities"));
    push_filter(&mut builder, &filter, false);
    let rows = builder.build_query_as::<MediaActivity>().fetch_all(pool).await?;

    let mut error_histogram = HashMap::new();
    for row in &rows {
        if let Some(err) = &row.error_message {
            *error_histogram.entry(err.clone()).or_insert(0) += 1;
        }
    }

    let stage_timings: Vec<(Option<String>,)> = sqlx::query_as(
        "SELECT pm.stage_timings_ms FROM performance_metrics pm \
         JOIN media_activities ma ON ma.id = pm.activity_id WHERE ma.batch_job_id = ?",
    )
    .bind(batch_job_id.to_string())
    .fetch_all(pool)
    .await?;

    let mut stage_totals: HashMap<String, (f64, usize)> = HashMap::new();
    for (timings,) in stage_timings {
        let Some(timings) = timings.and_then(|t| serde_json::from_str::<serde_json::Value>(&t).ok()) else { continue };
        let Some(object) = timings.as_object() else { continue };
        for (stage, value) in object {
            let Some(ms) = value.as_f64() else { continue };
            let entry = stage_totals.entry(stage.clone()).or_insert((0.0, 0));
            entry.0 += ms;
            entry.1 += 1;
        }
    }
    let stage_average_ms = stage_totals.into_iter().map(|(stage, (total, count))| (stage, total / count as f64)).collect();

    Ok(BatchSummary { batch_job_id, stats: summarize(&rows), error_histogram, stage_average_ms })
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DailyCount {
    pub date: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct UserSummary {
    pub user_id: String,
    pub counts_by_type: HashMap<String, usize>,
    pub success_rate: Option<f64>,
    pub daily_pattern: Vec<DailyCount>,
    pub top_errors: Vec<(String, usize)>,
}

/// Summarizes one user's activity over the trailing `days` (default callers
/// pass 7, matching the search UI's "last week" view).
pub async fn user_summary(pool: &SqlitePool, user_id: &str, days: i64) -> Result<UserSummary, AnalyticsError> {
    let since = Utc::now() - ChronoDuration::days(days);
    let filter = ActivityFilter { user_id: Some(user_id.to_string()), started_after: Some(since), ..Default::default() };
    let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT {SELECT_COLUMNS} FROM media_activities"));
    push_filter(&mut builder, &filter, false);
    let rows = builder.build_query_as::<MediaActivity>().fetch_all(pool).await?;

    let mut counts_by_type = HashMap::new();
    let mut daily: HashMap<String, usize> = HashMap::new();
    let mut errors: HashMap<String, usize> = HashMap::new();
    let mut completed_count = 0usize;
    let mut success_count = 0usize;

    for row in &rows {
        *counts_by_type.entry(row.activity_type.as_str().to_string()).or_insert(0) += 1;
        *daily.entry(row.started_at.format("%Y-%m-%d").to_string()).or_insert(0) += 1;
        if let Some(success) = row.success {
            completed_count += 1;
            if success {
                success_count += 1;
            }
        }
        if let Some(err) = &row.error_message {
            *errors.entry(err.clone()).or_insert(0) += 1;
        }
    }

    let mut daily_pattern: Vec<DailyCount> = daily.into_iter().map(|(date, count)| DailyCount { date, count }).collect();
    daily_pattern.sort_by(|a, b| a.date.cmp(&b.date));

    let mut top_errors: Vec<(String, usize)> = errors.into_iter().collect();
    top_errors.sort_by(|a, b| b.1.cmp(&a.1));
    top_errors.truncate(10);

    Ok(UserSummary {
        user_id: user_id.to_string(),
        counts_by_type,
        success_rate: if completed_count == 0 { None } else { Some(success_count as f64 / completed_count as f64) },
        daily_pattern,
        top_errors,
    })
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SearchSuggestions {
    pub activity_types: Vec<String>,
    pub statuses: Vec<String>,
    pub initiated_by: Vec<String>,
    pub user_ids: Vec<String>,
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
}

/// Distinct-value suggestion lists for the search UI, each capped at
/// [`SUGGESTION_LIMIT`].
pub async fn search_suggestions(pool: &SqlitePool) -> Result<SearchSuggestions, AnalyticsError> {
    let activity_types: Vec<(String,)> =
        sqlx::query_as(&format!("SELECT DISTINCT activity_type FROM media_activities ORDER BY activity_type LIMIT {SUGGESTION_LIMIT}")).fetch_all(pool).await?;
    let statuses: Vec<(String,)> =
        sqlx::query_as(&format!("SELECT DISTINCT status FROM media_activities ORDER BY status LIMIT {SUGGESTION_LIMIT}")).fetch_all(pool).await?;
    let initiated_by: Vec<(String,)> =
        sqlx::query_as(&format!("SELECT DISTINCT initiated_by FROM media_activities ORDER BY initiated_by LIMIT {SUGGESTION_LIMIT}")).fetch_all(pool).await?;
    let user_ids: Vec<(String,)> = sqlx::query_as(&format!(
        "SELECT DISTINCT user_id FROM media_activities WHERE user_id IS NOT NULL ORDER BY user_id LIMIT {SUGGESTION_LIMIT}"
    ))
    .fetch_all(pool)
    .await?;
    let range: (Option<DateTime<Utc>>, Option<DateTime<Utc>>) =
        sqlx::query_as("SELECT MIN(started_at), MAX(started_at) FROM media_activities").fetch_one(pool).await?;

    Ok(SearchSuggestions {
        activity_types: activity_types.into_iter().map(|(v,)| v).collect(),
        statuses: statuses.into_iter().map(|(v,)| v).collect(),
        initiated_by: initiated_by.into_iter().map(|(v,)| v).collect(),
        user_ids: user_ids.into_iter().map(|(v,)| v).collect(),
        earliest: range.0,
        latest: range.1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::models::media_activity::StartActivity;

    async fn seed(pool: &SqlitePool) {
        let a = MediaActivity::start(
            pool,
            StartActivity {
                media_id: "item-1".into(),
                jellyfin_id: Some("item-1"),
                activity_type: ActivityType::BadgeApplication,
                activity_subtype: None,
                initiated_by: InitiatedBy::BatchOperation,
                user_id: Some("alice"),
                batch_job_id: None,
                parent_activity_id: None,
                input_parameters: None,
            },
            "0.1.0-test",
        )
        .await
        .unwrap();
        MediaActivity::complete(pool, a, true, None, None).await.unwrap();

        let b = MediaActivity::start(
            pool,
            StartActivity {
                media_id: "item-2".into(),
                jellyfin_id: Some("item-2"),
                activity_type: ActivityType::PosterReplacement,
                activity_subtype: None,
                initiated_by: InitiatedBy::User,
                user_id: Some("bob"),
                batch_job_id: None,
                parent_activity_id: None,
                input_parameters: None,
            },
            "0.1.0-test",
        )
        .await
        .unwrap();
        MediaActivity::fail(pool, b, "boom").await.unwrap();
    }

    #[tokio::test]
    async fn list_activities_filters_by_success() {
        let pool = db::DBService::new_in_memory().await.unwrap().pool;
        seed(&pool).await;

        let filter = ActivityFilter { success: Some(false), ..Default::default() };
        let rows = list_activities(&pool, &filter).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].media_id, "item-2");
    }

    #[tokio::test]
    async fn summary_statistics_counts_by_status_and_type() {
        let pool = db::DBService::new_in_memory().await.unwrap().pool;
        seed(&pool).await;

        let stats = summary_statistics(&pool, &ActivityFilter::default()).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.unique_users, 2);
        assert_eq!(*stats.by_type.get("badge_application").unwrap(), 1);
        assert_eq!(*stats.by_type.get("poster_replacement").unwrap(), 1);
    }

    #[tokio::test]
    async fn user_summary_computes_success_rate() {
        let pool = db::DBService::new_in_memory().await.unwrap().pool;
        seed(&pool).await;

        let summary = user_summary(&pool, "alice", 7).await.unwrap();
        assert_eq!(summary.success_rate, Some(1.0));
    }

    #[tokio::test]
    async fn search_suggestions_are_bounded_and_distinct() {
        let pool = db::DBService::new_in_memory().await.unwrap().pool;
        seed(&pool).await;

        let suggestions = search_suggestions(&pool).await.unwrap();
        assert!(suggestions.activity_types.contains(&"badge_application".to_string()));
        assert!(suggestions.user_ids.len() <= SUGGESTION_LIMIT as usize);
    }
}
