use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use aphrodite_core::analytics::{self, ActivityFilter, BatchSummary, SearchSuggestions, SummaryStatistics, UserSummary};
use db::models::media_activity::{ActivityStatus, ActivityType, InitiatedBy, MediaActivity};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize, Default)]
pub struct ActivityQuery {
    pub activity_type: Option<String>,
    pub status: Option<String>,
    pub success: Option<bool>,
    pub initiated_by: Option<String>,
    pub user_id: Option<String>,
    pub batch_job_id: Option<Uuid>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl From<ActivityQuery> for ActivityFilter {
    fn from(q: ActivityQuery) -> Self {
        ActivityFilter {
            activity_types: q.activity_type.as_deref().and_then(ActivityType::from_str).into_iter().collect(),
            statuses: q.status.as_deref().and_then(ActivityStatus::from_str).into_iter().collect(),
            success: q.success,
            initiated_by: q.initiated_by.as_deref().and_then(InitiatedBy::from_str).into_iter().collect(),
            user_id: q.user_id,
            batch_job_id: q.batch_job_id,
            limit: q.limit,
            offset: q.offset.unwrap_or(0),
            ..Default::default()
        }
    }
}

/// `GET /activity` — filtered, paginated activity search.
pub async fn list_activity(
    State(state): State<AppState>,
    Query(query): Query<ActivityQuery>,
) -> Result<Json<Vec<MediaActivity>>, ApiError> {
    let filter: ActivityFilter = query.into();
    Ok(Json(analytics::list_activities(&state.pool, &filter).await?))
}

/// `GET /activity/summary` — rollup counts/averages over the same filter.
pub async fn activity_summary(
    State(state): State<AppState>,
    Query(query): Query<ActivityQuery>,
) -> Result<Json<SummaryStatistics>, ApiError> {
    let filter: ActivityFilter = query.into();
    Ok(Json(analytics::summary_statistics(&state.pool, &filter).await?))
}

/// `GET /activity/batch/{batch_job_id}/summary`
pub async fn batch_job_summary(
    State(state): State<AppState>,
    Path(batch_job_id): Path<Uuid>,
) -> Result<Json<BatchSummary>, ApiError> {
    Ok(Json(analytics::batch_summary(&state.pool, batch_job_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct UserSummaryQuery {
    pub days: Option<i64>,
}

/// `GET /activity/users/{user_id}/summary?days=`
pub async fn user_activity_summary(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<UserSummaryQuery>,
) -> Result<Json<UserSummary>, ApiError> {
    let days = query.days.unwrap_or(30).clamp(1, 365);
    Ok(Json(analytics::user_summary(&state.pool, &user_id, days).await?))
}

/// `GET /activity/suggestions` — distinct filter values for search UIs.
pub async fn suggestions(State(state): State<AppState>) -> Result<Json<SearchSuggestions>, ApiError> {
    Ok(Json(analytics::search_suggestions(&state.pool).await?))
}
