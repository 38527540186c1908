use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use aphrodite_core::media_client::Library;
use db::models::job::BadgeType;
use db::models::schedule::{CreateSchedule, Schedule};
use db::models::schedule_execution::ScheduleExecution;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub name: String,
    pub cron_expression: String,
    pub timezone: String,
    pub target_library_ids: Vec<String>,
    pub badge_types: Vec<String>,
    pub reprocess_all: bool,
}

fn parse_badge_types(raw: &[String]) -> Result<Vec<BadgeType>, ApiError> {
    raw.iter()
        .map(|s| BadgeType::from_str(s).ok_or_else(|| ApiError::BadRequest(format!("unknown badge type {s:?}"))))
        .collect()
}

impl ScheduleRequest {
    fn into_create(self) -> Result<CreateSchedule, ApiError> {
        let badge_types = parse_badge_types(&self.badge_types)?;
        Ok(CreateSchedule {
            name: self.name,
            cron_expression: self.cron_expression,
            timezone: self.timezone,
            target_library_ids: self.target_library_ids,
            badge_types,
            reprocess_all: self.reprocess_all,
        })
    }
}

/// `GET /schedules`
pub async fn list_schedules(State(state): State<AppState>) -> Result<Json<Vec<Schedule>>, ApiError> {
    Ok(Json(Schedule::list_all(&state.pool).await?))
}

/// `GET /schedules/{id}`
pub async fn get_schedule(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Schedule>, ApiError> {
    let schedule = Schedule::find_by_id(&state.pool, id).await?.ok_or_else(|| ApiError::NotFound(format!("schedule {id} not found")))?;
    Ok(Json(schedule))
}

/// `POST /schedules`
pub async fn create_schedule(
    State(state): State<AppState>,
    Json(body): Json<ScheduleRequest>,
) -> Result<Json<Schedule>, ApiError> {
    let created = Schedule::create(&state.pool, body.into_create()?).await?;
    Ok(Json(created))
}

/// `PUT /schedules/{id}`
pub async fn update_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ScheduleRequest>,
) -> Result<Json<Schedule>, ApiError> {
    let updated = Schedule::update(&state.pool, id, body.into_create()?).await?;
    Ok(Json(updated))
}

#[derive(Debug, Deserialize)]
pub struct SetEnabledRequest {
    pub enabled: bool,
}

/// `PUT /schedules/{id}/enabled`
pub async fn set_enabled(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<SetEnabledRequest>,
) -> Result<Json<()>, ApiError> {
    Schedule::set_enabled(&state.pool, id, body.enabled).await?;
    Ok(Json(()))
}

/// `DELETE /schedules/{id}`
pub async fn delete_schedule(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<()>, ApiError> {
    Schedule::delete(&state.pool, id).await?;
    Ok(Json(()))
}

#[derive(Debug, Serialize)]
pub struct ExecuteNowResponse {
    pub execution_id: Uuid,
}

/// `POST /schedules/{id}/execute` — the manual "run now" action, bypassing
/// cron timing but still recording a normal execution row.
pub async fn execute_now(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<ExecuteNowResponse>, ApiError> {
    let execution_id = state.scheduler.execute_schedule_now(id).await?;
    Ok(Json(ExecuteNowResponse { execution_id }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub schedule_id: Option<Uuid>,
    pub limit: Option<i64>,
}

/// `GET /schedules/executions/history?schedule_id=&limit=`
pub async fn execution_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<ScheduleExecution>>, ApiError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let history = ScheduleExecution::history(&state.pool, query.schedule_id, limit).await?;
    Ok(Json(history))
}

#[derive(Debug, Serialize)]
pub struct BadgeTypeOption {
    pub value: &'static str,
}

/// `GET /schedules/config/badge-types` — the fixed set of badge types a
/// schedule (or a manual batch) can request.
pub async fn badge_type_options() -> Json<Vec<BadgeTypeOption>> {
    Json(
        [BadgeType::Audio, BadgeType::Resolution, BadgeType::Review, BadgeType::Awards]
            .into_iter()
            .map(|b| BadgeTypeOption { value: b.as_str() })
            .collect(),
    )
}

#[derive(Debug, Serialize)]
pub struct CronPreset {
    pub label: &'static str,
    pub expression: &'static str,
}

/// `GET /schedules/config/cron-presets` — a handful of common schedules
/// offered in the UI so users don't have to hand-write cron syntax.
pub async fn cron_presets() -> Json<Vec<CronPreset>> {
    Json(vec![
        CronPreset { label: "Nightly at 3am", expression: "0 0 3 * * *" },
        CronPreset { label: "Every 6 hours", expression: "0 0 */6 * * *" },
        CronPreset { label: "Weekly on Sunday at 4am", expression: "0 0 4 * * SUN" },
    ])
}

/// `GET /schedules/config/libraries` — the media server's current library
/// list, offered as the picker for `target_library_ids`.
pub async fn library_options(State(state): State<AppState>) -> Result<Json<Vec<Library>>, ApiError> {
    Ok(Json(state.media_client.list_libraries().await?))
}
