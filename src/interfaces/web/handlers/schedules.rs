use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
};
use chrono::{DateTime, Utc};

use super::super::AppState;
use super::ApiError;
use crate::core::schedule::{Schedule, ScheduleResult};

#[derive(serde::Deserialize)]
pub struct ScheduleRequest {
    time: String,
}

fn parse_request(payload: Result<Json<ScheduleRequest>, JsonRejection>) -> Result<DateTime<Utc>, ApiError> {
    let Json(request) = payload.map_err(|_| ApiError::BadRequest("bad request".to_string()))?;
    DateTime::parse_from_rfc3339(request.time.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| ApiError::BadRequest("invalid time".to_string()))
}

pub async fn get_schedules_endpoint(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "schedules": state.schedules.list() }))
}

pub async fn create_schedule_endpoint(
    State(state): State<AppState>,
    payload: Result<Json<ScheduleRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Schedule>), ApiError> {
    let time = parse_request(payload)?;
    let schedule = state.schedules.create(time).await?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

pub async fn update_schedule_endpoint(
    Path(id): Path<String>,
    State(state): State<AppState>,
    payload: Result<Json<ScheduleRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Schedule>), ApiError> {
    let time = parse_request(payload)?;
    let schedule = state.schedules.update(&id, time).await?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

pub async fn delete_schedule_endpoint(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> StatusCode {
    state.schedules.delete(&id).await;
    StatusCode::NO_CONTENT
}

pub async fn schedule_result_endpoint(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Json<ScheduleResult> {
    Json(state.schedules.result(&id))
}
