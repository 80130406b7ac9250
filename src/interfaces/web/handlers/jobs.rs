use axum::{Json, extract::State, http::StatusCode};

use super::super::AppState;
use crate::core::job::{JobResult, JobStatus, RunType};

/// Starts a manual run. Always 202; a held gate is reported in the body.
pub async fn run_job_endpoint(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let body = match state.runner.start(RunType::Manual) {
        Ok(_) => serde_json::json!({ "accepted": true, "running": true }),
        Err(e) => serde_json::json!({ "accepted": false, "running": true, "error": e.to_string() }),
    };
    (StatusCode::ACCEPTED, Json(body))
}

pub async fn stop_job_endpoint(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    match state.runner.stop() {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "stopped": true })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "stopped": false, "error": e.to_string() })),
        ),
    }
}

pub async fn job_result_endpoint(State(state): State<AppState>) -> Json<JobResult> {
    Json(state.runner.last_result())
}

pub async fn job_status_endpoint(State(state): State<AppState>) -> Json<JobStatus> {
    Json(state.runner.status())
}
