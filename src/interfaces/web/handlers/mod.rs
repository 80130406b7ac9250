pub mod jobs;
pub mod schedules;
pub mod system;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::core::schedule::ScheduleError;

/// Error answered as `{"error": message}` with a matching status code.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::Conflict(m) => (StatusCode::CONFLICT, m),
            Self::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<ScheduleError> for ApiError {
    fn from(err: ScheduleError) -> Self {
        match err {
            ScheduleError::Conflict => {
                Self::Conflict("Schedule conflicts with an existing job".to_string())
            }
            ScheduleError::NotFound(_) => Self::NotFound("not found".to_string()),
            ScheduleError::InPast => Self::BadRequest(err.to_string()),
            ScheduleError::AlreadyFired(_) => Self::Conflict(err.to_string()),
            ScheduleError::Timer(_) => {
                tracing::error!("Failed to create schedule timer: {}", err);
                Self::Internal(err.to_string())
            }
        }
    }
}
