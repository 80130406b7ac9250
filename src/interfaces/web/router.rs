use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::{get, post, put},
};
use tower_http::cors::{Any, CorsLayer};

use super::AppState;
use super::handlers::{jobs, schedules, system};

fn build_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
}

pub fn build_api_router(state: AppState) -> Router {
    Router::new()
        .route("/api/runjob", post(jobs::run_job_endpoint))
        .route("/api/stopjob", post(jobs::stop_job_endpoint))
        .route("/api/jobresult", get(jobs::job_result_endpoint))
        .route("/api/jobstatus", get(jobs::job_status_endpoint))
        .route(
            "/api/schedules",
            get(schedules::get_schedules_endpoint).post(schedules::create_schedule_endpoint),
        )
        .route(
            "/api/schedules/{id}",
            put(schedules::update_schedule_endpoint).delete(schedules::delete_schedule_endpoint),
        )
        .route(
            "/api/schedules/{id}/result",
            get(schedules::schedule_result_endpoint),
        )
        .route("/api/version", get(system::version_endpoint))
        .route("/api/logs", get(super::sse_logs_endpoint))
        .layer(middleware::from_fn(security_headers))
        .layer(build_cors())
        .with_state(state)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'self'"),
    );
    response
}
