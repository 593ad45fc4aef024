use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::SimError;
use crate::gateway::{JobView, SubmissionGateway};
use crate::job::JobStatus;
use crate::queue::{JobQueue, QueueStats};

const DEFAULT_LIST_LIMIT: usize = 20;

#[derive(Clone)]
pub struct ApiState {
    pub gateway: SubmissionGateway,
    pub queue: Arc<dyn JobQueue>,
}

#[derive(Deserialize)]
struct SubmitRequest {
    user_id: String,
    pr_url: String,
}

#[derive(Serialize)]
struct SubmitResponse {
    job_id: Uuid,
    status: JobStatus,
}

#[derive(Deserialize)]
struct UserQuery {
    user_id: Option<String>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    queue: QueueStats,
}

/// JSON error body `{"error": "..."}` with a status derived from the error kind.
struct ApiError(StatusCode, String);

impl From<SimError> for ApiError {
    fn from(err: SimError) -> Self {
        let status = match &err {
            SimError::InvalidPrUrl(_) | SimError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            SimError::AccessDenied(_) => StatusCode::FORBIDDEN,
            SimError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %err, "Request failed");
            return ApiError(status, "internal error".to_string());
        }
        ApiError(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError(StatusCode::BAD_REQUEST, message.into())
}

fn require_user(query: &UserQuery) -> Result<&str, ApiError> {
    query
        .user_id
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| bad_request("user_id query parameter is required"))
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/api/simulations",
            get(list_handler).post(submit_handler),
        )
        .route("/api/simulations/{job_id}", get(report_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `shutdown` is cancelled.
pub async fn run_api(addr: SocketAddr, state: ApiState, shutdown: CancellationToken) {
    let app = router(state);
    tracing::info!(addr = %addr, "Starting API server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind API server");
            return;
        }
    };

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
    if let Err(e) = result {
        tracing::error!(error = %e, "API server failed");
    }
}

async fn health_handler(State(state): State<ApiState>) -> Result<Json<HealthResponse>, ApiError> {
    let queue = state.queue.stats().await?;
    Ok(Json(HealthResponse { status: "ok", queue }))
}

async fn submit_handler(
    State(state): State<ApiState>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(payload) = payload.map_err(|e| bad_request(e.body_text()))?;
    let job = state.gateway.submit(&payload.user_id, &payload.pr_url).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id: job.job_id,
            status: job.status,
        }),
    ))
}

async fn list_handler(
    State(state): State<ApiState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Vec<JobView>>, ApiError> {
    let user_id = require_user(&query)?;
    let jobs = state
        .gateway
        .list(user_id, query.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await?;
    Ok(Json(jobs))
}

/// 200 once the job is terminal, 202 while it is still pending or running.
async fn report_handler(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = Uuid::parse_str(&job_id).map_err(|_| bad_request(format!("invalid job id '{}'", job_id)))?;
    let user_id = require_user(&query)?;
    let view = state.gateway.report(job_id, user_id).await?;
    let status = if view.is_terminal {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(view)))
}
