//! REST routes

use crate::api::models::*;
use crate::bus::Topic;
use crate::engine::PipelineEngine;
use crate::error::{ErrorKind, PipelineError, PipelineResult};
use crate::workflow::{Workflow, WorkflowId};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use scrawl_connectors::{ProjectId, UserId};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Wrapper giving pipeline errors an HTTP shape
struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::NotAuthorized => StatusCode::FORBIDDEN,
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::InvalidInput | ErrorKind::SchemaMismatch | ErrorKind::NoInput => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::RateLimited | ErrorKind::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Network => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = if kind == ErrorKind::Internal {
            // Internal details stay in the logs
            "internal error".to_string()
        } else {
            self.0.to_string()
        };
        let body = ErrorBody {
            error: ErrorDetail {
                kind,
                message,
                retry_after_secs: kind.is_retryable().then_some(30),
            },
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn requester(headers: &HeaderMap) -> PipelineResult<UserId> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(UserId::new)
        .ok_or_else(|| PipelineError::NotAuthorized("missing x-user-id header".to_string()))
}

fn parse_workflow_id(raw: &str) -> PipelineResult<WorkflowId> {
    WorkflowId::parse_str(raw)
        .map_err(|_| PipelineError::Validation(format!("{raw} is not a workflow id")))
}

/// Build the router over a running engine
pub fn router(engine: Arc<PipelineEngine>) -> Router {
    Router::new()
        .route("/api/projects/{project_id}/workflow", post(start_workflow))
        .route("/api/projects/{project_id}/workflows", get(list_project_workflows))
        .route("/api/workflows", get(list_user_workflows))
        .route("/api/workflows/{id}", get(get_workflow).delete(cancel_workflow))
        .route("/api/workflows/{id}/restart", post(restart_workflow))
        .route("/api/workflows/{id}/events", get(workflow_events))
        .route("/api/system/health", get(system_health))
        .route("/api/system/metrics", get(system_metrics))
        .route("/api/system/alerts", get(system_alerts))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(engine)
}

/// Serve the router until the process exits
pub async fn serve(engine: Arc<PipelineEngine>, addr: std::net::SocketAddr) -> PipelineResult<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| PipelineError::Internal(format!("bind {addr}: {e}")))?;
    info!(%addr, "http api listening");
    axum::serve(listener, router(engine))
        .await
        .map_err(|e| PipelineError::Internal(format!("http server: {e}")))
}

async fn start_workflow(
    State(engine): State<Arc<PipelineEngine>>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<StartWorkflowRequest>>,
) -> ApiResult<Json<WorkflowIdResponse>> {
    let user_id = requester(&headers)?;
    let config = body
        .and_then(|Json(request)| request.config)
        .unwrap_or_default();
    let workflow_id = engine
        .start_workflow(user_id, ProjectId::new(project_id), config)
        .await?;
    Ok(Json(WorkflowIdResponse { workflow_id }))
}

async fn get_workflow(
    State(engine): State<Arc<PipelineEngine>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Workflow>> {
    let user_id = requester(&headers)?;
    let workflow = engine.get_workflow(parse_workflow_id(&id)?, &user_id)?;
    Ok(Json(workflow))
}

async fn cancel_workflow(
    State(engine): State<Arc<PipelineEngine>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<CancelResponse>> {
    let user_id = requester(&headers)?;
    let workflow_id = parse_workflow_id(&id)?;
    // Ownership check before acting
    engine.get_workflow(workflow_id, &user_id)?;
    let cancelled = engine.cancel_workflow(workflow_id).await?;
    Ok(Json(CancelResponse { cancelled }))
}

async fn restart_workflow(
    State(engine): State<Arc<PipelineEngine>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<WorkflowIdResponse>> {
    let user_id = requester(&headers)?;
    let workflow_id = engine
        .restart_failed_workflow(parse_workflow_id(&id)?, &user_id)
        .await?;
    Ok(Json(WorkflowIdResponse { workflow_id }))
}

async fn list_user_workflows(
    State(engine): State<Arc<PipelineEngine>>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<Workflow>>> {
    let user_id = requester(&headers)?;
    Ok(Json(engine.list_user_workflows(&user_id)))
}

async fn list_project_workflows(
    State(engine): State<Arc<PipelineEngine>>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<Workflow>>> {
    let user_id = requester(&headers)?;
    let project_id = ProjectId::new(project_id);
    let workflows: Vec<Workflow> = engine
        .list_project_workflows(&project_id)
        .into_iter()
        .filter(|w| w.user_id == user_id)
        .collect();
    Ok(Json(workflows))
}

async fn workflow_events(
    State(engine): State<Arc<PipelineEngine>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let user_id = requester(&headers)?;
    let workflow_id = parse_workflow_id(&id)?;
    engine.get_workflow(workflow_id, &user_id)?;
    let subscription = engine.subscribe(Topic::Workflow(workflow_id));
    Ok(Json(serde_json::json!({
        "lastEvent": subscription.snapshot(),
    })))
}

async fn system_health(State(engine): State<Arc<PipelineEngine>>) -> impl IntoResponse {
    Json(engine.health().await)
}

async fn system_metrics(State(engine): State<Arc<PipelineEngine>>) -> impl IntoResponse {
    Json(engine.metrics().await)
}

async fn system_alerts(State(engine): State<Arc<PipelineEngine>>) -> impl IntoResponse {
    Json(engine.alerts())
}
