//! REST API handlers.
//!
//! Each handler delegates to the deployment pipeline or the state store
//! and returns JSON responses. Pipeline errors map onto HTTP statuses:
//! conflicts are 409, denials 403, unknown entities 404, caller
//! mistakes 400, everything else 500.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use tracing::{debug, warn};

use racetrack_infra::{InfraError, JobSecrets};
use racetrack_pipeline::{check_deployment, list_recent_deployments, PipelineError};
use racetrack_state::Manifest;
use racetrack_version::resolve_job;

use crate::ApiState;

const RECENT_DEPLOYMENTS_LIMIT: usize = 50;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse + use<> {
    if status.is_server_error() {
        warn!(%status, error = msg, "request failed");
    } else {
        debug!(%status, error = msg, "request rejected");
    }
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn pipeline_error_response(err: &PipelineError) -> impl IntoResponse {
    error_response(&err.to_string(), status_of(err))
}

fn status_of(err: &PipelineError) -> StatusCode {
    match err {
        e if e.is_conflict() => StatusCode::CONFLICT,
        PipelineError::Denied(_) => StatusCode::FORBIDDEN,
        PipelineError::EntityNotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::InvalidVersion(_)
        | PipelineError::NoManifest { .. }
        | PipelineError::NoImage { .. } => StatusCode::BAD_REQUEST,
        PipelineError::Infra(
            InfraError::UnknownTarget(_)
            | InfraError::NoTargets
            | InfraError::AmbiguousTarget(_)
            | InfraError::UnknownJobType(_),
        ) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Identity of the caller, from the gateway-injected header.
fn username_of(headers: &HeaderMap) -> String {
    headers
        .get("x-racetrack-user")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string()
}

// ── Deployments ────────────────────────────────────────────────

/// Deploy request body.
#[derive(serde::Deserialize)]
pub struct DeployPayload {
    pub manifest: Manifest,
    #[serde(default)]
    pub secrets: JobSecrets,
    pub build_context: Option<String>,
    #[serde(default)]
    pub force: bool,
}

/// POST /api/v1/deploy
pub async fn deploy(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(payload): Json<DeployPayload>,
) -> impl IntoResponse {
    let username = username_of(&headers);
    match state
        .pipeline
        .deploy_new(
            payload.manifest,
            payload.secrets,
            payload.build_context,
            payload.force,
            &username,
        )
        .await
    {
        Ok(id) => {
            debug!(deployment_id = %id, %username, "deployment submitted");
            (
                StatusCode::CREATED,
                ApiResponse::ok(serde_json::json!({ "id": id })),
            )
                .into_response()
        }
        Err(e) => pipeline_error_response(&e).into_response(),
    }
}

/// GET /api/v1/deploy
pub async fn list_deployments(State(state): State<ApiState>) -> impl IntoResponse {
    match list_recent_deployments(&state.store, RECENT_DEPLOYMENTS_LIMIT) {
        Ok(deployments) => ApiResponse::ok(deployments).into_response(),
        Err(e) => pipeline_error_response(&e).into_response(),
    }
}

/// GET /api/v1/deploy/{id}
pub async fn get_deployment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match check_deployment(&state.store, &id) {
        Ok(view) => ApiResponse::ok(view).into_response(),
        Err(e) => pipeline_error_response(&e).into_response(),
    }
}

// ── Jobs ───────────────────────────────────────────────────────

/// GET /api/v1/job
pub async fn list_jobs(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_jobs() {
        Ok(jobs) => ApiResponse::ok(jobs).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /api/v1/job/{name}/{version}
pub async fn get_job(
    State(state): State<ApiState>,
    Path((name, version)): Path<(String, String)>,
) -> impl IntoResponse {
    match resolve_job(&state.store, &name, &version) {
        Ok(job) => ApiResponse::ok(job).into_response(),
        Err(e) => {
            let e = PipelineError::from(e);
            pipeline_error_response(&e).into_response()
        }
    }
}

/// DELETE /api/v1/job/{name}/{version}
pub async fn delete_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path((name, version)): Path<(String, String)>,
) -> impl IntoResponse {
    let username = username_of(&headers);
    match state.pipeline.delete_job(&name, &version, &username).await {
        Ok(()) => ApiResponse::ok("deleted").into_response(),
        Err(e) => pipeline_error_response(&e).into_response(),
    }
}

/// POST /api/v1/job/{name}/{version}/redeploy
pub async fn redeploy_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path((name, version)): Path<(String, String)>,
) -> impl IntoResponse {
    let username = username_of(&headers);
    match state.pipeline.redeploy(&name, &version, &username).await {
        Ok(id) => (
            StatusCode::CREATED,
            ApiResponse::ok(serde_json::json!({ "id": id })),
        )
            .into_response(),
        Err(e) => pipeline_error_response(&e).into_response(),
    }
}

/// POST /api/v1/job/{name}/{version}/reprovision
pub async fn reprovision_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path((name, version)): Path<(String, String)>,
) -> impl IntoResponse {
    let username = username_of(&headers);
    match state.pipeline.reprovision(&name, &version, &username).await {
        Ok(id) => (
            StatusCode::CREATED,
            ApiResponse::ok(serde_json::json!({ "id": id })),
        )
            .into_response(),
        Err(e) => pipeline_error_response(&e).into_response(),
    }
}

/// Move request body.
#[derive(serde::Deserialize)]
pub struct MovePayload {
    pub infrastructure_target: String,
}

/// POST /api/v1/job/{name}/{version}/move
pub async fn move_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path((name, version)): Path<(String, String)>,
    Json(payload): Json<MovePayload>,
) -> impl IntoResponse {
    let username = username_of(&headers);
    match state
        .pipeline
        .move_job(&name, &version, &payload.infrastructure_target, &username)
        .await
    {
        Ok(id) => (
            StatusCode::CREATED,
            ApiResponse::ok(serde_json::json!({ "id": id })),
        )
            .into_response(),
        Err(e) => pipeline_error_response(&e).into_response(),
    }
}

// ── Introspection ──────────────────────────────────────────────

/// GET /api/v1/info
pub async fn info(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(serde_json::json!({
        "infrastructure_targets": state.targets.names(),
        "job_types": state.job_types.keys(),
    }))
}

/// GET /live and /ready
pub async fn live() -> impl IntoResponse {
    ApiResponse::ok(serde_json::json!({ "status": "live" }))
}
