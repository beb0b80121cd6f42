//! racetrack-api — REST API for Racetrack.
//!
//! Provides axum route handlers for the job lifecycle: submitting
//! deployments, polling their progress, managing deployed jobs.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/deploy` | Submit a deployment, returns its id |
//! | GET | `/api/v1/deploy` | List recent deployments |
//! | GET | `/api/v1/deploy/{id}` | Poll one deployment's progress |
//! | GET | `/api/v1/job` | List all jobs |
//! | GET | `/api/v1/job/{name}/{version}` | Get one job (version aliases allowed) |
//! | DELETE | `/api/v1/job/{name}/{version}` | Delete a job |
//! | POST | `/api/v1/job/{name}/{version}/redeploy` | Rebuild and redeploy |
//! | POST | `/api/v1/job/{name}/{version}/reprovision` | Re-provision the built image |
//! | POST | `/api/v1/job/{name}/{version}/move` | Move to another target |
//! | GET | `/api/v1/info` | Registered targets and job types |

pub mod handlers;

use axum::Router;
use axum::routing::{get, post};

use racetrack_infra::{JobTypeCatalog, TargetRegistry};
use racetrack_pipeline::DeploymentPipeline;
use racetrack_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub pipeline: DeploymentPipeline,
    pub targets: TargetRegistry,
    pub job_types: JobTypeCatalog,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/deploy", post(handlers::deploy).get(handlers::list_deployments))
        .route("/deploy/{id}", get(handlers::get_deployment))
        .route("/job", get(handlers::list_jobs))
        .route(
            "/job/{name}/{version}",
            get(handlers::get_job).delete(handlers::delete_job),
        )
        .route("/job/{name}/{version}/redeploy", post(handlers::redeploy_job))
        .route("/job/{name}/{version}/reprovision", post(handlers::reprovision_job))
        .route("/job/{name}/{version}/move", post(handlers::move_job))
        .route("/info", get(handlers::info))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/live", get(handlers::live))
        .route("/ready", get(handlers::live))
}
