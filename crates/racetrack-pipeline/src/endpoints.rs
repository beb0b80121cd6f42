//! Public endpoint registration.
//!
//! A manifest may declare endpoints that should be reachable without
//! authentication. Registering them with the edge proxy is a
//! collaborator concern; the pipeline only reports what to expose.

use async_trait::async_trait;
use tracing::info;

use racetrack_state::JobRecord;

use crate::error::PipelineResult;

#[async_trait]
pub trait PublicEndpointRegistrar: Send + Sync {
    async fn register(&self, job: &JobRecord, endpoints: &[String]) -> PipelineResult<()>;
}

/// Registrar for setups without an edge proxy; logs and moves on.
pub struct NoopEndpointRegistrar;

#[async_trait]
impl PublicEndpointRegistrar for NoopEndpointRegistrar {
    async fn register(&self, job: &JobRecord, endpoints: &[String]) -> PipelineResult<()> {
        if !endpoints.is_empty() {
            info!(
                job_name = %job.name,
                job_version = %job.version,
                count = endpoints.len(),
                "no edge proxy configured, public endpoints not exposed"
            );
        }
        Ok(())
    }
}
