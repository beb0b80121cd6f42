//! racetrack-pipeline — the deployment pipeline.
//!
//! Orchestrates build → provision → verify → post-deploy for one job
//! version, with the Deployment row as the durable progress ledger and
//! a per-(name, version) concurrency guard. Collaborators (image
//! builder, auth oracle, endpoint registrar, audit sink) are traits;
//! the pipeline owns only the orchestration.

pub mod audit;
pub mod auth;
pub mod builder;
pub mod deployment;
pub mod endpoints;
pub mod error;
pub mod pipeline;

#[cfg(test)]
pub(crate) mod testing;

pub use audit::{AuditEvent, AuditLog, TracingAuditLog};
pub use auth::{AllowAll, AuthOracle, AuthResource, AuthScope};
pub use builder::{BuildRequest, BuildResult, ImageBuilder, RemoteImageBuilder};
pub use deployment::{check_deployment, list_recent_deployments, DeploymentView};
pub use endpoints::{NoopEndpointRegistrar, PublicEndpointRegistrar};
pub use error::{PipelineError, PipelineResult};
pub use pipeline::{DeploymentPipeline, PipelineConfig};
