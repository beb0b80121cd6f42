//! Capability traits implemented by every infrastructure backend.
//!
//! Each backend (Docker, Kubernetes, remote gateway) provides three
//! independent capabilities: a `JobDeployer` creating and destroying
//! workloads, a `JobMonitor` discovering and probing them, and a
//! `LogsStreamer` for live log tailing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use racetrack_state::{JobFamilyRecord, JobRecord, Manifest};

use crate::error::InfraResult;

/// Handler called when a job server responds to a liveness probe but is
/// not ready yet (running already, still initializing).
pub type AliveHandler = Arc<dyn Fn() + Send + Sync>;

/// Handler receiving log lines for a streaming session: `(session_id, line)`.
pub type LineHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Credentials for accessing a private source repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Credentials and secret env vars needed to build and deploy a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobSecrets {
    pub git_credentials: Option<Credentials>,
    #[serde(default)]
    pub secret_build_env: HashMap<String, String>,
    #[serde(default)]
    pub secret_runtime_env: HashMap<String, String>,
}

impl JobSecrets {
    /// Empty secrets, used when a backend has no secret store.
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Everything a deployer needs to create the workload for one job version.
/// Serializable so it can be forwarded to remote gateways verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub manifest: Manifest,
    /// Full image name (registry, namespace, name, tag) built for this job.
    pub image_name: String,
    /// Unix timestamp of the deployment, passed to the workload so
    /// probes can tell a new instance from a dying old one.
    pub deployment_timestamp: u64,
    /// Merged plain runtime env vars (secrets excluded).
    pub runtime_env: HashMap<String, String>,
    /// Secret runtime env vars, injected through the backend secret store.
    pub secret_runtime_env: HashMap<String, String>,
    pub family: JobFamilyRecord,
}

/// Creates and destroys job workloads in one backend.
#[async_trait]
pub trait JobDeployer: Send + Sync {
    /// Deploy a job from a manifest. Must be safe to call when an old
    /// instance with the same (name, version) exists: backends delete
    /// then recreate. Returns a provisional job record, not yet persisted.
    async fn deploy_job(&self, request: &ProvisionRequest) -> InfraResult<JobRecord>;

    /// Delete the workload of a job version.
    async fn delete_job(&self, name: &str, version: &str) -> InfraResult<()>;

    /// Tell whether a workload for this job version already exists.
    async fn job_exists(&self, name: &str, version: &str) -> InfraResult<bool>;

    /// Create or update secrets needed to build and deploy a job.
    /// May fail with `SecretsUnsupported` on backends without a secret store.
    async fn save_job_secrets(
        &self,
        name: &str,
        version: &str,
        secrets: &JobSecrets,
    ) -> InfraResult<()>;

    /// Retrieve secrets for building and deploying a job.
    /// May fail with `SecretsUnsupported` on backends without a secret store.
    async fn get_job_secrets(&self, name: &str, version: &str) -> InfraResult<JobSecrets>;
}

/// Discovers workloads running in one backend and probes their condition.
#[async_trait]
pub trait JobMonitor: Send + Sync {
    /// Best-effort discovery of every job the backend currently runs,
    /// annotated with derived status and error if the probe fails.
    async fn list_jobs(&self) -> InfraResult<Vec<JobRecord>>;

    /// Verify that a deployed job is really operational; fail with the
    /// reason otherwise.
    ///
    /// `deployment_timestamp` guards against probing a dying old
    /// instance (zero skips the check). `on_job_alive` fires the moment
    /// the server responds to a liveness probe, before it is ready.
    /// With `logs_on_error`, recent logs are attached to the failure;
    /// a failing log fetch never masks the original error.
    async fn check_job_condition(
        &self,
        job: &JobRecord,
        deployment_timestamp: u64,
        on_job_alive: Option<AliveHandler>,
        logs_on_error: bool,
    ) -> InfraResult<()>;

    /// Return the last `tail` output lines of a job, joined into one string.
    async fn read_recent_logs(&self, job: &JobRecord, tail: u32) -> InfraResult<String>;
}

/// Producer of live log lines, managing per-client sessions.
#[async_trait]
pub trait LogsStreamer: Send + Sync {
    /// Start a session transmitting log lines to `on_next_line`.
    /// `selectors` describe the watched resource (job name, version, tail).
    async fn create_session(
        &self,
        session_id: &str,
        selectors: HashMap<String, String>,
        on_next_line: LineHandler,
    ) -> InfraResult<()>;

    /// Tear down a session when a client disconnects.
    async fn close_session(&self, session_id: &str);
}
