//! Domain types for the Racetrack registry store.
//!
//! These types represent the persisted state of job families, jobs,
//! deployment attempts and trashed jobs. All types are serializable
//! to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier for a deployment attempt.
pub type DeploymentId = String;

// ── Manifest ──────────────────────────────────────────────────────

/// Declarative description of a job workload, submitted by a user.
///
/// Consumed as an already-validated value object; a snapshot of it is
/// persisted with every job and deployment record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub name: String,
    /// Semantic version of this job, e.g. "1.0.2".
    pub version: String,
    /// Language/runtime identifier with version, e.g. "python3:latest".
    pub jobtype: String,
    /// Source code location.
    pub git: GitSource,
    pub owner_email: String,
    /// Preferred infrastructure target name, if any.
    #[serde(default)]
    pub infrastructure_target: Option<String>,
    /// Environment variables applied when building the image.
    #[serde(default)]
    pub build_env: HashMap<String, String>,
    /// Environment variables applied at runtime.
    #[serde(default)]
    pub runtime_env: HashMap<String, String>,
    /// Path to a file with secret runtime env vars (kept in the backend secret store).
    #[serde(default)]
    pub secret_runtime_env_file: Option<String>,
    /// Endpoint paths to expose publicly without authentication.
    #[serde(default)]
    pub public_endpoints: Vec<String>,
    /// Number of replicas to run.
    #[serde(default = "default_replicas")]
    pub replicas: u32,
}

fn default_replicas() -> u32 {
    1
}

/// Git location of the job source code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GitSource {
    pub remote: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub directory: Option<String>,
}

// ── Job ───────────────────────────────────────────────────────────

/// Lifecycle status of a deployed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Deployment in progress, not yet verified.
    Starting,
    Running,
    Error,
    /// Expected to be running but not reported by any monitor.
    Lost,
    /// Reported by a monitor but absent from the registry.
    Orphaned,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Starting => "starting",
            JobStatus::Running => "running",
            JobStatus::Error => "error",
            JobStatus::Lost => "lost",
            JobStatus::Orphaned => "orphaned",
        }
    }
}

/// One deployed (or previously deployed) version of a workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub id: String,
    /// Name of the owning job family.
    pub family: String,
    pub name: String,
    pub version: String,
    pub status: JobStatus,
    /// Unix timestamp (seconds) when this job was first deployed.
    pub create_time: u64,
    /// Unix timestamp (seconds) of the last update.
    pub update_time: u64,
    /// Manifest snapshot; may be absent for jobs discovered in a cluster.
    pub manifest: Option<Manifest>,
    /// Backend-specific address of the main replica.
    pub internal_name: Option<String>,
    pub error: Option<String>,
    /// Advisory notice, e.g. a deprecation warning.
    pub notice: Option<String>,
    /// Tag of the image this job was built into.
    pub image_tag: Option<String>,
    pub deployed_by: String,
    /// Unix timestamp of the last call made to this job, if known.
    pub last_call_time: Option<u64>,
    /// Name of the backend this job runs on.
    pub infrastructure_target: String,
    /// Backend-specific addresses of all replicas.
    pub replica_internal_names: Vec<String>,
    /// Job type identifier with version, e.g. "python3:2.4.0".
    pub job_type_version: String,
    /// Opaque backend statistics.
    #[serde(default)]
    pub infrastructure_stats: serde_json::Value,
}

// ── Job family ────────────────────────────────────────────────────

/// Identity grouping of all job versions sharing a name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobFamilyRecord {
    pub id: String,
    pub name: String,
}

// ── Deployment ────────────────────────────────────────────────────

/// Status of a deployment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    InProgress,
    Done,
    Failed,
}

/// One attempt to build and provision a specific job version.
///
/// Acts as the durable progress ledger for a background deployment:
/// callers poll it for `phase`, `status` and `error`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRecord {
    pub id: DeploymentId,
    pub status: DeploymentStatus,
    pub create_time: u64,
    pub update_time: u64,
    /// Manifest snapshot taken when the deployment was requested.
    pub manifest: Manifest,
    pub job_name: String,
    pub job_version: String,
    pub error: Option<String>,
    pub deployed_by: String,
    pub build_logs: Option<String>,
    /// Free-text progress label of the currently running phase.
    pub phase: Option<String>,
    pub image_name: Option<String>,
    pub infrastructure_target: String,
    /// Accumulated non-fatal warnings, newline-separated.
    pub warnings: Option<String>,
}

// ── Trash job ─────────────────────────────────────────────────────

/// Append-only tombstone of a deleted job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrashJobRecord {
    pub id: String,
    pub name: String,
    pub version: String,
    pub status: JobStatus,
    pub create_time: u64,
    pub update_time: u64,
    /// Unix timestamp when the job was deleted.
    pub delete_time: u64,
    pub manifest: Option<Manifest>,
    pub internal_name: Option<String>,
    pub error: Option<String>,
    pub image_tag: Option<String>,
    pub deployed_by: String,
    pub last_call_time: Option<u64>,
    pub infrastructure_target: String,
    /// How long the job lived before deletion, in days.
    pub age_days: f64,
}

// ── Keys & helpers ────────────────────────────────────────────────

impl JobRecord {
    /// Build the composite key for the jobs table.
    pub fn table_key(&self) -> String {
        job_table_key(&self.name, &self.version)
    }
}

impl TrashJobRecord {
    /// Build the composite key for the trash jobs table.
    pub fn table_key(&self) -> String {
        job_table_key(&self.name, &self.version)
    }
}

/// Composite key for job-like tables: `{name}/{version}`.
pub fn job_table_key(name: &str, version: &str) -> String {
    format!("{name}/{version}")
}

/// Deterministic backend-addressing name of a job resource.
///
/// Used as the container/deployment name in backends and as the
/// reconciliation key. Dots are not allowed in most backend resource
/// names, so the version is mangled.
pub fn job_resource_name(name: &str, version: &str) -> String {
    format!("job-{}-v-{}", name, version.replace('.', "-"))
}

/// Current unix timestamp in seconds.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
