//! In-memory stub backends for tests.
//!
//! These record every call so tests can assert what the orchestration
//! layer asked the infrastructure to do, without a real Docker daemon
//! or cluster.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use racetrack_state::{now_secs, JobRecord, JobStatus};

use crate::error::{InfraError, InfraResult};
use crate::job_type::JobType;
use crate::target::{InfrastructureTarget, TargetProvider};
use crate::traits::{
    AliveHandler, JobDeployer, JobMonitor, JobSecrets, LineHandler, LogsStreamer, ProvisionRequest,
};

/// Deployer that keeps workloads in memory.
#[derive(Default)]
pub struct StubDeployer {
    pub target_name: String,
    /// When false, secret operations fail with `SecretsUnsupported`.
    pub secrets_supported: bool,
    /// When set, `deploy_job` fails with this message.
    pub fail_deploy: Mutex<Option<String>>,
    pub deployed: Mutex<Vec<ProvisionRequest>>,
    pub deleted: Mutex<Vec<(String, String)>>,
    pub secrets: Mutex<HashMap<String, JobSecrets>>,
}

impl StubDeployer {
    pub fn new(target_name: &str) -> Self {
        Self {
            target_name: target_name.to_string(),
            secrets_supported: true,
            ..Default::default()
        }
    }

    pub fn without_secrets(target_name: &str) -> Self {
        Self {
            target_name: target_name.to_string(),
            secrets_supported: false,
            ..Default::default()
        }
    }

    pub fn deploy_count(&self) -> usize {
        self.deployed.lock().unwrap().len()
    }
}

#[async_trait]
impl JobDeployer for StubDeployer {
    async fn deploy_job(&self, request: &ProvisionRequest) -> InfraResult<JobRecord> {
        if let Some(msg) = self.fail_deploy.lock().unwrap().clone() {
            return Err(InfraError::Backend(msg));
        }
        self.deployed.lock().unwrap().push(request.clone());
        let now = now_secs();
        Ok(JobRecord {
            id: format!("{}-{}", request.manifest.name, request.manifest.version),
            family: request.family.name.clone(),
            name: request.manifest.name.clone(),
            version: request.manifest.version.clone(),
            status: JobStatus::Starting,
            create_time: now,
            update_time: now,
            manifest: Some(request.manifest.clone()),
            internal_name: Some(format!(
                "stub/{}-{}",
                request.manifest.name, request.manifest.version
            )),
            error: None,
            notice: None,
            image_tag: Some(request.deployment_timestamp.to_string()),
            deployed_by: String::new(),
            last_call_time: None,
            infrastructure_target: self.target_name.clone(),
            replica_internal_names: Vec::new(),
            job_type_version: request.manifest.jobtype.clone(),
            infrastructure_stats: serde_json::Value::Null,
        })
    }

    async fn delete_job(&self, name: &str, version: &str) -> InfraResult<()> {
        self.deleted
            .lock()
            .unwrap()
            .push((name.to_string(), version.to_string()));
        Ok(())
    }

    async fn job_exists(&self, name: &str, version: &str) -> InfraResult<bool> {
        let deployed = self.deployed.lock().unwrap();
        Ok(deployed
            .iter()
            .any(|r| r.manifest.name == name && r.manifest.version == version))
    }

    async fn save_job_secrets(
        &self,
        name: &str,
        version: &str,
        secrets: &JobSecrets,
    ) -> InfraResult<()> {
        if !self.secrets_supported {
            return Err(InfraError::SecretsUnsupported {
                target: self.target_name.clone(),
            });
        }
        self.secrets
            .lock()
            .unwrap()
            .insert(format!("{name}/{version}"), secrets.clone());
        Ok(())
    }

    async fn get_job_secrets(&self, name: &str, version: &str) -> InfraResult<JobSecrets> {
        if !self.secrets_supported {
            return Err(InfraError::SecretsUnsupported {
                target: self.target_name.clone(),
            });
        }
        Ok(self
            .secrets
            .lock()
            .unwrap()
            .get(&format!("{name}/{version}"))
            .cloned()
            .unwrap_or_default())
    }
}

/// Monitor reporting a fixed set of jobs and a configurable condition.
#[derive(Default)]
pub struct StubMonitor {
    pub jobs: Mutex<Vec<JobRecord>>,
    /// When set, `list_jobs` fails with this message.
    pub list_error: Mutex<Option<String>>,
    /// When set, `check_job_condition` fails with this message.
    pub condition_error: Mutex<Option<String>>,
    pub logs: Mutex<String>,
}

impl StubMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_jobs(&self, jobs: Vec<JobRecord>) {
        *self.jobs.lock().unwrap() = jobs;
    }

    pub fn set_list_error(&self, error: Option<&str>) {
        *self.list_error.lock().unwrap() = error.map(str::to_string);
    }

    pub fn set_condition_error(&self, error: Option<&str>) {
        *self.condition_error.lock().unwrap() = error.map(str::to_string);
    }
}

#[async_trait]
impl JobMonitor for StubMonitor {
    async fn list_jobs(&self) -> InfraResult<Vec<JobRecord>> {
        if let Some(msg) = self.list_error.lock().unwrap().clone() {
            return Err(InfraError::Backend(msg));
        }
        Ok(self.jobs.lock().unwrap().clone())
    }

    async fn check_job_condition(
        &self,
        _job: &JobRecord,
        _deployment_timestamp: u64,
        on_job_alive: Option<AliveHandler>,
        _logs_on_error: bool,
    ) -> InfraResult<()> {
        if let Some(msg) = self.condition_error.lock().unwrap().clone() {
            return Err(InfraError::Verification(msg));
        }
        if let Some(handler) = on_job_alive {
            handler();
        }
        Ok(())
    }

    async fn read_recent_logs(&self, _job: &JobRecord, _tail: u32) -> InfraResult<String> {
        Ok(self.logs.lock().unwrap().clone())
    }
}

/// Streamer that records sessions instead of tailing anything.
#[derive(Default)]
pub struct StubStreamer {
    pub sessions: Mutex<Vec<String>>,
}

#[async_trait]
impl LogsStreamer for StubStreamer {
    async fn create_session(
        &self,
        session_id: &str,
        _selectors: HashMap<String, String>,
        _on_next_line: LineHandler,
    ) -> InfraResult<()> {
        self.sessions.lock().unwrap().push(session_id.to_string());
        Ok(())
    }

    async fn close_session(&self, session_id: &str) {
        self.sessions.lock().unwrap().retain(|s| s != session_id);
    }
}

/// Build a target around fresh stubs, returning handles to them.
pub fn stub_target_parts(
    name: &str,
) -> (InfrastructureTarget, Arc<StubDeployer>, Arc<StubMonitor>) {
    let deployer = Arc::new(StubDeployer::new(name));
    let monitor = Arc::new(StubMonitor::new());
    let target = InfrastructureTarget {
        name: name.to_string(),
        deployer: deployer.clone(),
        monitor: monitor.clone(),
        logs_streamer: Arc::new(StubStreamer::default()),
    };
    (target, deployer, monitor)
}

/// Build a target around fresh stubs, discarding the handles.
pub fn stub_target(name: &str) -> InfrastructureTarget {
    stub_target_parts(name).0
}

/// Provider serving a fixed list of targets and job types.
#[derive(Clone)]
pub struct StubProvider {
    priority: i32,
    targets: Vec<InfrastructureTarget>,
    job_types: Vec<JobType>,
}

impl StubProvider {
    pub fn new(priority: i32, targets: Vec<InfrastructureTarget>) -> Self {
        Self {
            priority,
            targets,
            job_types: Vec::new(),
        }
    }

    pub fn with_job_types(mut self, job_types: Vec<JobType>) -> Self {
        self.job_types = job_types;
        self
    }

    pub fn targets(&self) -> &[InfrastructureTarget] {
        &self.targets
    }
}

impl TargetProvider for StubProvider {
    fn priority(&self) -> i32 {
        self.priority
    }

    fn infrastructure_targets(&self) -> Vec<InfrastructureTarget> {
        self.targets.clone()
    }

    fn job_types(&self) -> Vec<JobType> {
        self.job_types.clone()
    }
}
