//! Docker backend.
//!
//! Runs each job as a single container managed through the `docker`
//! CLI. Containers are labeled with the job name and version so the
//! monitor can rediscover them after a restart. Docker has no secret
//! store, so secret operations report `SecretsUnsupported` and the
//! pipeline downgrades to empty secrets with a warning.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use racetrack_state::{job_resource_name, now_secs, JobRecord, JobStatus};

use crate::command::shell_output;
use crate::error::{InfraError, InfraResult};
use crate::health::{check_until_job_operational, HealthTimeouts};
use crate::target::InfrastructureTarget;
use crate::traits::{
    AliveHandler, JobDeployer, JobMonitor, JobSecrets, LineHandler, LogsStreamer, ProvisionRequest,
};

/// Port the job server listens on inside its container.
const JOB_PORT: u16 = 7000;

const JOB_NAME_LABEL: &str = "racetrack-job-name";
const JOB_VERSION_LABEL: &str = "racetrack-job-version";

/// Settings shared by the Docker capabilities.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Name under which this backend registers itself.
    pub target_name: String,
    /// Docker network joined by job containers, so the control plane
    /// can reach them by container name.
    pub network: Option<String>,
    pub health_timeouts: HealthTimeouts,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            target_name: "docker".to_string(),
            network: None,
            health_timeouts: HealthTimeouts::default(),
        }
    }
}

/// Assemble the three Docker capabilities into one target.
pub fn docker_target(config: DockerConfig) -> InfrastructureTarget {
    InfrastructureTarget {
        name: config.target_name.clone(),
        deployer: Arc::new(DockerDeployer {
            config: config.clone(),
        }),
        monitor: Arc::new(DockerMonitor {
            config: config.clone(),
        }),
        logs_streamer: Arc::new(DockerLogsStreamer::default()),
    }
}

pub struct DockerDeployer {
    config: DockerConfig,
}

#[async_trait]
impl JobDeployer for DockerDeployer {
    async fn deploy_job(&self, request: &ProvisionRequest) -> InfraResult<JobRecord> {
        let manifest = &request.manifest;
        let container = job_resource_name(&manifest.name, &manifest.version);

        // Redeploying replaces the container wholesale.
        if self.job_exists(&manifest.name, &manifest.version).await? {
            debug!(%container, "removing previous container before redeploy");
            shell_output(&format!("docker rm -f {container}")).await?;
        }

        let mut cmd = format!(
            "docker run -d --name {container} \
             --label {JOB_NAME_LABEL}={} --label {JOB_VERSION_LABEL}={}",
            shell_quote(&manifest.name),
            shell_quote(&manifest.version),
        );
        if let Some(network) = &self.config.network {
            cmd.push_str(&format!(" --network {}", shell_quote(network)));
        }
        let mut env = request.runtime_env.clone();
        env.insert(
            "DEPLOYMENT_TIMESTAMP".to_string(),
            request.deployment_timestamp.to_string(),
        );
        let mut keys: Vec<&String> = env.keys().collect();
        keys.sort();
        for key in keys {
            cmd.push_str(&format!(" --env {}={}", key, shell_quote(&env[key])));
        }
        cmd.push_str(&format!(" {}", shell_quote(&request.image_name)));

        shell_output(&cmd).await?;

        let now = now_secs();
        Ok(JobRecord {
            id: String::new(),
            family: request.family.name.clone(),
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            status: JobStatus::Starting,
            create_time: now,
            update_time: now,
            manifest: Some(manifest.clone()),
            internal_name: Some(format!("{container}:{JOB_PORT}")),
            error: None,
            notice: None,
            image_tag: None,
            deployed_by: String::new(),
            last_call_time: None,
            infrastructure_target: self.config.target_name.clone(),
            replica_internal_names: Vec::new(),
            job_type_version: manifest.jobtype.clone(),
            infrastructure_stats: serde_json::Value::Null,
        })
    }

    async fn delete_job(&self, name: &str, version: &str) -> InfraResult<()> {
        let container = job_resource_name(name, version);
        shell_output(&format!("docker rm -f {container}")).await?;
        Ok(())
    }

    async fn job_exists(&self, name: &str, version: &str) -> InfraResult<bool> {
        let container = job_resource_name(name, version);
        let out = shell_output(&format!(
            "docker ps -a --filter name=^/{container}$ --format '{{{{.Names}}}}'"
        ))
        .await?;
        Ok(out.lines().any(|line| line.trim() == container))
    }

    async fn save_job_secrets(
        &self,
        _name: &str,
        _version: &str,
        _secrets: &JobSecrets,
    ) -> InfraResult<()> {
        Err(InfraError::SecretsUnsupported {
            target: self.config.target_name.clone(),
        })
    }

    async fn get_job_secrets(&self, _name: &str, _version: &str) -> InfraResult<JobSecrets> {
        Err(InfraError::SecretsUnsupported {
            target: self.config.target_name.clone(),
        })
    }
}

pub struct DockerMonitor {
    config: DockerConfig,
}

#[async_trait]
impl JobMonitor for DockerMonitor {
    async fn list_jobs(&self) -> InfraResult<Vec<JobRecord>> {
        let out = shell_output(&format!(
            "docker ps -a --filter label={JOB_NAME_LABEL} --format \
             '{{{{.Names}}}}|{{{{.Label \"{JOB_NAME_LABEL}\"}}}}|{{{{.Label \"{JOB_VERSION_LABEL}\"}}}}|{{{{.Status}}}}'"
        ))
        .await?;

        let mut jobs = Vec::new();
        for line in out.lines().filter(|l| !l.trim().is_empty()) {
            match parse_container_line(line, &self.config.target_name) {
                Some(job) => jobs.push(job),
                None => warn!(%line, "unparseable container listing line"),
            }
        }
        Ok(jobs)
    }

    async fn check_job_condition(
        &self,
        job: &JobRecord,
        deployment_timestamp: u64,
        on_job_alive: Option<AliveHandler>,
        logs_on_error: bool,
    ) -> InfraResult<()> {
        let base_url = internal_base_url(job)?;
        let result = check_until_job_operational(
            &base_url,
            &HashMap::new(),
            deployment_timestamp,
            on_job_alive,
            self.config.health_timeouts,
        )
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if logs_on_error => {
                // Attaching logs is best-effort, the probe failure stands either way.
                match self.read_recent_logs(job, 20).await {
                    Ok(logs) => Err(InfraError::Verification(format!("{e}\nRecent logs:\n{logs}"))),
                    Err(log_err) => {
                        warn!(error = %log_err, "failed to fetch logs of failing job");
                        Err(e)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn read_recent_logs(&self, job: &JobRecord, tail: u32) -> InfraResult<String> {
        let container = job_resource_name(&job.name, &job.version);
        shell_output(&format!("docker logs --tail {tail} {container} 2>&1")).await
    }
}

/// Streams `docker logs -f` output of one container per session.
#[derive(Default)]
pub struct DockerLogsStreamer {
    sessions: Mutex<HashMap<String, JoinHandle<()>>>,
}

#[async_trait]
impl LogsStreamer for DockerLogsStreamer {
    async fn create_session(
        &self,
        session_id: &str,
        selectors: HashMap<String, String>,
        on_next_line: LineHandler,
    ) -> InfraResult<()> {
        let name = selectors
            .get("job_name")
            .ok_or_else(|| InfraError::Backend("missing job_name selector".to_string()))?;
        let version = selectors
            .get("job_version")
            .ok_or_else(|| InfraError::Backend("missing job_version selector".to_string()))?;
        let tail = selectors
            .get("tail")
            .and_then(|t| t.parse::<u32>().ok())
            .unwrap_or(20);
        let container = job_resource_name(name, version);

        let mut child = Command::new("docker")
            .args(["logs", "-f", "--tail", &tail.to_string(), &container])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| InfraError::Backend(format!("spawning docker logs: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| InfraError::Backend("docker logs has no stdout".to_string()))?;

        let id = session_id.to_string();
        let handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                on_next_line(&id, &line);
            }
            // Dropping the child kills the follower process.
            drop(child);
        });

        self.sessions
            .lock()
            .expect("sessions lock poisoned")
            .insert(session_id.to_string(), handle);
        Ok(())
    }

    async fn close_session(&self, session_id: &str) {
        if let Some(handle) = self
            .sessions
            .lock()
            .expect("sessions lock poisoned")
            .remove(session_id)
        {
            handle.abort();
        }
    }
}

fn internal_base_url(job: &JobRecord) -> InfraResult<String> {
    let internal = job
        .internal_name
        .as_deref()
        .ok_or_else(|| InfraError::Backend(format!("job {} has no internal address", job.name)))?;
    Ok(format!("http://{internal}"))
}

/// Parse one `docker ps` line: `names|job-name|job-version|status`.
fn parse_container_line(line: &str, target_name: &str) -> Option<JobRecord> {
    let mut parts = line.trim().splitn(4, '|');
    let container = parts.next()?;
    let name = parts.next()?;
    let version = parts.next()?;
    let docker_status = parts.next()?;
    if name.is_empty() || version.is_empty() {
        return None;
    }

    let running = docker_status.starts_with("Up");
    let now = now_secs();
    Some(JobRecord {
        id: String::new(),
        family: name.to_string(),
        name: name.to_string(),
        version: version.to_string(),
        status: if running { JobStatus::Running } else { JobStatus::Lost },
        create_time: now,
        update_time: now,
        manifest: None,
        internal_name: Some(format!("{container}:{JOB_PORT}")),
        error: if running {
            None
        } else {
            Some(format!("container is not running: {docker_status}"))
        },
        notice: None,
        image_tag: None,
        deployed_by: String::new(),
        last_call_time: None,
        infrastructure_target: target_name.to_string(),
        replica_internal_names: Vec::new(),
        job_type_version: String::new(),
        infrastructure_stats: serde_json::Value::Null,
    })
}

/// Quote a value for safe interpolation into an `sh -c` command line.
fn shell_quote(value: &str) -> String {
    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_.:/=@".contains(c))
    {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}
