//! Kubernetes backend.
//!
//! Jobs run as Deployments fronted by a Service in one namespace,
//! applied through the `kubectl` CLI. Build secrets live in a
//! Kubernetes Secret holding a JSON blob; secret runtime env vars get
//! their own Secret wired into the pod with `envFrom`.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::warn;

use racetrack_state::{job_resource_name, now_secs, JobRecord, JobStatus};

use crate::command::{shell_output, shell_output_with_stdin};
use crate::error::{InfraError, InfraResult};
use crate::health::{check_until_job_operational, HealthTimeouts};
use crate::target::InfrastructureTarget;
use crate::traits::{
    AliveHandler, JobDeployer, JobMonitor, JobSecrets, LineHandler, LogsStreamer, ProvisionRequest,
};

const JOB_PORT: u16 = 7000;

const JOB_NAME_LABEL: &str = "racetrack/job-name";
const JOB_VERSION_LABEL: &str = "racetrack/job-version";

/// Settings shared by the Kubernetes capabilities.
#[derive(Debug, Clone)]
pub struct KubernetesConfig {
    pub target_name: String,
    /// Namespace holding every job resource.
    pub namespace: String,
    pub health_timeouts: HealthTimeouts,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            target_name: "kubernetes".to_string(),
            namespace: "racetrack".to_string(),
            health_timeouts: HealthTimeouts::default(),
        }
    }
}

/// Assemble the three Kubernetes capabilities into one target.
pub fn kubernetes_target(config: KubernetesConfig) -> InfrastructureTarget {
    InfrastructureTarget {
        name: config.target_name.clone(),
        deployer: Arc::new(KubernetesDeployer {
            config: config.clone(),
        }),
        monitor: Arc::new(KubernetesMonitor {
            config: config.clone(),
        }),
        logs_streamer: Arc::new(KubernetesLogsStreamer {
            config,
            sessions: Mutex::new(HashMap::new()),
        }),
    }
}

pub struct KubernetesDeployer {
    config: KubernetesConfig,
}

#[async_trait]
impl JobDeployer for KubernetesDeployer {
    async fn deploy_job(&self, request: &ProvisionRequest) -> InfraResult<JobRecord> {
        let manifest = &request.manifest;
        let resource = job_resource_name(&manifest.name, &manifest.version);
        let namespace = &self.config.namespace;

        let rendered = render_job_resources(request, &resource, namespace);
        // `kubectl apply` replaces the previous instance in place.
        shell_output_with_stdin(&format!("kubectl apply -n {namespace} -f -"), &rendered).await?;

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
            internal_name: Some(format!("{resource}.{namespace}:{JOB_PORT}")),
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
        let resource = job_resource_name(name, version);
        let namespace = &self.config.namespace;
        shell_output(&format!(
            "kubectl delete deployment,service,secret -n {namespace} \
             --ignore-not-found {resource} {resource}-runtime-env {resource}-secrets"
        ))
        .await?;
        Ok(())
    }

    async fn job_exists(&self, name: &str, version: &str) -> InfraResult<bool> {
        let resource = job_resource_name(name, version);
        let out = shell_output(&format!(
            "kubectl get deployment -n {} --ignore-not-found -o name {resource}",
            self.config.namespace
        ))
        .await?;
        Ok(!out.trim().is_empty())
    }

    async fn save_job_secrets(
        &self,
        name: &str,
        version: &str,
        secrets: &JobSecrets,
    ) -> InfraResult<()> {
        let resource = job_resource_name(name, version);
        let namespace = &self.config.namespace;
        let payload = serde_json::to_vec(secrets)
            .map_err(|e| InfraError::Backend(format!("encoding job secrets: {e}")))?;
        let encoded = BASE64.encode(payload);

        let rendered = format!(
            "apiVersion: v1\n\
             kind: Secret\n\
             metadata:\n\
             \x20 name: {resource}-secrets\n\
             \x20 namespace: {namespace}\n\
             data:\n\
             \x20 secrets: {encoded}\n"
        );
        shell_output_with_stdin(&format!("kubectl apply -n {namespace} -f -"), &rendered).await?;
        Ok(())
    }

    async fn get_job_secrets(&self, name: &str, version: &str) -> InfraResult<JobSecrets> {
        let resource = job_resource_name(name, version);
        let out = shell_output(&format!(
            "kubectl get secret -n {} {resource}-secrets \
             --ignore-not-found -o jsonpath={{.data.secrets}}",
            self.config.namespace
        ))
        .await?;
        let encoded = out.trim();
        if encoded.is_empty() {
            return Ok(JobSecrets::empty());
        }
        let payload = BASE64
            .decode(encoded)
            .map_err(|e| InfraError::Backend(format!("decoding job secrets: {e}")))?;
        serde_json::from_slice(&payload)
            .map_err(|e| InfraError::Backend(format!("parsing job secrets: {e}")))
    }
}

pub struct KubernetesMonitor {
    config: KubernetesConfig,
}

#[async_trait]
impl JobMonitor for KubernetesMonitor {
    async fn list_jobs(&self) -> InfraResult<Vec<JobRecord>> {
        let out = shell_output(&format!(
            "kubectl get deployments -n {} -l '{JOB_NAME_LABEL}' -o json",
            self.config.namespace
        ))
        .await?;
        let listing: serde_json::Value = serde_json::from_str(&out)
            .map_err(|e| InfraError::Backend(format!("parsing deployment listing: {e}")))?;

        let mut jobs = Vec::new();
        for item in listing["items"].as_array().into_iter().flatten() {
            match parse_deployment_item(item, &self.config.target_name, &self.config.namespace) {
                Some(job) => jobs.push(job),
                None => warn!("unparseable deployment in listing"),
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
        let internal = job.internal_name.as_deref().ok_or_else(|| {
            InfraError::Backend(format!("job {} has no internal address", job.name))
        })?;
        let result = check_until_job_operational(
            &format!("http://{internal}"),
            &HashMap::new(),
            deployment_timestamp,
            on_job_alive,
            self.config.health_timeouts,
        )
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if logs_on_error => match self.read_recent_logs(job, 20).await {
                Ok(logs) => Err(InfraError::Verification(format!("{e}\nRecent logs:\n{logs}"))),
                Err(log_err) => {
                    warn!(error = %log_err, "failed to fetch logs of failing job");
                    Err(e)
                }
            },
            Err(e) => Err(e),
        }
    }

    async fn read_recent_logs(&self, job: &JobRecord, tail: u32) -> InfraResult<String> {
        let resource = job_resource_name(&job.name, &job.version);
        shell_output(&format!(
            "kubectl logs -n {} deployment/{resource} --tail {tail} --all-containers 2>&1",
            self.config.namespace
        ))
        .await
    }
}

/// Streams `kubectl logs -f` output of one deployment per session.
pub struct KubernetesLogsStreamer {
    config: KubernetesConfig,
    sessions: Mutex<HashMap<String, JoinHandle<()>>>,
}

#[async_trait]
impl LogsStreamer for KubernetesLogsStreamer {
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
        let resource = job_resource_name(name, version);

        let mut child = Command::new("kubectl")
            .args([
                "logs",
                "-f",
                "-n",
                &self.config.namespace,
                &format!("deployment/{resource}"),
                "--tail",
                &tail.to_string(),
            ])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| InfraError::Backend(format!("spawning kubectl logs: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| InfraError::Backend("kubectl logs has no stdout".to_string()))?;

        let id = session_id.to_string();
        let handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                on_next_line(&id, &line);
            }
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

/// Render the Deployment, Service and runtime-env Secret of one job.
fn render_job_resources(request: &ProvisionRequest, resource: &str, namespace: &str) -> String {
    let manifest = &request.manifest;
    let mut env = request.runtime_env.clone();
    env.insert(
        "DEPLOYMENT_TIMESTAMP".to_string(),
        request.deployment_timestamp.to_string(),
    );

    let mut env_lines = String::new();
    let mut keys: Vec<&String> = env.keys().collect();
    keys.sort();
    for key in keys {
        let _ = write!(
            env_lines,
            "            - name: {key}\n              value: \"{}\"\n",
            env[key].replace('"', "\\\"")
        );
    }

    let mut secret_data = String::new();
    let mut secret_keys: Vec<&String> = request.secret_runtime_env.keys().collect();
    secret_keys.sort();
    for key in secret_keys {
        let _ = write!(
            secret_data,
            "  {key}: {}\n",
            BASE64.encode(&request.secret_runtime_env[key])
        );
    }

    format!(
        r#"apiVersion: v1
kind: Secret
metadata:
  name: {resource}-runtime-env
  namespace: {namespace}
data:
{secret_data}---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: {resource}
  namespace: {namespace}
  labels:
    {JOB_NAME_LABEL}: "{name}"
    {JOB_VERSION_LABEL}: "{version}"
spec:
  replicas: {replicas}
  selector:
    matchLabels:
      app: {resource}
  template:
    metadata:
      labels:
        app: {resource}
        {JOB_NAME_LABEL}: "{name}"
        {JOB_VERSION_LABEL}: "{version}"
    spec:
      containers:
        - name: job
          image: {image}
          ports:
            - containerPort: {JOB_PORT}
          env:
{env_lines}          envFrom:
            - secretRef:
                name: {resource}-runtime-env
                optional: true
---
apiVersion: v1
kind: Service
metadata:
  name: {resource}
  namespace: {namespace}
  labels:
    {JOB_NAME_LABEL}: "{name}"
    {JOB_VERSION_LABEL}: "{version}"
spec:
  selector:
    app: {resource}
  ports:
    - port: {JOB_PORT}
      targetPort: {JOB_PORT}
"#,
        name = manifest.name,
        version = manifest.version,
        replicas = manifest.replicas,
        image = request.image_name,
    )
}

fn parse_deployment_item(
    item: &serde_json::Value,
    target_name: &str,
    namespace: &str,
) -> Option<JobRecord> {
    let labels = &item["metadata"]["labels"];
    let name = labels[JOB_NAME_LABEL].as_str()?;
    let version = labels[JOB_VERSION_LABEL].as_str()?;

    let desired = item["spec"]["replicas"].as_u64().unwrap_or(1);
    let ready = item["status"]["readyReplicas"].as_u64().unwrap_or(0);
    let resource = job_resource_name(name, version);

    let now = now_secs();
    Some(JobRecord {
        id: String::new(),
        family: name.to_string(),
        name: name.to_string(),
        version: version.to_string(),
        status: if ready > 0 { JobStatus::Running } else { JobStatus::Lost },
        create_time: now,
        update_time: now,
        manifest: None,
        internal_name: Some(format!("{resource}.{namespace}:{JOB_PORT}")),
        error: if ready > 0 {
            None
        } else {
            Some(format!("{ready}/{desired} replicas ready"))
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

#[cfg(test)]
mod tests {
    use super::*;
    use racetrack_state::{GitSource, JobFamilyRecord, Manifest};

    fn request() -> ProvisionRequest {
        let mut runtime_env = HashMap::new();
        runtime_env.insert("LOG_LEVEL".to_string(), "debug".to_string());
        let mut secret_runtime_env = HashMap::new();
        secret_runtime_env.insert("API_KEY".to_string(), "hunter2".to_string());
        ProvisionRequest {
            manifest: Manifest {
                name: "adder".to_string(),
                version: "1.0.0".to_string(),
                jobtype: "python3:latest".to_string(),
                git: GitSource {
                    remote: "https://github.com/example/jobs".to_string(),
                    branch: None,
                    directory: None,
                },
                owner_email: "dev@example.com".to_string(),
                infrastructure_target: None,
                build_env: HashMap::new(),
                runtime_env: HashMap::new(),
                secret_runtime_env_file: None,
                public_endpoints: Vec::new(),
                replicas: 2,
            },
            image_name: "registry.example.com/racetrack/job-entrypoint/adder:1700000000"
                .to_string(),
            deployment_timestamp: 1700000000,
            runtime_env,
            secret_runtime_env,
            family: JobFamilyRecord {
                id: "fam-1".to_string(),
                name: "adder".to_string(),
            },
        }
    }

    #[test]
    fn rendered_resources_carry_image_and_labels() {
        let rendered = render_job_resources(&request(), "job-adder-v-1-0-0", "racetrack");
        assert!(rendered.contains("name: job-adder-v-1-0-0"));
        assert!(rendered.contains("replicas: 2"));
        assert!(rendered.contains("image: registry.example.com/racetrack/job-entrypoint/adder:1700000000"));
        assert!(rendered.contains(r#"racetrack/job-name: "adder""#));
        assert!(rendered.contains("DEPLOYMENT_TIMESTAMP"));
        assert!(rendered.contains("value: \"1700000000\""));
        // Secret values are base64, never plaintext.
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains(&BASE64.encode("hunter2")));
    }

    #[test]
    fn parses_deployment_listing_item() {
        let item = serde_json::json!({
            "metadata": {
                "labels": {
                    "racetrack/job-name": "adder",
                    "racetrack/job-version": "1.0.0",
                }
            },
            "spec": {"replicas": 2},
            "status": {"readyReplicas": 2},
        });
        let job = parse_deployment_item(&item, "kubernetes", "racetrack").unwrap();
        assert_eq!(job.name, "adder");
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(
            job.internal_name.as_deref(),
            Some("job-adder-v-1-0-0.racetrack:7000")
        );
    }

    #[test]
    fn deployment_without_ready_replicas_is_lost() {
        let item = serde_json::json!({
            "metadata": {
                "labels": {
                    "racetrack/job-name": "adder",
                    "racetrack/job-version": "1.0.0",
                }
            },
            "spec": {"replicas": 1},
            "status": {},
        });
        let job = parse_deployment_item(&item, "kubernetes", "racetrack").unwrap();
        assert_eq!(job.status, JobStatus::Lost);
        assert!(job.error.unwrap().contains("0/1"));
    }

    #[test]
    fn deployment_without_labels_is_skipped() {
        let item = serde_json::json!({"metadata": {"labels": {}}});
        assert!(parse_deployment_item(&item, "kubernetes", "racetrack").is_none());
    }
}
