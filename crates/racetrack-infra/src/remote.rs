//! Remote gateway backend.
//!
//! Forwards every infrastructure operation over HTTP to a gateway agent
//! running next to the actual cluster, authenticated with a shared
//! token. The gateway also proxies job liveness and readiness
//! endpoints, so health verification reuses the local probe loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use racetrack_state::JobRecord;

use crate::error::{InfraError, InfraResult};
use crate::health::{check_until_job_operational, HealthTimeouts};
use crate::http::{http_delete, http_get, http_post_json};
use crate::target::InfrastructureTarget;
use crate::traits::{
    AliveHandler, JobDeployer, JobMonitor, JobSecrets, LineHandler, LogsStreamer, ProvisionRequest,
};

const GATEWAY_TOKEN_HEADER: &str = "x-racetrack-gateway-token";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Deployments build images remotely, allow much longer.
const DEPLOY_TIMEOUT: Duration = Duration::from_secs(600);

const LOGS_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Connection settings of one remote gateway.
#[derive(Debug, Clone)]
pub struct RemoteGatewayConfig {
    /// Name under which this gateway registers as a target.
    pub target_name: String,
    /// Base URL of the gateway agent, e.g. `http://gateway.example.com:7105`.
    pub gateway_url: String,
    /// Shared token expected by the gateway.
    pub gateway_token: String,
    pub health_timeouts: HealthTimeouts,
}

/// Assemble the three remote capabilities into one target.
pub fn remote_target(config: RemoteGatewayConfig) -> InfrastructureTarget {
    let client = Arc::new(GatewayClient::new(config.clone()));
    InfrastructureTarget {
        name: config.target_name.clone(),
        deployer: Arc::new(RemoteDeployer {
            client: client.clone(),
        }),
        monitor: Arc::new(RemoteMonitor {
            client: client.clone(),
            timeouts: config.health_timeouts,
        }),
        logs_streamer: Arc::new(RemoteLogsStreamer {
            client,
            sessions: Mutex::new(HashMap::new()),
        }),
    }
}

/// Shared HTTP plumbing for talking to one gateway.
struct GatewayClient {
    config: RemoteGatewayConfig,
    headers: HashMap<String, String>,
}

impl GatewayClient {
    fn new(config: RemoteGatewayConfig) -> Self {
        let mut headers = HashMap::new();
        headers.insert(GATEWAY_TOKEN_HEADER.to_string(), config.gateway_token.clone());
        Self { config, headers }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.gateway_url.trim_end_matches('/'))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> InfraResult<T> {
        let resp = http_get(&self.url(path), &self.headers, REQUEST_TIMEOUT).await?;
        if !resp.is_success() {
            return Err(gateway_error(path, resp.status, &resp.text()));
        }
        resp.json()
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> InfraResult<T> {
        let resp = http_post_json(&self.url(path), body, &self.headers, timeout).await?;
        if !resp.is_success() {
            return Err(gateway_error(path, resp.status, &resp.text()));
        }
        resp.json()
    }

    async fn delete(&self, path: &str) -> InfraResult<()> {
        let resp = http_delete(&self.url(path), &self.headers, REQUEST_TIMEOUT).await?;
        if !resp.is_success() {
            return Err(gateway_error(path, resp.status, &resp.text()));
        }
        Ok(())
    }
}

fn gateway_error(path: &str, status: u16, body: &str) -> InfraError {
    InfraError::Backend(format!("gateway call {path} returned status {status}: {body}"))
}

pub struct RemoteDeployer {
    client: Arc<GatewayClient>,
}

#[async_trait]
impl JobDeployer for RemoteDeployer {
    async fn deploy_job(&self, request: &ProvisionRequest) -> InfraResult<JobRecord> {
        let body = serde_json::to_value(request)
            .map_err(|e| InfraError::Backend(format!("encoding provision request: {e}")))?;
        let mut job: JobRecord = self
            .client
            .post_json("/remote/api/v1/deploy", &body, DEPLOY_TIMEOUT)
            .await?;
        // The remote agent reports its local target name, ours is authoritative.
        job.infrastructure_target = self.client.config.target_name.clone();
        Ok(job)
    }

    async fn delete_job(&self, name: &str, version: &str) -> InfraResult<()> {
        self.client
            .delete(&format!("/remote/api/v1/job/{name}/{version}"))
            .await
    }

    async fn job_exists(&self, name: &str, version: &str) -> InfraResult<bool> {
        #[derive(serde::Deserialize)]
        struct Exists {
            exists: bool,
        }
        let resp: Exists = self
            .client
            .get_json(&format!("/remote/api/v1/job/{name}/{version}/exists"))
            .await?;
        Ok(resp.exists)
    }

    async fn save_job_secrets(
        &self,
        name: &str,
        version: &str,
        secrets: &JobSecrets,
    ) -> InfraResult<()> {
        let body = serde_json::to_value(secrets)
            .map_err(|e| InfraError::Backend(format!("encoding job secrets: {e}")))?;
        let _: serde_json::Value = self
            .client
            .post_json(
                &format!("/remote/api/v1/job/{name}/{version}/secrets"),
                &body,
                REQUEST_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    async fn get_job_secrets(&self, name: &str, version: &str) -> InfraResult<JobSecrets> {
        self.client
            .get_json(&format!("/remote/api/v1/job/{name}/{version}/secrets"))
            .await
    }
}

pub struct RemoteMonitor {
    client: Arc<GatewayClient>,
    timeouts: HealthTimeouts,
}

#[async_trait]
impl JobMonitor for RemoteMonitor {
    async fn list_jobs(&self) -> InfraResult<Vec<JobRecord>> {
        let mut jobs: Vec<JobRecord> = self.client.get_json("/remote/api/v1/jobs").await?;
        for job in &mut jobs {
            job.infrastructure_target = self.client.config.target_name.clone();
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
        // The gateway proxies /live and /ready of each job.
        let base_url = self
            .client
            .url(&format!("/remote/api/v1/job/{}/{}/proxy", job.name, job.version));
        let result = check_until_job_operational(
            &base_url,
            &self.client.headers,
            deployment_timestamp,
            on_job_alive,
            self.timeouts,
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
        let path = format!(
            "/remote/api/v1/job/{}/{}/logs?tail={tail}",
            job.name, job.version
        );
        let resp = http_get(&self.client.url(&path), &self.client.headers, REQUEST_TIMEOUT).await?;
        if !resp.is_success() {
            return Err(gateway_error(&path, resp.status, &resp.text()));
        }
        Ok(resp.text())
    }
}

/// Polls the gateway's logs endpoint and emits lines appearing since the
/// previous poll. Gateways don't keep streaming connections open, so
/// tailing is approximated by diffing consecutive snapshots.
pub struct RemoteLogsStreamer {
    client: Arc<GatewayClient>,
    sessions: Mutex<HashMap<String, JoinHandle<()>>>,
}

#[async_trait]
impl LogsStreamer for RemoteLogsStreamer {
    async fn create_session(
        &self,
        session_id: &str,
        selectors: HashMap<String, String>,
        on_next_line: LineHandler,
    ) -> InfraResult<()> {
        let name = selectors
            .get("job_name")
            .ok_or_else(|| InfraError::Backend("missing job_name selector".to_string()))?
            .clone();
        let version = selectors
            .get("job_version")
            .ok_or_else(|| InfraError::Backend("missing job_version selector".to_string()))?
            .clone();
        let tail = selectors
            .get("tail")
            .and_then(|t| t.parse::<u32>().ok())
            .unwrap_or(20);

        let client = self.client.clone();
        let id = session_id.to_string();
        let handle = tokio::spawn(async move {
            let path = format!("/remote/api/v1/job/{name}/{version}/logs?tail={tail}");
            let mut previous = String::new();
            loop {
                match http_get(&client.url(&path), &client.headers, REQUEST_TIMEOUT).await {
                    Ok(resp) if resp.is_success() => {
                        let current = resp.text();
                        for line in new_lines(&previous, &current) {
                            on_next_line(&id, line);
                        }
                        previous = current;
                    }
                    Ok(resp) => {
                        debug!(status = resp.status, "gateway logs poll failed");
                    }
                    Err(e) => {
                        debug!(error = %e, "gateway logs poll failed");
                    }
                }
                tokio::time::sleep(LOGS_POLL_INTERVAL).await;
            }
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

/// Lines present in `current` but not yet emitted from `previous`.
/// When the snapshots don't share a prefix (log rotation), the whole
/// current snapshot is treated as new.
fn new_lines<'a>(previous: &str, current: &'a str) -> Vec<&'a str> {
    let remainder = match current.strip_prefix(previous) {
        Some(rest) => rest,
        None => current,
    };
    remainder.lines().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_lines_emits_only_the_suffix() {
        let previous = "one\ntwo\n";
        let current = "one\ntwo\nthree\nfour\n";
        assert_eq!(new_lines(previous, current), vec!["three", "four"]);
    }

    #[test]
    fn new_lines_handles_rotation() {
        let previous = "old content\n";
        let current = "fresh start\n";
        assert_eq!(new_lines(previous, current), vec!["fresh start"]);
    }

    #[test]
    fn new_lines_empty_when_unchanged() {
        let snapshot = "one\ntwo\n";
        assert!(new_lines(snapshot, snapshot).is_empty());
    }
}
