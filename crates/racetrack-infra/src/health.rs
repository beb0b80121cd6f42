//! Liveness and readiness verification of deployed job servers.
//!
//! A freshly provisioned job goes through two gates: `/live` proves the
//! HTTP server answers at all, `/ready` proves the entrypoint finished
//! initializing. Probing retries with exponential backoff.

use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;

use crate::error::{InfraError, InfraResult};
use crate::http::http_get;
use crate::traits::AliveHandler;

/// How long each phase may take before verification gives up.
#[derive(Debug, Clone, Copy)]
pub struct HealthTimeouts {
    /// Waiting for the job server to answer `/live`.
    pub alive: Duration,
    /// Waiting for `/ready` after the server is alive.
    pub ready: Duration,
}

impl Default for HealthTimeouts {
    fn default() -> Self {
        Self {
            alive: Duration::from_secs(60),
            ready: Duration::from_secs(300),
        }
    }
}

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(3);

/// Wait until a job server at `base_url` is fully operational.
///
/// Polls `/live` until the server answers, verifies the reported
/// deployment timestamp (a stale instance of the previous version may
/// still be draining), fires `on_job_alive`, then polls `/ready`.
pub async fn check_until_job_operational(
    base_url: &str,
    headers: &HashMap<String, String>,
    deployment_timestamp: u64,
    on_job_alive: Option<AliveHandler>,
    timeouts: HealthTimeouts,
) -> InfraResult<()> {
    wait_for_endpoint(base_url, headers, "/live", deployment_timestamp, timeouts.alive).await?;
    if let Some(handler) = on_job_alive {
        handler();
    }
    wait_for_endpoint(base_url, headers, "/ready", 0, timeouts.ready).await
}

/// One-shot check that a running job still answers its liveness probe.
pub async fn quick_check_job_condition(
    base_url: &str,
    headers: &HashMap<String, String>,
) -> InfraResult<()> {
    probe(base_url, headers, "/live", 0).await
}

async fn wait_for_endpoint(
    base_url: &str,
    headers: &HashMap<String, String>,
    path: &str,
    deployment_timestamp: u64,
    timeout: Duration,
) -> InfraResult<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut backoff = Duration::from_millis(200);
    let mut last_error;

    loop {
        match probe(base_url, headers, path, deployment_timestamp).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                debug!(%base_url, path, error = %e, "job probe not passing yet");
                last_error = e;
            }
        }
        if tokio::time::Instant::now() + backoff >= deadline {
            return Err(InfraError::Verification(format!(
                "timed out waiting for {path} at {base_url}: {last_error}"
            )));
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn probe(
    base_url: &str,
    headers: &HashMap<String, String>,
    path: &str,
    deployment_timestamp: u64,
) -> InfraResult<()> {
    let url = format!("{}{path}", base_url.trim_end_matches('/'));
    let resp = http_get(&url, headers, PROBE_TIMEOUT).await?;
    if !resp.is_success() {
        return Err(InfraError::Verification(format!(
            "{path} returned status {}",
            resp.status
        )));
    }
    if deployment_timestamp > 0 {
        verify_deployment_timestamp(&resp.body, deployment_timestamp)?;
    }
    Ok(())
}

/// Compare the timestamp reported by the job server with the one of the
/// deployment being verified. A mismatch means the probe reached a
/// dying instance of a previous deployment.
fn verify_deployment_timestamp(body: &[u8], expected: u64) -> InfraResult<()> {
    let payload: serde_json::Value = serde_json::from_slice(body).map_err(|e| {
        InfraError::Verification(format!("liveness response is not valid JSON: {e}"))
    })?;
    let reported = payload
        .get("deployment_timestamp")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    if reported != expected {
        return Err(InfraError::Verification(format!(
            "the running instance reports deployment timestamp {reported}, expected {expected}; \
             an older instance may still be shutting down"
        )));
    }
    Ok(())
}
