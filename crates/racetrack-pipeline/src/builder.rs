//! Image Builder collaborator.
//!
//! The pipeline never builds images itself; it hands the manifest to a
//! builder service and receives back an image name plus the build logs.
//! Build failures come back as data, not as transport errors.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use racetrack_infra::http::{http_get, http_post_json};
use racetrack_infra::Credentials;
use racetrack_state::Manifest;

use crate::error::{PipelineError, PipelineResult};

/// Everything the builder needs to produce one job image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub manifest: Manifest,
    pub git_credentials: Option<Credentials>,
    #[serde(default)]
    pub secret_build_env: HashMap<String, String>,
    /// Image tag, derived from the deployment timestamp.
    pub tag: String,
    /// Optional pre-fetched source archive reference.
    pub build_context: Option<String>,
    /// Builds are idempotent per deployment id.
    pub deployment_id: String,
}

/// Outcome of one build. A non-null `error` means the build failed,
/// regardless of how cleanly the builder responded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildResult {
    pub image_name: Option<String>,
    #[serde(default)]
    pub logs: String,
    pub error: Option<String>,
}

#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build the job image. Transport failures are `Err`; builds that
    /// ran and failed return `Ok` with `error` set.
    async fn build(&self, request: &BuildRequest) -> PipelineResult<BuildResult>;

    /// Block until the builder is accepting work. Builders without a
    /// warm-up phase may keep the default no-op.
    async fn wait_until_ready(&self) -> PipelineResult<()> {
        Ok(())
    }
}

const BUILD_TIMEOUT: Duration = Duration::from_secs(1800);
const READY_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const READY_WAIT: Duration = Duration::from_secs(120);

/// Builder reached over HTTP, the way a separate image-builder service
/// is deployed next to the control plane.
pub struct RemoteImageBuilder {
    base_url: String,
}

impl RemoteImageBuilder {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ImageBuilder for RemoteImageBuilder {
    async fn build(&self, request: &BuildRequest) -> PipelineResult<BuildResult> {
        let body = serde_json::to_value(request)
            .map_err(|e| PipelineError::Build(format!("encoding build request: {e}")))?;
        let url = format!("{}/api/v1/build", self.base_url);
        let resp = http_post_json(&url, &body, &HashMap::new(), BUILD_TIMEOUT)
            .await
            .map_err(|e| PipelineError::Build(e.to_string()))?;
        if !(200..300).contains(&resp.status) {
            return Err(PipelineError::Build(format!(
                "builder returned status {}: {}",
                resp.status,
                resp.text()
            )));
        }
        resp.json()
            .map_err(|e| PipelineError::Build(format!("invalid builder response: {e}")))
    }

    async fn wait_until_ready(&self) -> PipelineResult<()> {
        let url = format!("{}/health", self.base_url);
        let deadline = tokio::time::Instant::now() + READY_WAIT;
        loop {
            match http_get(&url, &HashMap::new(), READY_PROBE_TIMEOUT).await {
                Ok(resp) if resp.is_success() => return Ok(()),
                _ if tokio::time::Instant::now() >= deadline => {
                    return Err(PipelineError::Build(
                        "image builder did not become ready in time".to_string(),
                    ));
                }
                _ => tokio::time::sleep(Duration::from_secs(2)).await,
            }
        }
    }
}
