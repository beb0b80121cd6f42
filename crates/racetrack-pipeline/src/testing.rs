//! Shared helpers for this crate's tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use racetrack_state::{GitSource, Manifest};

use crate::builder::{BuildRequest, BuildResult, ImageBuilder};
use crate::error::PipelineResult;

pub(crate) fn manifest(name: &str, version: &str) -> Manifest {
    Manifest {
        name: name.to_string(),
        version: version.to_string(),
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
        replicas: 1,
    }
}

/// Builder double: records requests, optionally blocks on a gate, and
/// can report a failed build as data.
#[derive(Default)]
pub(crate) struct TestBuilder {
    pub builds: Mutex<Vec<BuildRequest>>,
    /// When set, the build reports this error (error-as-data).
    pub fail_with: Mutex<Option<String>>,
    /// When set, the build waits for one notification before finishing.
    pub gate: Mutex<Option<Arc<Notify>>>,
}

impl TestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build_count(&self) -> usize {
        self.builds.lock().unwrap().len()
    }

    pub fn set_failure(&self, error: &str) {
        *self.fail_with.lock().unwrap() = Some(error.to_string());
    }

    /// Make subsequent builds block until the returned gate is notified.
    pub fn gated(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl ImageBuilder for TestBuilder {
    async fn build(&self, request: &BuildRequest) -> PipelineResult<BuildResult> {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.builds.lock().unwrap().push(request.clone());
        let error = self.fail_with.lock().unwrap().clone();
        Ok(BuildResult {
            image_name: if error.is_none() {
                Some(format!(
                    "registry.example.com/racetrack/job-entrypoint/{}:{}",
                    request.manifest.name, request.tag
                ))
            } else {
                None
            },
            logs: "build finished".to_string(),
            error,
        })
    }
}
