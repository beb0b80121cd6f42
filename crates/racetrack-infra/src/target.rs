//! Infrastructure target registry.
//!
//! A target is one place jobs can be deployed to (a Docker daemon, a
//! Kubernetes namespace, a remote gateway). Providers contribute
//! targets; the registry aggregates them and resolves which target a
//! manifest should land on.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use racetrack_state::Manifest;

use crate::error::{InfraError, InfraResult};
use crate::job_type::JobType;
use crate::traits::{JobDeployer, JobMonitor, LogsStreamer};

/// One deployable location with its three capabilities.
#[derive(Clone)]
pub struct InfrastructureTarget {
    pub name: String,
    pub deployer: Arc<dyn JobDeployer>,
    pub monitor: Arc<dyn JobMonitor>,
    pub logs_streamer: Arc<dyn LogsStreamer>,
}

impl std::fmt::Debug for InfrastructureTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfrastructureTarget")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Contributes infrastructure targets and job types to the registry.
/// Built-in backends and plugins both implement this.
pub trait TargetProvider: Send + Sync {
    /// Providers with higher priority override same-named targets from
    /// lower-priority ones.
    fn priority(&self) -> i32 {
        0
    }

    /// Targets this provider makes available.
    fn infrastructure_targets(&self) -> Vec<InfrastructureTarget>;

    /// Job types this provider can build, if any.
    fn job_types(&self) -> Vec<JobType> {
        Vec::new()
    }
}

/// Aggregated view over every registered target. Cheap to clone and
/// safe to share across request handlers and the reconciler.
#[derive(Clone, Default)]
pub struct TargetRegistry {
    targets: Arc<RwLock<HashMap<String, InfrastructureTarget>>>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the registry from scratch out of the given providers.
    /// On a name collision the higher-priority provider wins; at equal
    /// priority the later registrant wins.
    pub fn rebuild(&self, providers: &[Arc<dyn TargetProvider>]) {
        let mut ordered: Vec<&Arc<dyn TargetProvider>> = providers.iter().collect();
        ordered.sort_by_key(|p| p.priority());

        let mut map = HashMap::new();
        for provider in ordered {
            for target in provider.infrastructure_targets() {
                debug!(target = %target.name, "registering infrastructure target");
                map.insert(target.name.clone(), target);
            }
        }
        info!(count = map.len(), "infrastructure targets registered");
        *self.targets.write().expect("target registry lock poisoned") = map;
    }

    pub fn get(&self, name: &str) -> InfraResult<InfrastructureTarget> {
        self.targets
            .read()
            .expect("target registry lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| InfraError::UnknownTarget(name.to_string()))
    }

    /// All registered target names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .targets
            .read()
            .expect("target registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn all(&self) -> Vec<InfrastructureTarget> {
        self.targets
            .read()
            .expect("target registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Decide which target a manifest deploys to: the manifest's
    /// explicit choice, then the configured default, then the sole
    /// registered target. Anything else is an error the submitter has
    /// to resolve.
    pub fn resolve_target_name(
        &self,
        manifest: &Manifest,
        default_target: Option<&str>,
    ) -> InfraResult<String> {
        if let Some(explicit) = &manifest.infrastructure_target {
            // Validate eagerly so a typo fails the deployment up front.
            self.get(explicit)?;
            return Ok(explicit.clone());
        }
        if let Some(default) = default_target {
            self.get(default)?;
            return Ok(default.to_string());
        }
        let names = self.names();
        match names.len() {
            0 => Err(InfraError::NoTargets),
            1 => Ok(names.into_iter().next().expect("one element")),
            _ => Err(InfraError::AmbiguousTarget(names.join(", "))),
        }
    }
}
