//! Job type catalog.
//!
//! A job type is one installed language wrapper (for example
//! `python3:2.4.0`) that knows how to turn user code into a job image.
//! Providers contribute job types; manifests refer to them by
//! `lang:version`, where the version part accepts the same aliases as
//! job versions (`latest`, `2.x`).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

use racetrack_version::{SemanticVersion, SemanticVersionPattern};

use crate::error::{InfraError, InfraResult};
use crate::target::TargetProvider;

/// One installed language wrapper version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobType {
    /// Language name, the part before the colon (`python3`).
    pub lang_name: String,
    /// Wrapper version, the part after the colon (`2.4.0`).
    pub version: String,
    /// Base image the builder derives job images from.
    pub base_image: String,
    /// Dockerfile template used to assemble the job image.
    pub template_path: Option<String>,
}

impl JobType {
    /// Full name of this job type, `lang:version`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.lang_name, self.version)
    }
}

/// All installed job types, resolvable by name with version aliases.
#[derive(Clone, Default)]
pub struct JobTypeCatalog {
    job_types: Arc<RwLock<HashMap<String, JobType>>>,
}

impl JobTypeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the catalog from the given providers.
    pub fn rebuild(&self, providers: &[Arc<dyn TargetProvider>]) {
        let mut map = HashMap::new();
        for provider in providers {
            for job_type in provider.job_types() {
                map.insert(job_type.key(), job_type);
            }
        }
        info!(count = map.len(), "job types registered");
        *self.job_types.write().expect("job type catalog lock poisoned") = map;
    }

    /// All installed job type names (`lang:version`), sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .job_types
            .read()
            .expect("job type catalog lock poisoned")
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn contains(&self, key: &str) -> bool {
        self.job_types
            .read()
            .expect("job type catalog lock poisoned")
            .contains_key(key)
    }

    /// Resolve a `lang:version` reference to an installed job type.
    /// The version part may be exact, `latest`, or an `x`-wildcard.
    pub fn resolve(&self, name: &str) -> InfraResult<JobType> {
        let (lang, version) = name
            .split_once(':')
            .ok_or_else(|| InfraError::UnknownJobType(name.to_string()))?;

        let job_types = self.job_types.read().expect("job type catalog lock poisoned");
        if version == "latest" {
            let candidates: Vec<&JobType> =
                job_types.values().filter(|jt| jt.lang_name == lang).collect();
            SemanticVersion::find_latest_stable(candidates.into_iter(), |jt| jt.version.as_str())
                .map(|jt| (*jt).clone())
                .ok_or_else(|| InfraError::UnknownJobType(name.to_string()))
        } else if SemanticVersionPattern::is_x_pattern(version) {
            let pattern = SemanticVersionPattern::from_x_pattern(version)
                .map_err(|_| InfraError::UnknownJobType(name.to_string()))?;
            let candidates: Vec<&JobType> =
                job_types.values().filter(|jt| jt.lang_name == lang).collect();
            SemanticVersion::find_latest_matching(&pattern, candidates.into_iter(), |jt| {
                jt.version.as_str()
            })
            .map(|jt| (*jt).clone())
            .ok_or_else(|| InfraError::UnknownJobType(name.to_string()))
        } else {
            job_types
                .get(name)
                .cloned()
                .ok_or_else(|| InfraError::UnknownJobType(name.to_string()))
        }
    }
}
