//! Error types for the deployment pipeline.

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Concurrency guard: a deployment of the same job version is
    /// already running within the recency window.
    #[error("deployment of job {name} {version} is already ongoing")]
    AlreadyOngoing { name: String, version: String },

    /// Overwrite protection against the live Job table.
    #[error("job {name} {version} is already deployed, use force to overwrite it")]
    AlreadyDeployed { name: String, version: String },

    /// Overwrite protection against the TrashJob tombstones.
    #[error("job {name} {version} has been deleted before, use force to redeploy it")]
    PreviouslyDeleted { name: String, version: String },

    #[error("moving job {name} {version} to {target} makes no difference, it is already there")]
    MoveToSameTarget {
        name: String,
        version: String,
        target: String,
    },

    #[error("permission denied: {0}")]
    Denied(String),

    #[error("building the job image failed: {0}")]
    Build(String),

    /// Reprovisioning needs an image produced by an earlier build.
    #[error("job {name} {version} has no built image to provision from")]
    NoImage { name: String, version: String },

    #[error("job {name} {version} carries no manifest to redeploy from")]
    NoManifest { name: String, version: String },

    #[error("{0} was not found")]
    EntityNotFound(String),

    #[error("invalid version reference: {0}")]
    InvalidVersion(String),

    #[error(transparent)]
    Infra(#[from] racetrack_infra::InfraError),

    #[error(transparent)]
    State(#[from] racetrack_state::StateError),
}

impl From<racetrack_version::VersionError> for PipelineError {
    fn from(err: racetrack_version::VersionError) -> Self {
        match err {
            racetrack_version::VersionError::EntityNotFound(what) => Self::EntityNotFound(what),
            racetrack_version::VersionError::State(e) => Self::State(e),
            other => Self::InvalidVersion(other.to_string()),
        }
    }
}

impl PipelineError {
    /// Whether the error is the caller's mistake rather than an
    /// infrastructure fault. Conflicts and denials are terminal and
    /// never retried.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::AlreadyOngoing { .. }
                | Self::AlreadyDeployed { .. }
                | Self::PreviouslyDeleted { .. }
                | Self::MoveToSameTarget { .. }
        )
    }
}
