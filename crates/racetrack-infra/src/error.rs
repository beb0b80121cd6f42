//! Error types for the infrastructure layer.

use thiserror::Error;

/// Result type alias for infrastructure operations.
pub type InfraResult<T> = Result<T, InfraError>;

/// Errors that can occur while talking to infrastructure backends.
#[derive(Debug, Error)]
pub enum InfraError {
    /// The backend has no secret store. Callers treat this as
    /// "no secrets to manage", not as a fatal error.
    #[error("managing secrets is not supported on {target}")]
    SecretsUnsupported { target: String },

    #[error("selected infrastructure target \"{0}\" is unavailable")]
    UnknownTarget(String),

    #[error("no infrastructure targets available, install an appropriate plugin")]
    NoTargets,

    #[error("multiple infrastructure targets available: {0}, please pick one")]
    AmbiguousTarget(String),

    #[error("job type {0} is not supported, no such job type is installed")]
    UnknownJobType(String),

    #[error("command failed: {cmd}: {output}")]
    Command { cmd: String, output: String },

    #[error("http request failed: {0}")]
    Http(String),

    #[error("job verification failed: {0}")]
    Verification(String),

    #[error("{0}")]
    Backend(String),

    #[error(transparent)]
    Version(#[from] racetrack_version::VersionError),

    #[error(transparent)]
    State(#[from] racetrack_state::StateError),
}
