//! Error types for version parsing and resolution.

use thiserror::Error;

/// Result type alias for version resolution.
pub type VersionResult<T> = Result<T, VersionError>;

/// Errors that can occur while parsing or resolving versions.
#[derive(Debug, Error)]
pub enum VersionError {
    #[error("version '{0}' doesn't match SemVer format 'X.Y.Z[-label]'")]
    InvalidVersion(String),

    #[error("version pattern '{0}' is invalid, should be like '1.x' or '1.2.x'")]
    InvalidPattern(String),

    #[error("{0}")]
    EntityNotFound(String),

    #[error(transparent)]
    State(#[from] racetrack_state::StateError),
}
