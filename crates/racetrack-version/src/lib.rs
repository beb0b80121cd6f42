//! racetrack-version — semantic versioning for Racetrack jobs.
//!
//! Provides the `SemanticVersion` ordering used across the control
//! plane (unlabeled versions rank above labeled ones at an equal
//! numeric triple), `x`-wildcard patterns, and resolution of version
//! aliases (`latest`, `1.2.x`) against the job registry.

pub mod error;
pub mod resolver;
pub mod semver;

pub use error::{VersionError, VersionResult};
pub use resolver::{read_job, resolve_job};
pub use semver::{SemanticVersion, SemanticVersionPattern};
