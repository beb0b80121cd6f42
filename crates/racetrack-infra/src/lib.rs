//! racetrack-infra — pluggable infrastructure backends.
//!
//! Defines the capability traits every backend implements
//! (`JobDeployer`, `JobMonitor`, `LogsStreamer`), the registry mapping
//! target names to capabilities, the job type catalog, and the three
//! built-in backends: Docker, Kubernetes and remote gateway.

pub mod command;
pub mod docker;
pub mod error;
pub mod health;
pub mod http;
pub mod job_type;
pub mod kubernetes;
pub mod remote;
pub mod target;
pub mod testing;
pub mod traits;

pub use error::{InfraError, InfraResult};
pub use health::HealthTimeouts;
pub use job_type::{JobType, JobTypeCatalog};
pub use target::{InfrastructureTarget, TargetProvider, TargetRegistry};
pub use traits::{
    AliveHandler, Credentials, JobDeployer, JobMonitor, JobSecrets, LineHandler, LogsStreamer,
    ProvisionRequest,
};
