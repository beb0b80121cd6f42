//! redb table definitions for the Racetrack registry store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Composite keys follow the pattern `{name}/{version}`.

use redb::TableDefinition;

/// Job families keyed by `{name}`.
pub const JOB_FAMILIES: TableDefinition<&str, &[u8]> = TableDefinition::new("job_families");

/// Deployed jobs keyed by `{name}/{version}`.
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Deployment attempts keyed by `{deployment_id}`.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Deleted job tombstones keyed by `{name}/{version}`.
pub const TRASH_JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("trash_jobs");
