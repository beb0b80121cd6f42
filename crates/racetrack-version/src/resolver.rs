//! Job version resolution.
//!
//! Maps a job family name plus a possibly-aliased version string to one
//! concrete job record: an exact version, `latest`, or an `x`-wildcard
//! pattern like `1.2.x`.

use racetrack_state::{JobRecord, JobStatus, StateStore};

use crate::error::{VersionError, VersionResult};
use crate::semver::{SemanticVersion, SemanticVersionPattern};

/// Statuses of jobs that are known to exist in a cluster (as opposed to
/// pure build artifacts that never ran). Version aliases resolve only
/// among these.
const KNOWN_TO_EXIST: [JobStatus; 3] = [JobStatus::Running, JobStatus::Error, JobStatus::Lost];

/// Find a job by name and version, accepting version aliases.
///
/// - an exact version string is looked up directly;
/// - `latest` picks the highest stable version among existing jobs;
/// - an `x`-wildcard pattern (`1.2.x`, `2.x`) picks the highest stable
///   version matching the pattern.
pub fn resolve_job(store: &StateStore, name: &str, version: &str) -> VersionResult<JobRecord> {
    if version == "latest" {
        read_latest_job(store, name)
    } else if SemanticVersionPattern::is_x_pattern(version) {
        read_latest_wildcard_job(store, name, version)
    } else {
        read_job(store, name, version)
    }
}

/// Look up a job by exact name and version.
pub fn read_job(store: &StateStore, name: &str, version: &str) -> VersionResult<JobRecord> {
    store.get_job(name, version)?.ok_or_else(|| {
        VersionError::EntityNotFound(format!(
            "job with name {name} and version {version} was not found"
        ))
    })
}

fn read_latest_job(store: &StateStore, name: &str) -> VersionResult<JobRecord> {
    let jobs = existing_jobs(store, name)?;
    SemanticVersion::find_latest_stable(jobs.iter(), |job| job.version.as_str())
        .cloned()
        .ok_or_else(|| VersionError::EntityNotFound(format!("no stable version of job {name}")))
}

fn read_latest_wildcard_job(
    store: &StateStore,
    name: &str,
    wildcard: &str,
) -> VersionResult<JobRecord> {
    let pattern = SemanticVersionPattern::from_x_pattern(wildcard)?;
    let jobs = existing_jobs(store, name)?;
    SemanticVersion::find_latest_matching(&pattern, jobs.iter(), |job| job.version.as_str())
        .cloned()
        .ok_or_else(|| {
            VersionError::EntityNotFound(format!(
                "no stable version of job {name} matching pattern {wildcard}"
            ))
        })
}

fn existing_jobs(store: &StateStore, name: &str) -> VersionResult<Vec<JobRecord>> {
    let jobs: Vec<JobRecord> = store
        .list_jobs_named(name)?
        .into_iter()
        .filter(|job| KNOWN_TO_EXIST.contains(&job.status))
        .collect();
    if jobs.is_empty() {
        return Err(VersionError::EntityNotFound(format!("no job named {name}")));
    }
    Ok(jobs)
}
