//! Deployment record operations.
//!
//! The Deployment row is the durable ledger of one build+provision
//! attempt. Creation is guarded against concurrent deployments of the
//! same job version; everything afterwards mutates the row as the
//! pipeline advances.

use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use racetrack_state::{
    now_secs, DeploymentRecord, DeploymentStatus, Manifest, StateStore,
};

use crate::error::{PipelineError, PipelineResult};

/// Recency window of the concurrency guard: an IN_PROGRESS deployment
/// of the same (name, version) updated within this window blocks a new
/// one. A deployment stalled longer than this can be superseded.
pub const GUARD_WINDOW_SECS: u64 = 60;

/// What a status poll returns to the caller.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeploymentView {
    pub id: String,
    pub status: DeploymentStatus,
    pub job_name: String,
    pub job_version: String,
    pub phase: Option<String>,
    pub error: Option<String>,
    pub warnings: Option<String>,
    pub image_name: Option<String>,
    pub create_time: u64,
    pub update_time: u64,
    pub deployed_by: String,
    pub infrastructure_target: String,
}

impl From<DeploymentRecord> for DeploymentView {
    fn from(record: DeploymentRecord) -> Self {
        Self {
            id: record.id,
            status: record.status,
            job_name: record.job_name,
            job_version: record.job_version,
            phase: record.phase,
            error: record.error,
            warnings: record.warnings,
            image_name: record.image_name,
            create_time: record.create_time,
            update_time: record.update_time,
            deployed_by: record.deployed_by,
            infrastructure_target: record.infrastructure_target,
        }
    }
}

/// Create the IN_PROGRESS row for a new deployment attempt.
///
/// Fails fast with `AlreadyOngoing` when another IN_PROGRESS deployment
/// of the same (name, version) was updated within the guard window.
pub fn create_deployment(
    store: &StateStore,
    manifest: &Manifest,
    infrastructure_target: &str,
    deployed_by: &str,
) -> PipelineResult<DeploymentRecord> {
    let now = now_secs();
    let cutoff = now.saturating_sub(GUARD_WINDOW_SECS);
    if store
        .find_ongoing_deployment(&manifest.name, &manifest.version, cutoff)?
        .is_some()
    {
        return Err(PipelineError::AlreadyOngoing {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
        });
    }

    let record = DeploymentRecord {
        id: Uuid::new_v4().to_string(),
        status: DeploymentStatus::InProgress,
        create_time: now,
        update_time: now,
        manifest: manifest.clone(),
        job_name: manifest.name.clone(),
        job_version: manifest.version.clone(),
        error: None,
        deployed_by: deployed_by.to_string(),
        build_logs: None,
        phase: None,
        image_name: None,
        infrastructure_target: infrastructure_target.to_string(),
        warnings: None,
    };
    store.put_deployment(&record)?;
    Ok(record)
}

/// Advance the progress label of an in-flight deployment.
pub fn save_phase(store: &StateStore, deployment_id: &str, phase: &str) -> PipelineResult<()> {
    mutate(store, deployment_id, |record| {
        record.phase = Some(phase.to_string());
    })
}

/// Advance the phase, swallowing errors. For callback contexts where a
/// failed progress write must not fail the deployment itself.
pub fn save_phase_best_effort(store: &StateStore, deployment_id: &str, phase: &str) {
    if let Err(e) = save_phase(store, deployment_id, phase) {
        warn!(%deployment_id, error = %e, "failed to persist deployment phase");
    }
}

pub fn save_build_logs(store: &StateStore, deployment_id: &str, logs: &str) -> PipelineResult<()> {
    mutate(store, deployment_id, |record| {
        record.build_logs = Some(logs.to_string());
    })
}

pub fn save_image_name(
    store: &StateStore,
    deployment_id: &str,
    image_name: &str,
) -> PipelineResult<()> {
    mutate(store, deployment_id, |record| {
        record.image_name = Some(image_name.to_string());
    })
}

/// Append a non-fatal warning, newline-separated.
pub fn add_warning(store: &StateStore, deployment_id: &str, warning: &str) -> PipelineResult<()> {
    mutate(store, deployment_id, |record| {
        record.warnings = Some(match record.warnings.take() {
            Some(existing) => format!("{existing}\n{warning}"),
            None => warning.to_string(),
        });
    })
}

/// Mark a deployment DONE, clearing phase and error.
pub fn mark_done(store: &StateStore, deployment_id: &str) -> PipelineResult<()> {
    mutate(store, deployment_id, |record| {
        record.status = DeploymentStatus::Done;
        record.phase = None;
        record.error = None;
    })
}

/// Mark a deployment FAILED with the failure reason.
pub fn mark_failed(store: &StateStore, deployment_id: &str, error: &str) -> PipelineResult<()> {
    mutate(store, deployment_id, |record| {
        record.status = DeploymentStatus::Failed;
        record.error = Some(error.to_string());
    })
}

/// Fetch the deployment a caller polls for.
pub fn check_deployment(store: &StateStore, deployment_id: &str) -> PipelineResult<DeploymentView> {
    let record = store
        .get_deployment(deployment_id)?
        .ok_or_else(|| PipelineError::EntityNotFound(format!("deployment {deployment_id}")))?;
    Ok(record.into())
}

/// Most recently updated deployments, newest first.
pub fn list_recent_deployments(
    store: &StateStore,
    limit: usize,
) -> PipelineResult<Vec<DeploymentView>> {
    Ok(store
        .list_recent_deployments(limit)?
        .into_iter()
        .map(DeploymentView::from)
        .collect())
}

fn mutate(
    store: &StateStore,
    deployment_id: &str,
    apply: impl FnOnce(&mut DeploymentRecord),
) -> PipelineResult<()> {
    let mut record = store
        .get_deployment(deployment_id)?
        .ok_or_else(|| PipelineError::EntityNotFound(format!("deployment {deployment_id}")))?;
    apply(&mut record);
    record.update_time = now_secs();
    store.put_deployment(&record)?;
    Ok(())
}
