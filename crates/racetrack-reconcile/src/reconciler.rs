//! Reconciliation of registry rows against live infrastructure state.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use racetrack_infra::{JobTypeCatalog, TargetRegistry};
use racetrack_state::{now_secs, JobRecord, JobStatus, StateResult, StateStore};

#[derive(Clone)]
pub struct Reconciler {
    store: StateStore,
    targets: TargetRegistry,
    job_types: JobTypeCatalog,
}

impl Reconciler {
    pub fn new(store: StateStore, targets: TargetRegistry, job_types: JobTypeCatalog) -> Self {
        Self {
            store,
            targets,
            job_types,
        }
    }

    /// One reconciliation pass. Per-backend discovery failures are
    /// logged and leave that backend's rows untouched this cycle;
    /// registry store failures abort the pass.
    pub async fn reconcile(&self) -> StateResult<()> {
        let mut live: HashMap<String, JobRecord> = HashMap::new();
        let mut unreachable_targets: HashSet<String> = HashSet::new();

        for target in self.targets.all() {
            match target.monitor.list_jobs().await {
                Ok(jobs) => {
                    debug!(target = %target.name, count = jobs.len(), "discovered jobs");
                    for job in jobs {
                        live.insert(job.table_key(), job);
                    }
                }
                Err(e) => {
                    // Stale rows beat guessing: this backend's jobs are
                    // left as they are until it answers again.
                    warn!(target = %target.name, error = %e, "job discovery failed, skipping this backend");
                    unreachable_targets.insert(target.name.clone());
                }
            }
        }

        let mut registry_keys: HashSet<String> = HashSet::new();
        for mut record in self.store.list_jobs()? {
            let key = record.table_key();
            registry_keys.insert(key.clone());

            // A deployment in flight is not lost, it just isn't up yet.
            if record.status == JobStatus::Starting {
                continue;
            }
            if unreachable_targets.contains(&record.infrastructure_target) {
                continue;
            }

            let mut changed = match live.get(&key) {
                Some(observed) => merge_observed(&mut record, observed),
                None => mark_lost(&mut record),
            };
            changed |= apply_job_type_notice(&mut record, &self.job_types);

            if changed {
                record.update_time = now_secs();
                self.store.put_job(&record)?;
                info!(
                    job_name = %record.name,
                    job_version = %record.version,
                    status = record.status.as_str(),
                    "job record reconciled"
                );
            }
        }

        for (key, observed) in &live {
            if !registry_keys.contains(key) {
                // Adopting unknown workloads is a hazard, not a feature.
                warn!(
                    job_name = %observed.name,
                    job_version = %observed.version,
                    target = %observed.infrastructure_target,
                    "orphaned workload observed, not registered in the registry"
                );
            }
        }
        Ok(())
    }

    /// Run reconciliation on a fixed interval until shutdown. Missed
    /// ticks are skipped, so passes never overlap.
    pub fn spawn(self, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.reconcile().await {
                            warn!(error = %e, "reconciliation pass failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("reconciler stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// Copy observable fields from the monitor's view into the registry
/// row. Returns whether anything actually differed. `last_call_time`
/// only ever advances, monitors may race each other.
fn merge_observed(record: &mut JobRecord, observed: &JobRecord) -> bool {
    let mut changed = false;
    if record.status != observed.status {
        record.status = observed.status;
        changed = true;
    }
    if record.error != observed.error {
        record.error = observed.error.clone();
        changed = true;
    }
    if record.infrastructure_target != observed.infrastructure_target {
        record.infrastructure_target = observed.infrastructure_target.clone();
        changed = true;
    }
    if record.internal_name != observed.internal_name {
        record.internal_name = observed.internal_name.clone();
        changed = true;
    }
    if record.replica_internal_names != observed.replica_internal_names {
        record.replica_internal_names = observed.replica_internal_names.clone();
        changed = true;
    }
    if let Some(observed_call) = observed.last_call_time {
        if record.last_call_time.is_none_or(|current| observed_call > current) {
            record.last_call_time = Some(observed_call);
            changed = true;
        }
    }
    changed
}

fn mark_lost(record: &mut JobRecord) -> bool {
    if record.status == JobStatus::Lost {
        return false;
    }
    record.status = JobStatus::Lost;
    record.error = Some(format!(
        "job was not found on target {}",
        record.infrastructure_target
    ));
    true
}

/// Flag jobs whose job type is no longer installed. Advisory only.
fn apply_job_type_notice(record: &mut JobRecord, job_types: &JobTypeCatalog) -> bool {
    let desired = if !record.job_type_version.is_empty()
        && job_types.resolve(&record.job_type_version).is_err()
    {
        Some(format!(
            "job type {} is no longer installed",
            record.job_type_version
        ))
    } else {
        None
    };
    if record.notice != desired {
        record.notice = desired;
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use racetrack_infra::testing::{stub_target_parts, StubMonitor, StubProvider};
    use racetrack_infra::{JobType, TargetProvider};
    use std::sync::Arc;

    struct Harness {
        reconciler: Reconciler,
        store: StateStore,
        docker_monitor: Arc<StubMonitor>,
        kubernetes_monitor: Arc<StubMonitor>,
    }

    fn harness() -> Harness {
        let store = StateStore::open_in_memory().unwrap();
        let (docker, _, docker_monitor) = stub_target_parts("docker");
        let (kubernetes, _, kubernetes_monitor) = stub_target_parts("kubernetes");
        let provider: Arc<dyn TargetProvider> =
            Arc::new(StubProvider::new(0, vec![docker, kubernetes]).with_job_types(vec![
                JobType {
                    lang_name: "python3".to_string(),
                    version: "2.4.0".to_string(),
                    base_image: "racetrack/python3-base:2.4.0".to_string(),
                    template_path: None,
                },
            ]));
        let providers = vec![provider];
        let targets = TargetRegistry::new();
        targets.rebuild(&providers);
        let job_types = JobTypeCatalog::new();
        job_types.rebuild(&providers);

        Harness {
            reconciler: Reconciler::new(store.clone(), targets, job_types),
            store,
            docker_monitor,
            kubernetes_monitor,
        }
    }

    fn record(name: &str, version: &str, status: JobStatus, target: &str) -> JobRecord {
        JobRecord {
            id: format!("{name}-{version}"),
            family: name.to_string(),
            name: name.to_string(),
            version: version.to_string(),
            status,
            create_time: 1000,
            update_time: 1000,
            manifest: None,
            internal_name: Some(format!("job-{name}:7000")),
            error: None,
            notice: None,
            image_tag: Some("1700000000".to_string()),
            deployed_by: "alice".to_string(),
            last_call_time: None,
            infrastructure_target: target.to_string(),
            replica_internal_names: Vec::new(),
            job_type_version: "python3:2.4.0".to_string(),
            infrastructure_stats: serde_json::Value::Null,
        }
    }

    /// The same job as the monitor would report it.
    fn observed(record: &JobRecord) -> JobRecord {
        let mut observed = record.clone();
        observed.id = String::new();
        observed.status = JobStatus::Running;
        observed
    }

    #[tokio::test]
    async fn vanished_job_becomes_lost_and_recovers() {
        let h = harness();
        let job = record("adder", "1.0.0", JobStatus::Running, "docker");
        h.store.put_job(&job).unwrap();

        // Not observed anywhere: LOST.
        h.reconciler.reconcile().await.unwrap();
        let after = h.store.get_job("adder", "1.0.0").unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Lost);
        assert!(after.error.unwrap().contains("docker"));

        // Observed again: back to RUNNING, error cleared.
        h.docker_monitor.set_jobs(vec![observed(&job)]);
        h.reconciler.reconcile().await.unwrap();
        let after = h.store.get_job("adder", "1.0.0").unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Running);
        assert!(after.error.is_none());
    }

    #[tokio::test]
    async fn reconcile_is_idempotent_without_changes() {
        let h = harness();
        let job = record("adder", "1.0.0", JobStatus::Running, "docker");
        h.store.put_job(&job).unwrap();
        h.docker_monitor.set_jobs(vec![observed(&job)]);

        h.reconciler.reconcile().await.unwrap();
        let first = h.store.get_job("adder", "1.0.0").unwrap().unwrap();
        // Nothing differed, so nothing was written.
        assert_eq!(first.update_time, 1000);

        h.reconciler.reconcile().await.unwrap();
        let second = h.store.get_job("adder", "1.0.0").unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn starting_jobs_are_not_marked_lost() {
        let h = harness();
        h.store
            .put_job(&record("adder", "1.0.0", JobStatus::Starting, "docker"))
            .unwrap();

        h.reconciler.reconcile().await.unwrap();
        let after = h.store.get_job("adder", "1.0.0").unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Starting);
    }

    #[tokio::test]
    async fn orphans_are_logged_not_adopted() {
        let h = harness();
        h.docker_monitor
            .set_jobs(vec![observed(&record("stray", "9.9.9", JobStatus::Running, "docker"))]);

        h.reconciler.reconcile().await.unwrap();
        assert!(h.store.get_job("stray", "9.9.9").unwrap().is_none());
        assert!(h.store.list_jobs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_backend_leaves_its_rows_untouched() {
        let h = harness();
        let docker_job = record("adder", "1.0.0", JobStatus::Running, "docker");
        let k8s_job = record("subber", "2.0.0", JobStatus::Running, "kubernetes");
        h.store.put_job(&docker_job).unwrap();
        h.store.put_job(&k8s_job).unwrap();
        h.docker_monitor.set_list_error(Some("daemon unreachable"));
        // kubernetes answers, but without the job.

        h.reconciler.reconcile().await.unwrap();
        let docker_after = h.store.get_job("adder", "1.0.0").unwrap().unwrap();
        assert_eq!(docker_after.status, JobStatus::Running);
        let k8s_after = h.store.get_job("subber", "2.0.0").unwrap().unwrap();
        assert_eq!(k8s_after.status, JobStatus::Lost);
    }

    #[tokio::test]
    async fn last_call_time_only_advances() {
        let h = harness();
        let mut job = record("adder", "1.0.0", JobStatus::Running, "docker");
        job.last_call_time = Some(2000);
        h.store.put_job(&job).unwrap();

        let mut seen = observed(&job);
        seen.last_call_time = Some(1000);
        h.docker_monitor.set_jobs(vec![seen.clone()]);
        h.reconciler.reconcile().await.unwrap();
        let after = h.store.get_job("adder", "1.0.0").unwrap().unwrap();
        assert_eq!(after.last_call_time, Some(2000));

        seen.last_call_time = Some(3000);
        h.docker_monitor.set_jobs(vec![seen]);
        h.reconciler.reconcile().await.unwrap();
        let after = h.store.get_job("adder", "1.0.0").unwrap().unwrap();
        assert_eq!(after.last_call_time, Some(3000));
    }

    #[tokio::test]
    async fn uninstalled_job_type_gets_a_notice() {
        let h = harness();
        let mut job = record("adder", "1.0.0", JobStatus::Running, "docker");
        job.job_type_version = "ruby:1.0.0".to_string();
        h.store.put_job(&job).unwrap();
        let mut seen = observed(&job);
        seen.job_type_version = job.job_type_version.clone();
        h.docker_monitor.set_jobs(vec![seen]);

        h.reconciler.reconcile().await.unwrap();
        let after = h.store.get_job("adder", "1.0.0").unwrap().unwrap();
        assert!(after.notice.unwrap().contains("ruby:1.0.0"));
    }

    #[tokio::test]
    async fn alias_job_types_resolve_against_the_catalog() {
        let h = harness();
        let mut job = record("adder", "1.0.0", JobStatus::Running, "docker");
        job.job_type_version = "python3:latest".to_string();
        h.store.put_job(&job).unwrap();
        h.docker_monitor.set_jobs(vec![observed(&job)]);

        h.reconciler.reconcile().await.unwrap();
        let after = h.store.get_job("adder", "1.0.0").unwrap().unwrap();
        assert!(after.notice.is_none());
    }
}
