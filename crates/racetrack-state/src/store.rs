//! StateStore — redb-backed registry store for Racetrack.
//!
//! Provides typed CRUD operations over job families, jobs, deployments
//! and trashed jobs. All values are JSON-serialized into redb's `&[u8]`
//! value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).
//!
//! Point lookups return `Option`; orchestration layers map absence to
//! their own "entity not found" errors.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe registry store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent registry store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "registry store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory registry store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory registry store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(JOB_FAMILIES).map_err(map_err!(Table))?;
        txn.open_table(JOBS).map_err(map_err!(Table))?;
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(TRASH_JOBS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Job families ───────────────────────────────────────────────

    /// Get a job family by name.
    pub fn get_family(&self, name: &str) -> StateResult<Option<JobFamilyRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOB_FAMILIES).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => {
                let family: JobFamilyRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(family))
            }
            None => Ok(None),
        }
    }

    /// List all job families, sorted by name.
    pub fn list_families(&self) -> StateResult<Vec<JobFamilyRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOB_FAMILIES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let family: JobFamilyRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(family);
        }
        Ok(results)
    }

    /// Insert the given family unless one with the same name exists.
    /// Returns the effective record (existing or newly created).
    pub fn create_family_if_absent(
        &self,
        candidate: &JobFamilyRecord,
    ) -> StateResult<JobFamilyRecord> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let effective;
        {
            let mut table = txn.open_table(JOB_FAMILIES).map_err(map_err!(Table))?;
            let existing = match table.get(candidate.name.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            match existing {
                Some(record) => {
                    effective = record;
                }
                None => {
                    let value = serde_json::to_vec(candidate).map_err(map_err!(Serialize))?;
                    table
                        .insert(candidate.name.as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                    effective = candidate.clone();
                    debug!(family = %candidate.name, "job family created");
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(effective)
    }

    /// Delete a family and all jobs belonging to it.
    /// Returns the number of jobs removed by the cascade, or `None` if
    /// the family didn't exist.
    pub fn delete_family_cascade(&self, name: &str) -> StateResult<Option<u32>> {
        let job_keys: Vec<String> = self
            .list_jobs_named(name)?
            .iter()
            .map(|job| job.table_key())
            .collect();

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut families = txn.open_table(JOB_FAMILIES).map_err(map_err!(Table))?;
            existed = families.remove(name).map_err(map_err!(Write))?.is_some();
            let mut jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
            for key in &job_keys {
                jobs.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if !existed {
            return Ok(None);
        }
        debug!(family = %name, jobs = job_keys.len(), "job family deleted with cascade");
        Ok(Some(job_keys.len() as u32))
    }

    // ── Jobs ───────────────────────────────────────────────────────

    /// Insert or update a job. `(name, version)` uniqueness holds by
    /// construction: the composite key is the identity.
    pub fn put_job(&self, job: &JobRecord) -> StateResult<()> {
        let key = job.table_key();
        let value = serde_json::to_vec(job).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "job stored");
        Ok(())
    }

    /// Insert a new job, failing with `AlreadyExists` if the
    /// `(name, version)` key is taken.
    pub fn create_job(&self, job: &JobRecord) -> StateResult<()> {
        let key = job.table_key();
        let value = serde_json::to_vec(job).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            if table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(key));
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a job by name and exact version.
    pub fn get_job(&self, name: &str, version: &str) -> StateResult<Option<JobRecord>> {
        let key = job_table_key(name, version);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let job: JobRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// List all jobs.
    pub fn list_jobs(&self) -> StateResult<Vec<JobRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let job: JobRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(job);
        }
        Ok(results)
    }

    /// List all versions of a named job (by key prefix scan).
    pub fn list_jobs_named(&self, name: &str) -> StateResult<Vec<JobRecord>> {
        let prefix = format!("{name}/");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let job: JobRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(job);
            }
        }
        Ok(results)
    }

    /// Delete a job by name and version. Returns true if it existed.
    pub fn delete_job(&self, name: &str, version: &str) -> StateResult<bool> {
        let key = job_table_key(name, version);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "job deleted");
        Ok(existed)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Insert or update a deployment record.
    pub fn put_deployment(&self, deployment: &DeploymentRecord) -> StateResult<()> {
        let value = serde_json::to_vec(deployment).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            table
                .insert(deployment.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a deployment by ID.
    pub fn get_deployment(&self, id: &str) -> StateResult<Option<DeploymentRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let deployment: DeploymentRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(deployment))
            }
            None => Ok(None),
        }
    }

    /// List the most recently updated deployments, newest first.
    pub fn list_recent_deployments(&self, limit: usize) -> StateResult<Vec<DeploymentRecord>> {
        let mut all = self.list_deployments()?;
        all.sort_by(|a, b| b.update_time.cmp(&a.update_time));
        all.truncate(limit);
        Ok(all)
    }

    /// List all deployments.
    pub fn list_deployments(&self) -> StateResult<Vec<DeploymentRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let deployment: DeploymentRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(deployment);
        }
        Ok(results)
    }

    /// Find an IN_PROGRESS deployment of the given job version updated
    /// at or after the cutoff timestamp. Used by the concurrency guard.
    pub fn find_ongoing_deployment(
        &self,
        job_name: &str,
        job_version: &str,
        updated_after: u64,
    ) -> StateResult<Option<DeploymentRecord>> {
        let found = self.list_deployments()?.into_iter().find(|d| {
            d.status == DeploymentStatus::InProgress
                && d.job_name == job_name
                && d.job_version == job_version
                && d.update_time >= updated_after
        });
        Ok(found)
    }

    // ── Trash jobs ─────────────────────────────────────────────────

    /// Insert a deleted-job tombstone.
    pub fn put_trash_job(&self, trash: &TrashJobRecord) -> StateResult<()> {
        let key = trash.table_key();
        let value = serde_json::to_vec(trash).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TRASH_JOBS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "trash job stored");
        Ok(())
    }

    /// Find a deleted-job tombstone by name and version.
    pub fn get_trash_job(&self, name: &str, version: &str) -> StateResult<Option<TrashJobRecord>> {
        let key = job_table_key(name, version);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TRASH_JOBS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let trash: TrashJobRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(trash))
            }
            None => Ok(None),
        }
    }

    /// List all deleted-job tombstones.
    pub fn list_trash_jobs(&self) -> StateResult<Vec<TrashJobRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TRASH_JOBS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let trash: TrashJobRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(trash);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_manifest(name: &str, version: &str) -> Manifest {
        Manifest {
            name: name.to_string(),
            version: version.to_string(),
            jobtype: "python3:latest".to_string(),
            git: GitSource {
                remote: "https://github.com/example/jobs".to_string(),
                branch: None,
                directory: None,
            },
            owner_email: "dev@example.com".to_string(),
            infrastructure_target: None,
            build_env: HashMap::new(),
            runtime_env: HashMap::new(),
            secret_runtime_env_file: None,
            public_endpoints: Vec::new(),
            replicas: 1,
        }
    }

    fn test_job(name: &str, version: &str) -> JobRecord {
        JobRecord {
            id: format!("{name}-{version}"),
            family: name.to_string(),
            name: name.to_string(),
            version: version.to_string(),
            status: JobStatus::Running,
            create_time: 1000,
            update_time: 1000,
            manifest: Some(test_manifest(name, version)),
            internal_name: Some(format!("job-{name}:7000")),
            error: None,
            notice: None,
            image_tag: Some("1000".to_string()),
            deployed_by: "alice".to_string(),
            last_call_time: None,
            infrastructure_target: "docker".to_string(),
            replica_internal_names: Vec::new(),
            job_type_version: "python3:2.4.0".to_string(),
            infrastructure_stats: serde_json::Value::Null,
        }
    }

    fn test_deployment(id: &str, name: &str, version: &str) -> DeploymentRecord {
        DeploymentRecord {
            id: id.to_string(),
            status: DeploymentStatus::InProgress,
            create_time: 1000,
            update_time: 1000,
            manifest: test_manifest(name, version),
            job_name: name.to_string(),
            job_version: version.to_string(),
            error: None,
            deployed_by: "alice".to_string(),
            build_logs: None,
            phase: None,
            image_name: None,
            infrastructure_target: "docker".to_string(),
            warnings: None,
        }
    }

    // ── Job CRUD ───────────────────────────────────────────────────

    #[test]
    fn job_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let job = test_job("adder", "0.0.1");

        store.put_job(&job).unwrap();
        let retrieved = store.get_job("adder", "0.0.1").unwrap();

        assert_eq!(retrieved, Some(job));
    }

    #[test]
    fn job_get_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_job("nope", "1.0.0").unwrap().is_none());
    }

    #[test]
    fn job_create_rejects_duplicate_name_version() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_job(&test_job("adder", "0.0.1")).unwrap();

        let err = store.create_job(&test_job("adder", "0.0.1")).unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists(_)));

        // A different version of the same name is fine.
        store.create_job(&test_job("adder", "0.0.2")).unwrap();
    }

    #[test]
    fn job_list_named_filters_by_prefix() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_job(&test_job("adder", "0.0.1")).unwrap();
        store.put_job(&test_job("adder", "0.0.2")).unwrap();
        store.put_job(&test_job("multiplier", "1.0.0")).unwrap();

        assert_eq!(store.list_jobs_named("adder").unwrap().len(), 2);
        assert_eq!(store.list_jobs_named("multiplier").unwrap().len(), 1);
        assert_eq!(store.list_jobs().unwrap().len(), 3);
    }

    #[test]
    fn job_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_job(&test_job("adder", "0.0.1")).unwrap();

        assert!(store.delete_job("adder", "0.0.1").unwrap());
        assert!(!store.delete_job("adder", "0.0.1").unwrap());
        assert!(store.get_job("adder", "0.0.1").unwrap().is_none());
    }

    // ── Family CRUD ────────────────────────────────────────────────

    #[test]
    fn family_create_if_absent_is_idempotent() {
        let store = StateStore::open_in_memory().unwrap();
        let first = store
            .create_family_if_absent(&JobFamilyRecord {
                id: "fam-1".to_string(),
                name: "adder".to_string(),
            })
            .unwrap();

        // Second create with a different candidate id returns the original.
        let second = store
            .create_family_if_absent(&JobFamilyRecord {
                id: "fam-2".to_string(),
                name: "adder".to_string(),
            })
            .unwrap();

        assert_eq!(first.id, "fam-1");
        assert_eq!(second.id, "fam-1");
        assert_eq!(store.list_families().unwrap().len(), 1);
    }

    #[test]
    fn family_delete_cascades_to_jobs() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .create_family_if_absent(&JobFamilyRecord {
                id: "fam-1".to_string(),
                name: "adder".to_string(),
            })
            .unwrap();
        store.put_job(&test_job("adder", "0.0.1")).unwrap();
        store.put_job(&test_job("adder", "0.0.2")).unwrap();
        store.put_job(&test_job("multiplier", "1.0.0")).unwrap();

        let removed = store.delete_family_cascade("adder").unwrap();
        assert_eq!(removed, Some(2));
        assert!(store.list_jobs_named("adder").unwrap().is_empty());
        // Other families untouched.
        assert_eq!(store.list_jobs_named("multiplier").unwrap().len(), 1);

        assert_eq!(store.delete_family_cascade("adder").unwrap(), None);
    }

    // ── Deployment CRUD ────────────────────────────────────────────

    #[test]
    fn deployment_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let deployment = test_deployment("d-1", "adder", "0.0.1");

        store.put_deployment(&deployment).unwrap();
        let retrieved = store.get_deployment("d-1").unwrap();

        assert_eq!(retrieved, Some(deployment));
    }

    #[test]
    fn deployment_recent_listing_is_sorted_and_limited() {
        let store = StateStore::open_in_memory().unwrap();
        for (id, update_time) in [("d-1", 1000u64), ("d-2", 3000), ("d-3", 2000)] {
            let mut deployment = test_deployment(id, "adder", "0.0.1");
            deployment.update_time = update_time;
            store.put_deployment(&deployment).unwrap();
        }

        let recent = store.list_recent_deployments(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, "d-2");
        assert_eq!(recent[1].id, "d-3");
    }

    #[test]
    fn ongoing_deployment_respects_window_and_status() {
        let store = StateStore::open_in_memory().unwrap();

        let mut stale = test_deployment("d-old", "adder", "0.0.1");
        stale.update_time = 500;
        store.put_deployment(&stale).unwrap();

        // Stale rows outside the window are not "ongoing".
        assert!(store
            .find_ongoing_deployment("adder", "0.0.1", 900)
            .unwrap()
            .is_none());

        let mut fresh = test_deployment("d-new", "adder", "0.0.1");
        fresh.update_time = 950;
        store.put_deployment(&fresh).unwrap();

        let found = store
            .find_ongoing_deployment("adder", "0.0.1", 900)
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "d-new");

        // Terminal rows are never "ongoing".
        fresh.status = DeploymentStatus::Failed;
        store.put_deployment(&fresh).unwrap();
        assert!(store
            .find_ongoing_deployment("adder", "0.0.1", 900)
            .unwrap()
            .is_none());

        // Other versions don't match.
        assert!(store
            .find_ongoing_deployment("adder", "0.0.2", 0)
            .unwrap()
            .is_none());
    }

    // ── Trash jobs ─────────────────────────────────────────────────

    #[test]
    fn trash_job_round_trip() {
        let store = StateStore::open_in_memory().unwrap();
        let job = test_job("adder", "0.0.1");
        let trash = TrashJobRecord {
            id: job.id.clone(),
            name: job.name.clone(),
            version: job.version.clone(),
            status: job.status,
            create_time: job.create_time,
            update_time: job.update_time,
            delete_time: 2000,
            manifest: job.manifest.clone(),
            internal_name: job.internal_name.clone(),
            error: None,
            image_tag: job.image_tag.clone(),
            deployed_by: job.deployed_by.clone(),
            last_call_time: None,
            infrastructure_target: job.infrastructure_target.clone(),
            age_days: 0.5,
        };

        store.put_trash_job(&trash).unwrap();
        assert_eq!(store.get_trash_job("adder", "0.0.1").unwrap(), Some(trash));
        assert!(store.get_trash_job("adder", "9.9.9").unwrap().is_none());
        assert_eq!(store.list_trash_jobs().unwrap().len(), 1);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("registry.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_job(&test_job("adder", "0.0.1")).unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        let job = store.get_job("adder", "0.0.1").unwrap();
        assert!(job.is_some());
        assert_eq!(job.unwrap().name, "adder");
    }

    // ── Edge cases ─────────────────────────────────────────────────

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_jobs().unwrap().is_empty());
        assert!(store.list_families().unwrap().is_empty());
        assert!(store.list_deployments().unwrap().is_empty());
        assert!(store.list_trash_jobs().unwrap().is_empty());
        assert!(!store.delete_job("nope", "1.0.0").unwrap());
        assert_eq!(store.delete_family_cascade("nope").unwrap(), None);
    }
}
