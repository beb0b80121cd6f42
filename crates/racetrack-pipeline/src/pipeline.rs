//! The deployment pipeline.
//!
//! Orchestrates build, provision, verify and post-deploy for one job
//! version. Every entry point performs its synchronous validation,
//! creates the guarded Deployment row and spawns the pipeline body onto
//! a background task, returning the deployment id for polling.

use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use racetrack_infra::traits::ProvisionRequest;
use racetrack_infra::{
    AliveHandler, InfraError, JobSecrets, JobTypeCatalog, TargetRegistry,
};
use racetrack_state::{
    now_secs, JobFamilyRecord, JobRecord, JobStatus, Manifest, StateStore, TrashJobRecord,
};
use racetrack_version::resolve_job;

use crate::audit::{AuditEvent, AuditLog};
use crate::auth::{AuthOracle, AuthResource, AuthScope};
use crate::builder::{BuildRequest, ImageBuilder};
use crate::deployment::{
    add_warning, create_deployment, mark_done, mark_failed, save_build_logs, save_image_name,
    save_phase, save_phase_best_effort,
};
use crate::endpoints::PublicEndpointRegistrar;
use crate::error::{PipelineError, PipelineResult};

pub const PHASE_BUILDING: &str = "fetching the source code";
pub const PHASE_PROVISIONING: &str = "creating cluster resources";
pub const PHASE_STARTING: &str = "starting Job server";
pub const PHASE_INITIALIZING: &str = "initializing Job entrypoint";
pub const PHASE_POST_DEPLOY: &str = "post-deploy hooks";

/// Service-wide pipeline settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Target used when a manifest names none and several are registered.
    pub default_target: Option<String>,
    /// Registry job images are pushed to, e.g. `registry.example.com`.
    pub docker_registry: String,
    /// Registry namespace, e.g. `racetrack`.
    pub registry_namespace: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_target: None,
            docker_registry: "localhost:5000".to_string(),
            registry_namespace: "racetrack".to_string(),
        }
    }
}

/// Which operation a background run performs; decides the build phase,
/// the secrets source and the audit event.
enum PlanKind {
    Deploy,
    Redeploy,
    Reprovision,
    Move { from_target: String },
}

enum SecretsSource {
    /// Submitted with the deploy call; persisted to the backend store.
    Provided(JobSecrets),
    /// Re-derived from the backend store of the deployment's target.
    Stored,
}

/// Everything a spawned pipeline body needs; built synchronously while
/// the caller still waits, executed after the id is returned.
struct DeploymentPlan {
    deployment_id: String,
    manifest: Manifest,
    target_name: String,
    requester: String,
    kind: PlanKind,
    secrets: SecretsSource,
    /// Skip the build phase and provision this image directly.
    prebuilt_image: Option<String>,
    build_context: Option<String>,
}

#[derive(Clone)]
pub struct DeploymentPipeline {
    store: StateStore,
    targets: TargetRegistry,
    job_types: JobTypeCatalog,
    builder: Arc<dyn ImageBuilder>,
    auth: Arc<dyn AuthOracle>,
    endpoints: Arc<dyn PublicEndpointRegistrar>,
    audit: Arc<dyn AuditLog>,
    config: PipelineConfig,
}

impl DeploymentPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: StateStore,
        targets: TargetRegistry,
        job_types: JobTypeCatalog,
        builder: Arc<dyn ImageBuilder>,
        auth: Arc<dyn AuthOracle>,
        endpoints: Arc<dyn PublicEndpointRegistrar>,
        audit: Arc<dyn AuditLog>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            targets,
            job_types,
            builder,
            auth,
            endpoints,
            audit,
            config,
        }
    }

    /// Deploy a brand-new job version from a submitted manifest.
    pub async fn deploy_new(
        &self,
        manifest: Manifest,
        secrets: JobSecrets,
        build_context: Option<String>,
        force: bool,
        requester: &str,
    ) -> PipelineResult<String> {
        self.auth
            .authorize(requester, AuthResource::Family(&manifest.name), AuthScope::DeployNew)
            .await?;
        // Fail on an unknown job type before any row exists.
        self.job_types.resolve(&manifest.jobtype)?;
        if !force {
            self.protect_overwriting(&manifest)?;
        }
        let target_name = self
            .targets
            .resolve_target_name(&manifest, self.config.default_target.as_deref())?;

        let deployment = create_deployment(&self.store, &manifest, &target_name, requester)?;
        info!(
            deployment_id = %deployment.id,
            job_name = %manifest.name,
            job_version = %manifest.version,
            %target_name,
            "deployment accepted"
        );
        self.spawn(DeploymentPlan {
            deployment_id: deployment.id.clone(),
            manifest,
            target_name,
            requester: requester.to_string(),
            kind: PlanKind::Deploy,
            secrets: SecretsSource::Provided(secrets),
            prebuilt_image: None,
            build_context,
        });
        Ok(deployment.id)
    }

    /// Rebuild and redeploy an existing job version from its stored manifest.
    pub async fn redeploy(
        &self,
        name: &str,
        version: &str,
        requester: &str,
    ) -> PipelineResult<String> {
        let job = resolve_job(&self.store, name, version)?;
        self.auth
            .authorize(requester, AuthResource::Job(&job.name, &job.version), AuthScope::Redeploy)
            .await?;
        let manifest = stored_manifest(&job)?;
        self.targets.get(&job.infrastructure_target)?;

        let deployment =
            create_deployment(&self.store, &manifest, &job.infrastructure_target, requester)?;
        self.spawn(DeploymentPlan {
            deployment_id: deployment.id.clone(),
            manifest,
            target_name: job.infrastructure_target,
            requester: requester.to_string(),
            kind: PlanKind::Redeploy,
            secrets: SecretsSource::Stored,
            prebuilt_image: None,
            build_context: None,
        });
        Ok(deployment.id)
    }

    /// Re-provision the already-built image of an existing job version,
    /// skipping the build phase.
    pub async fn reprovision(
        &self,
        name: &str,
        version: &str,
        requester: &str,
    ) -> PipelineResult<String> {
        let job = resolve_job(&self.store, name, version)?;
        self.auth
            .authorize(requester, AuthResource::Job(&job.name, &job.version), AuthScope::Redeploy)
            .await?;
        let manifest = stored_manifest(&job)?;
        let image = self.built_image(&job)?;
        self.targets.get(&job.infrastructure_target)?;

        let deployment =
            create_deployment(&self.store, &manifest, &job.infrastructure_target, requester)?;
        self.spawn(DeploymentPlan {
            deployment_id: deployment.id.clone(),
            manifest,
            target_name: job.infrastructure_target,
            requester: requester.to_string(),
            kind: PlanKind::Reprovision,
            secrets: SecretsSource::Stored,
            prebuilt_image: Some(image),
            build_context: None,
        });
        Ok(deployment.id)
    }

    /// Move a job to another infrastructure target: provision there
    /// first, decommission the old workload only after success.
    pub async fn move_job(
        &self,
        name: &str,
        version: &str,
        new_target: &str,
        requester: &str,
    ) -> PipelineResult<String> {
        let job = resolve_job(&self.store, name, version)?;
        self.auth
            .authorize(requester, AuthResource::Job(&job.name, &job.version), AuthScope::Redeploy)
            .await?;
        if job.infrastructure_target == new_target {
            return Err(PipelineError::MoveToSameTarget {
                name: job.name,
                version: job.version,
                target: new_target.to_string(),
            });
        }
        self.targets.get(new_target)?;
        let manifest = stored_manifest(&job)?;
        let image = self.built_image(&job)?;

        let deployment = create_deployment(&self.store, &manifest, new_target, requester)?;
        self.spawn(DeploymentPlan {
            deployment_id: deployment.id.clone(),
            manifest,
            target_name: new_target.to_string(),
            requester: requester.to_string(),
            kind: PlanKind::Move {
                from_target: job.infrastructure_target,
            },
            secrets: SecretsSource::Stored,
            prebuilt_image: Some(image),
            build_context: None,
        });
        Ok(deployment.id)
    }

    /// Delete a job: remove the workload, write the tombstone, drop the
    /// registry row. Synchronous, no Deployment record involved.
    pub async fn delete_job(
        &self,
        name: &str,
        version: &str,
        requester: &str,
    ) -> PipelineResult<()> {
        let job = resolve_job(&self.store, name, version)?;
        self.auth
            .authorize(requester, AuthResource::Job(&job.name, &job.version), AuthScope::Delete)
            .await?;

        match self.targets.get(&job.infrastructure_target) {
            Ok(target) => target.deployer.delete_job(&job.name, &job.version).await?,
            Err(e) => {
                // The registry row still has to go, a vanished plugin
                // must not make a job undeletable.
                warn!(
                    job_name = %job.name,
                    target = %job.infrastructure_target,
                    error = %e,
                    "target of deleted job is not registered, skipping workload removal"
                );
            }
        }

        let now = now_secs();
        self.store.put_trash_job(&TrashJobRecord {
            id: Uuid::new_v4().to_string(),
            name: job.name.clone(),
            version: job.version.clone(),
            status: job.status,
            create_time: job.create_time,
            update_time: now,
            delete_time: now,
            manifest: job.manifest.clone(),
            internal_name: job.internal_name.clone(),
            error: job.error.clone(),
            image_tag: job.image_tag.clone(),
            deployed_by: job.deployed_by.clone(),
            last_call_time: job.last_call_time,
            infrastructure_target: job.infrastructure_target.clone(),
            age_days: now.saturating_sub(job.create_time) as f64 / 86400.0,
        })?;
        self.store.delete_job(&job.name, &job.version)?;
        self.audit.record(AuditEvent::JobDeleted {
            username: requester.to_string(),
            job_name: job.name.clone(),
            job_version: job.version.clone(),
        });
        info!(job_name = %job.name, job_version = %job.version, "job deleted");
        Ok(())
    }

    // ── background execution ──────────────────────────────────────

    fn spawn(&self, plan: DeploymentPlan) {
        let pipeline = self.clone();
        tokio::spawn(async move {
            let deployment_id = plan.deployment_id.clone();
            match pipeline.execute(plan).await {
                Ok(()) => {
                    if let Err(e) = mark_done(&pipeline.store, &deployment_id) {
                        error!(%deployment_id, error = %e, "failed to mark deployment done");
                    }
                }
                Err(e) => {
                    warn!(%deployment_id, error = %e, "deployment failed");
                    if let Err(persist) = mark_failed(&pipeline.store, &deployment_id, &e.to_string())
                    {
                        error!(%deployment_id, error = %persist, "failed to record deployment failure");
                    }
                }
            }
        });
    }

    async fn execute(&self, plan: DeploymentPlan) -> PipelineResult<()> {
        let deployment_id = &plan.deployment_id;
        let manifest = &plan.manifest;
        let target = self.targets.get(&plan.target_name)?;

        let secrets = self.prepare_secrets(&plan, &target).await?;
        let deployment_timestamp = now_secs();

        let image_name = match &plan.prebuilt_image {
            Some(image) => image.clone(),
            None => {
                save_phase(&self.store, deployment_id, PHASE_BUILDING)?;
                self.builder.wait_until_ready().await?;
                let result = self
                    .builder
                    .build(&BuildRequest {
                        manifest: manifest.clone(),
                        git_credentials: secrets.git_credentials.clone(),
                        secret_build_env: secrets.secret_build_env.clone(),
                        tag: deployment_timestamp.to_string(),
                        build_context: plan.build_context.clone(),
                        deployment_id: deployment_id.clone(),
                    })
                    .await?;
                save_build_logs(&self.store, deployment_id, &result.logs)?;
                if let Some(build_error) = result.error {
                    return Err(PipelineError::Build(build_error));
                }
                result.image_name.ok_or_else(|| {
                    PipelineError::Build("builder returned no image name".to_string())
                })?
            }
        };
        save_image_name(&self.store, deployment_id, &image_name)?;

        save_phase(&self.store, deployment_id, PHASE_PROVISIONING)?;
        let family = self.store.create_family_if_absent(&JobFamilyRecord {
            id: Uuid::new_v4().to_string(),
            name: manifest.name.clone(),
        })?;
        let provisional = target
            .deployer
            .deploy_job(&ProvisionRequest {
                manifest: manifest.clone(),
                image_name,
                deployment_timestamp,
                runtime_env: manifest.runtime_env.clone(),
                secret_runtime_env: secrets.secret_runtime_env.clone(),
                family,
            })
            .await?;

        save_phase(&self.store, deployment_id, PHASE_STARTING)?;
        let on_alive: AliveHandler = {
            let store = self.store.clone();
            let id = deployment_id.clone();
            Arc::new(move || save_phase_best_effort(&store, &id, PHASE_INITIALIZING))
        };
        target
            .monitor
            .check_job_condition(&provisional, deployment_timestamp, Some(on_alive), true)
            .await?;

        // The verified workload becomes the registry row. Upsert keeps
        // the identity of a previously deployed (name, version).
        let siblings = self.store.list_jobs_named(&manifest.name)?;
        let family_existed = !siblings.is_empty();
        let existing = self.store.get_job(&manifest.name, &manifest.version)?;
        let now = now_secs();
        let job = JobRecord {
            id: existing
                .as_ref()
                .map(|e| e.id.clone())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            family: manifest.name.clone(),
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            status: JobStatus::Running,
            create_time: existing.as_ref().map(|e| e.create_time).unwrap_or(now),
            update_time: now,
            manifest: Some(manifest.clone()),
            internal_name: provisional.internal_name.clone(),
            error: None,
            notice: None,
            image_tag: Some(deployment_timestamp.to_string()),
            deployed_by: plan.requester.clone(),
            last_call_time: existing.as_ref().and_then(|e| e.last_call_time),
            infrastructure_target: plan.target_name.clone(),
            replica_internal_names: provisional.replica_internal_names.clone(),
            job_type_version: manifest.jobtype.clone(),
            infrastructure_stats: provisional.infrastructure_stats.clone(),
        };
        self.store.put_job(&job)?;

        save_phase(&self.store, deployment_id, PHASE_POST_DEPLOY)?;
        if !family_existed {
            self.auth
                .grant_default_permissions(&plan.requester, &manifest.name)
                .await?;
        }
        self.endpoints.register(&job, &manifest.public_endpoints).await?;
        self.audit.record(match &plan.kind {
            PlanKind::Move { .. } => AuditEvent::JobMoved {
                username: plan.requester.clone(),
                job_name: manifest.name.clone(),
                job_version: manifest.version.clone(),
                target: plan.target_name.clone(),
            },
            _ if family_existed => AuditEvent::JobRedeployed {
                username: plan.requester.clone(),
                job_name: manifest.name.clone(),
                job_version: manifest.version.clone(),
            },
            _ => AuditEvent::JobDeployed {
                username: plan.requester.clone(),
                job_name: manifest.name.clone(),
                job_version: manifest.version.clone(),
            },
        });

        // Moves decommission the old workload only now, after the new
        // one is verified, so a failed move never drops to zero replicas.
        if let PlanKind::Move { from_target } = &plan.kind {
            self.decommission(deployment_id, from_target, manifest).await;
        }

        info!(
            %deployment_id,
            job_name = %manifest.name,
            job_version = %manifest.version,
            "deployment succeeded"
        );
        Ok(())
    }

    /// Resolve the secrets a run works with, downgrading "unsupported"
    /// backends to empty secrets plus a warning.
    async fn prepare_secrets(
        &self,
        plan: &DeploymentPlan,
        target: &racetrack_infra::InfrastructureTarget,
    ) -> PipelineResult<JobSecrets> {
        let manifest = &plan.manifest;
        match &plan.secrets {
            SecretsSource::Provided(secrets) => {
                match target
                    .deployer
                    .save_job_secrets(&manifest.name, &manifest.version, secrets)
                    .await
                {
                    Ok(()) => {}
                    Err(InfraError::SecretsUnsupported { target }) => {
                        add_warning(
                            &self.store,
                            &plan.deployment_id,
                            &format!("target {target} does not store secrets, they will not survive a redeploy"),
                        )?;
                    }
                    Err(e) => return Err(e.into()),
                }
                Ok(secrets.clone())
            }
            SecretsSource::Stored => {
                match target
                    .deployer
                    .get_job_secrets(&manifest.name, &manifest.version)
                    .await
                {
                    Ok(secrets) => Ok(secrets),
                    Err(InfraError::SecretsUnsupported { target }) => {
                        add_warning(
                            &self.store,
                            &plan.deployment_id,
                            &format!("target {target} does not store secrets, proceeding without them"),
                        )?;
                        Ok(JobSecrets::empty())
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Best-effort removal of the old workload after a move. The new
    /// workload is already serving, so a failure here is a warning.
    async fn decommission(&self, deployment_id: &str, from_target: &str, manifest: &Manifest) {
        let result = match self.targets.get(from_target) {
            Ok(old) => old.deployer.delete_job(&manifest.name, &manifest.version).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(
                %from_target,
                job_name = %manifest.name,
                error = %e,
                "failed to decommission the moved job's old workload"
            );
            if let Err(persist) = add_warning(
                &self.store,
                deployment_id,
                &format!("old workload on {from_target} could not be removed: {e}"),
            ) {
                error!(%deployment_id, error = %persist, "failed to record warning");
            }
        }
    }

    fn protect_overwriting(&self, manifest: &Manifest) -> PipelineResult<()> {
        if self.store.get_job(&manifest.name, &manifest.version)?.is_some() {
            return Err(PipelineError::AlreadyDeployed {
                name: manifest.name.clone(),
                version: manifest.version.clone(),
            });
        }
        if self
            .store
            .get_trash_job(&manifest.name, &manifest.version)?
            .is_some()
        {
            return Err(PipelineError::PreviouslyDeleted {
                name: manifest.name.clone(),
                version: manifest.version.clone(),
            });
        }
        Ok(())
    }

    fn built_image(&self, job: &JobRecord) -> PipelineResult<String> {
        let tag = job.image_tag.as_deref().ok_or_else(|| PipelineError::NoImage {
            name: job.name.clone(),
            version: job.version.clone(),
        })?;
        Ok(format!(
            "{}/{}/job-entrypoint/{}:{tag}",
            self.config.docker_registry, self.config.registry_namespace, job.name
        ))
    }
}

fn stored_manifest(job: &JobRecord) -> PipelineResult<Manifest> {
    job.manifest.clone().ok_or_else(|| PipelineError::NoManifest {
        name: job.name.clone(),
        version: job.version.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAll;
    use crate::audit::TracingAuditLog;
    use crate::deployment::check_deployment;
    use crate::deployment::DeploymentView;
    use crate::endpoints::NoopEndpointRegistrar;
    use crate::testing::{manifest, TestBuilder};
    use racetrack_infra::testing::{stub_target_parts, StubDeployer, StubMonitor, StubProvider};
    use racetrack_infra::{JobType, TargetProvider};
    use racetrack_state::DeploymentStatus;
    use std::sync::Arc;
    use std::time::Duration;

    struct Harness {
        pipeline: DeploymentPipeline,
        store: StateStore,
        builder: Arc<TestBuilder>,
        docker: (Arc<StubDeployer>, Arc<StubMonitor>),
        kubernetes: (Arc<StubDeployer>, Arc<StubMonitor>),
    }

    fn harness() -> Harness {
        harness_with(StubDeployer::new("docker"))
    }

    fn harness_without_secrets() -> Harness {
        harness_with(StubDeployer::without_secrets("docker"))
    }

    fn harness_with(docker_deployer: StubDeployer) -> Harness {
        let store = StateStore::open_in_memory().unwrap();
        let (mut docker_target, _, docker_monitor) = stub_target_parts("docker");
        let docker_deployer = Arc::new(docker_deployer);
        docker_target.deployer = docker_deployer.clone();
        let (kubernetes_target, k8s_deployer, k8s_monitor) = stub_target_parts("kubernetes");

        let provider: Arc<dyn TargetProvider> = Arc::new(
            StubProvider::new(0, vec![docker_target, kubernetes_target]).with_job_types(vec![
                JobType {
                    lang_name: "python3".to_string(),
                    version: "2.4.0".to_string(),
                    base_image: "racetrack/python3-base:2.4.0".to_string(),
                    template_path: None,
                },
            ]),
        );
        let providers = vec![provider];
        let targets = TargetRegistry::new();
        targets.rebuild(&providers);
        let job_types = JobTypeCatalog::new();
        job_types.rebuild(&providers);

        let builder = Arc::new(TestBuilder::new());
        let pipeline = DeploymentPipeline::new(
            store.clone(),
            targets,
            job_types,
            builder.clone(),
            Arc::new(AllowAll),
            Arc::new(NoopEndpointRegistrar),
            Arc::new(TracingAuditLog),
            PipelineConfig {
                default_target: Some("docker".to_string()),
                ..PipelineConfig::default()
            },
        );
        Harness {
            pipeline,
            store,
            builder,
            docker: (docker_deployer, docker_monitor),
            kubernetes: (k8s_deployer, k8s_monitor),
        }
    }

    async fn wait_for_settled(store: &StateStore, deployment_id: &str) -> DeploymentView {
        for _ in 0..500 {
            let view = check_deployment(store, deployment_id).unwrap();
            if view.status != DeploymentStatus::InProgress {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("deployment {deployment_id} never settled");
    }

    #[tokio::test]
    async fn deploy_new_runs_all_phases_and_registers_the_job() {
        let h = harness();
        let id = h
            .pipeline
            .deploy_new(manifest("adder", "0.0.1"), JobSecrets::empty(), None, false, "alice")
            .await
            .unwrap();

        let view = wait_for_settled(&h.store, &id).await;
        assert_eq!(view.status, DeploymentStatus::Done);
        assert!(view.phase.is_none());
        assert!(view.error.is_none());
        assert!(view.image_name.unwrap().contains("job-entrypoint/adder"));

        let job = h.store.get_job("adder", "0.0.1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.deployed_by, "alice");
        assert_eq!(job.infrastructure_target, "docker");
        assert!(job.image_tag.is_some());
        assert_eq!(h.builder.build_count(), 1);
        assert_eq!(h.docker.0.deploy_count(), 1);
        assert!(h.store.get_family("adder").unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_deploy_of_same_version_is_rejected() {
        let h = harness();
        let gate = h.builder.gated();

        let first = h
            .pipeline
            .deploy_new(manifest("adder", "0.0.1"), JobSecrets::empty(), None, false, "alice")
            .await
            .unwrap();
        let err = h
            .pipeline
            .deploy_new(manifest("adder", "0.0.1"), JobSecrets::empty(), None, false, "bob")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyOngoing { .. }));

        gate.notify_one();
        let view = wait_for_settled(&h.store, &first).await;
        assert_eq!(view.status, DeploymentStatus::Done);
    }

    #[tokio::test]
    async fn overwrite_and_trash_protection() {
        let h = harness();
        let id = h
            .pipeline
            .deploy_new(manifest("adder", "0.0.1"), JobSecrets::empty(), None, false, "alice")
            .await
            .unwrap();
        wait_for_settled(&h.store, &id).await;

        // Deployed (name, version) is protected.
        let err = h
            .pipeline
            .deploy_new(manifest("adder", "0.0.1"), JobSecrets::empty(), None, false, "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyDeployed { .. }));

        // Deletion moves the job to the trash and removes the workload.
        h.pipeline.delete_job("adder", "0.0.1", "alice").await.unwrap();
        assert!(h.store.get_job("adder", "0.0.1").unwrap().is_none());
        assert!(h.store.get_trash_job("adder", "0.0.1").unwrap().is_some());
        assert_eq!(
            h.docker.0.deleted.lock().unwrap().as_slice(),
            &[("adder".to_string(), "0.0.1".to_string())]
        );

        // The tombstone still blocks a quiet redeploy.
        let err = h
            .pipeline
            .deploy_new(manifest("adder", "0.0.1"), JobSecrets::empty(), None, false, "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::PreviouslyDeleted { .. }));

        // Force overrides both protections with a fresh row.
        let id = h
            .pipeline
            .deploy_new(manifest("adder", "0.0.1"), JobSecrets::empty(), None, true, "alice")
            .await
            .unwrap();
        let view = wait_for_settled(&h.store, &id).await;
        assert_eq!(view.status, DeploymentStatus::Done);
        assert!(h.store.get_job("adder", "0.0.1").unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_build_marks_deployment_failed_without_touching_the_job() {
        let h = harness();
        let id = h
            .pipeline
            .deploy_new(manifest("adder", "1.0.0"), JobSecrets::empty(), None, false, "alice")
            .await
            .unwrap();
        wait_for_settled(&h.store, &id).await;
        let before = h.store.get_job("adder", "1.0.0").unwrap().unwrap();

        h.builder.set_failure("compilation error in entrypoint");
        let id = h.pipeline.redeploy("adder", "1.0.0", "alice").await.unwrap();
        let view = wait_for_settled(&h.store, &id).await;
        assert_eq!(view.status, DeploymentStatus::Failed);
        assert!(view.error.unwrap().contains("compilation error"));

        // The running version is untouched by the failed attempt.
        let after = h.store.get_job("adder", "1.0.0").unwrap().unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn failed_provisioning_marks_deployment_failed() {
        let h = harness();
        *h.docker.0.fail_deploy.lock().unwrap() = Some("no space left on device".to_string());

        let id = h
            .pipeline
            .deploy_new(manifest("adder", "0.0.1"), JobSecrets::empty(), None, false, "alice")
            .await
            .unwrap();
        let view = wait_for_settled(&h.store, &id).await;
        assert_eq!(view.status, DeploymentStatus::Failed);
        assert!(view.error.unwrap().contains("no space left"));
        assert!(h.store.get_job("adder", "0.0.1").unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_verification_marks_deployment_failed() {
        let h = harness();
        h.docker.1.set_condition_error(Some("timed out waiting for /ready"));

        let id = h
            .pipeline
            .deploy_new(manifest("adder", "0.0.1"), JobSecrets::empty(), None, false, "alice")
            .await
            .unwrap();
        let view = wait_for_settled(&h.store, &id).await;
        assert_eq!(view.status, DeploymentStatus::Failed);
        assert!(view.error.unwrap().contains("/ready"));
    }

    #[tokio::test]
    async fn reprovision_skips_the_build_phase() {
        let h = harness();
        let id = h
            .pipeline
            .deploy_new(manifest("adder", "0.0.1"), JobSecrets::empty(), None, false, "alice")
            .await
            .unwrap();
        wait_for_settled(&h.store, &id).await;
        assert_eq!(h.builder.build_count(), 1);

        let id = h.pipeline.reprovision("adder", "0.0.1", "alice").await.unwrap();
        let view = wait_for_settled(&h.store, &id).await;
        assert_eq!(view.status, DeploymentStatus::Done);
        assert_eq!(h.builder.build_count(), 1);
        assert_eq!(h.docker.0.deploy_count(), 2);
    }

    #[tokio::test]
    async fn move_provisions_before_decommissioning() {
        let h = harness();
        let id = h
            .pipeline
            .deploy_new(manifest("adder", "0.0.1"), JobSecrets::empty(), None, false, "alice")
            .await
            .unwrap();
        wait_for_settled(&h.store, &id).await;

        let id = h
            .pipeline
            .move_job("adder", "0.0.1", "kubernetes", "alice")
            .await
            .unwrap();
        let view = wait_for_settled(&h.store, &id).await;
        assert_eq!(view.status, DeploymentStatus::Done);

        let job = h.store.get_job("adder", "0.0.1").unwrap().unwrap();
        assert_eq!(job.infrastructure_target, "kubernetes");
        assert_eq!(h.kubernetes.0.deploy_count(), 1);
        // The old workload is gone from docker.
        assert_eq!(
            h.docker.0.deleted.lock().unwrap().as_slice(),
            &[("adder".to_string(), "0.0.1".to_string())]
        );

        let err = h
            .pipeline
            .move_job("adder", "0.0.1", "kubernetes", "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::MoveToSameTarget { .. }));
    }

    #[tokio::test]
    async fn unsupported_secret_store_downgrades_to_a_warning() {
        let h = harness_without_secrets();
        let mut secrets = JobSecrets::empty();
        secrets
            .secret_build_env
            .insert("TOKEN".to_string(), "hunter2".to_string());

        let id = h
            .pipeline
            .deploy_new(manifest("adder", "0.0.1"), secrets, None, false, "alice")
            .await
            .unwrap();
        let view = wait_for_settled(&h.store, &id).await;
        assert_eq!(view.status, DeploymentStatus::Done);
        assert!(view.warnings.unwrap().contains("does not store secrets"));
        // The provided secrets still reach this one build.
        assert_eq!(
            h.builder.builds.lock().unwrap()[0].secret_build_env["TOKEN"],
            "hunter2"
        );
    }

    #[tokio::test]
    async fn unknown_job_type_is_rejected_synchronously() {
        let h = harness();
        let mut bad = manifest("adder", "0.0.1");
        bad.jobtype = "rust:latest".to_string();
        let err = h
            .pipeline
            .deploy_new(bad, JobSecrets::empty(), None, false, "alice")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Infra(InfraError::UnknownJobType(_))
        ));
    }

    #[tokio::test]
    async fn redeploy_resolves_version_aliases() {
        let h = harness();
        for version in ["1.0.0", "1.2.0"] {
            let id = h
                .pipeline
                .deploy_new(manifest("adder", version), JobSecrets::empty(), None, false, "alice")
                .await
                .unwrap();
            wait_for_settled(&h.store, &id).await;
        }

        let id = h.pipeline.redeploy("adder", "latest", "alice").await.unwrap();
        let view = wait_for_settled(&h.store, &id).await;
        assert_eq!(view.status, DeploymentStatus::Done);
        assert_eq!(view.job_version, "1.2.0");
    }
}
