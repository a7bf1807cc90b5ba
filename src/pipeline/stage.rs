//! Pipeline stages backed by execution jobs

use super::build::build_job_template;
use super::job::{job_labels, new_job, status_from_phase, PipelineStatus};
use super::sign::sign_job_template;
use crate::config::OperatorConfig;
use crate::domain::{
    content_hash, DerivedObject, ImageRegistryRef, JobStoreRef, JobTemplate, OwnerRef, StageKind,
};
use crate::error::{Error, Result};
use crate::kernel::ResolvedMapping;
use crate::metrics;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// One step of the image pipeline
#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn kind(&self) -> StageKind;

    /// Whether the stage has work to do for `mapping`.
    ///
    /// Never fails: when the registry cannot be queried the answer is `true`,
    /// since running a stage for an existing image is only wasted work.
    async fn should_sync(&self, mapping: &ResolvedMapping) -> bool;

    /// Drive the stage's job one step and report where it stands
    async fn sync(
        &self,
        owner: &OwnerRef,
        mapping: &ResolvedMapping,
        prior_image: Option<&str>,
    ) -> Result<PipelineStatus>;
}

pub type PipelineStageRef = Arc<dyn PipelineStage>;

/// A stage that runs one Kubernetes job per (module, kernel)
pub struct JobStage {
    kind: StageKind,
    jobs: JobStoreRef,
    registry: ImageRegistryRef,
    config: Arc<OperatorConfig>,
}

impl JobStage {
    pub fn build(jobs: JobStoreRef, registry: ImageRegistryRef, config: Arc<OperatorConfig>) -> Self {
        Self {
            kind: StageKind::Build,
            jobs,
            registry,
            config,
        }
    }

    pub fn sign(jobs: JobStoreRef, registry: ImageRegistryRef, config: Arc<OperatorConfig>) -> Self {
        Self {
            kind: StageKind::Sign,
            jobs,
            registry,
            config,
        }
    }

    /// Image this stage pushes, `None` when the stage is not configured
    fn target_image(&self, mapping: &ResolvedMapping) -> Option<String> {
        match self.kind {
            StageKind::Build => mapping.build_target(),
            StageKind::Sign => mapping
                .sign
                .as_ref()
                .map(|_| mapping.container_image.clone()),
        }
    }

    fn template(&self, mapping: &ResolvedMapping, prior_image: Option<&str>) -> Result<JobTemplate> {
        let not_configured = || {
            Error::Internal(format!(
                "{} stage is not configured for {} on kernel {}",
                self.kind, mapping.module.name, mapping.kernel_version
            ))
        };

        match self.kind {
            StageKind::Build => {
                let build = mapping.build.as_ref().ok_or_else(not_configured)?;
                let destination = mapping.build_target().ok_or_else(not_configured)?;
                Ok(build_job_template(mapping, build, &destination, &self.config))
            }
            StageKind::Sign => {
                let sign = mapping.sign.as_ref().ok_or_else(not_configured)?;
                let unsigned = prior_image
                    .map(str::to_string)
                    .or_else(|| mapping.sign_input())
                    .ok_or_else(not_configured)?;
                Ok(sign_job_template(
                    mapping,
                    sign,
                    &unsigned,
                    &mapping.container_image,
                    &self.config,
                ))
            }
        }
    }

    async fn exists(&self, image: &str) -> Option<bool> {
        match self.registry.image_exists(image).await {
            Ok(found) => Some(found),
            Err(e) => {
                warn!(image, error = %e, "Registry lookup failed; assuming the image is missing");
                None
            }
        }
    }
}

#[async_trait]
impl PipelineStage for JobStage {
    fn kind(&self) -> StageKind {
        self.kind
    }

    async fn should_sync(&self, mapping: &ResolvedMapping) -> bool {
        let Some(target) = self.target_image(mapping) else {
            return false;
        };

        // The final image existing makes every stage moot
        match self.exists(&mapping.container_image).await {
            Some(true) => return false,
            Some(false) => {}
            None => return true,
        }
        if target != mapping.container_image {
            return self.exists(&target).await != Some(true);
        }
        true
    }

    #[instrument(skip(self, owner, mapping, prior_image), fields(
        module = %mapping.module.name,
        namespace = %mapping.module.namespace,
        kernel_version = %mapping.kernel_version,
        stage = %self.kind,
    ))]
    async fn sync(
        &self,
        owner: &OwnerRef,
        mapping: &ResolvedMapping,
        prior_image: Option<&str>,
    ) -> Result<PipelineStatus> {
        let template = self.template(mapping, prior_image)?;
        let hash = content_hash(&template)?;
        let labels = job_labels(
            &owner.kind,
            &mapping.module.name,
            &mapping.kernel_version,
            self.kind,
        );

        let mut existing = self
            .jobs
            .list(Some(&mapping.module.namespace), &labels)
            .await?;

        match existing.len() {
            0 => {
                let job = new_job(owner, mapping, self.kind, template, hash);
                self.jobs.apply(&job).await?;
                metrics::JOBS_CREATED_TOTAL
                    .with_label_values(&[self.kind.as_str()])
                    .inc();
                info!(job = %job.meta.name, "Created {} job", self.kind);
                Ok(PipelineStatus::InProgress)
            }
            1 => {
                let job = existing.remove(0);
                if job.desired_hash() != Some(hash.as_str()) {
                    info!(job = %job.name(), "Job template changed; deleting job for re-creation");
                    self.jobs.delete(job.namespace(), job.name()).await?;
                    return Ok(PipelineStatus::InProgress);
                }
                let status = status_from_phase(&job);
                debug!(job = %job.name(), ?status, "Observed job");
                Ok(status)
            }
            count => Err(Error::DuplicateJobs {
                module: mapping.module.name.clone(),
                kernel_version: mapping.kernel_version.to_string(),
                stage: self.kind.to_string(),
                count,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryCluster;
    use crate::crd::BuildArg;
    use crate::domain::{JobPhase, ModuleRef};
    use crate::kernel::{KernelVersion, ResolvedBuild, ResolvedSign};
    use assert_matches::assert_matches;

    fn owner() -> OwnerRef {
        OwnerRef {
            api_version: "kmm.sigs.x-k8s.io/v1beta1".into(),
            kind: "Module".into(),
            name: "kmod".into(),
            uid: "uid-1".into(),
        }
    }

    fn mapping(build: bool, sign: bool) -> ResolvedMapping {
        ResolvedMapping {
            module: ModuleRef::new("kmod", "drivers"),
            kernel_version: KernelVersion::normalize("5.14.0-1"),
            container_image: "registry.local/kmod:5.14.0-1".into(),
            image_repo_secret: None,
            build: build.then(|| ResolvedBuild {
                dockerfile_config_map: "df".into(),
                build_args: vec![],
                secrets: vec![],
                insecure_registry: false,
            }),
            sign: sign.then(|| ResolvedSign {
                key_secret: "key".into(),
                cert_secret: "cert".into(),
                files_to_sign: vec!["/opt/kmod.ko".into()],
                unsigned_image: None,
            }),
        }
    }

    fn stages(cluster: &Arc<InMemoryCluster>) -> (JobStage, JobStage) {
        let config = Arc::new(OperatorConfig::default());
        (
            JobStage::build(cluster.clone(), cluster.clone(), config.clone()),
            JobStage::sign(cluster.clone(), cluster.clone(), config),
        )
    }

    #[tokio::test]
    async fn test_should_sync() {
        let cluster = Arc::new(InMemoryCluster::new());
        let (build, sign) = stages(&cluster);

        // Not configured
        assert!(!build.should_sync(&mapping(false, false)).await);
        assert!(!sign.should_sync(&mapping(true, false)).await);

        // Configured, nothing in the registry
        let m = mapping(true, true);
        assert!(build.should_sync(&m).await);
        assert!(sign.should_sync(&m).await);

        // Intermediate image pushed: build is done, sign still has work
        cluster.push_image(&m.intermediate_image());
        assert!(!build.should_sync(&m).await);
        assert!(sign.should_sync(&m).await);

        // Final image exists: nothing to do
        cluster.push_image(&m.container_image);
        assert!(!build.should_sync(&m).await);
        assert!(!sign.should_sync(&m).await);
    }

    #[tokio::test]
    async fn test_should_sync_on_registry_failure() {
        let cluster = Arc::new(InMemoryCluster::new());
        let (build, _) = stages(&cluster);
        let m = mapping(true, false);
        cluster.push_image(&m.container_image);
        cluster.fail_registry(true);

        assert!(build.should_sync(&m).await);
    }

    #[tokio::test]
    async fn test_sync_creates_then_tracks_job() {
        let cluster = Arc::new(InMemoryCluster::new());
        let (build, _) = stages(&cluster);
        let m = mapping(true, false);

        assert_eq!(
            build.sync(&owner(), &m, None).await.unwrap(),
            PipelineStatus::InProgress
        );
        let jobs = cluster.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].stage, StageKind::Build);
        assert!(jobs[0]
            .template
            .args
            .contains(&"--destination=registry.local/kmod:5.14.0-1".to_string()));

        // Second pass does not create another job
        assert_eq!(
            build.sync(&owner(), &m, None).await.unwrap(),
            PipelineStatus::InProgress
        );
        assert_eq!(cluster.jobs().len(), 1);

        cluster.set_job_phase("drivers", &jobs[0].meta.name, JobPhase::Succeeded);
        assert_eq!(
            build.sync(&owner(), &m, None).await.unwrap(),
            PipelineStatus::Completed
        );

        cluster.set_job_phase("drivers", &jobs[0].meta.name, JobPhase::Failed);
        assert_matches!(
            build.sync(&owner(), &m, None).await.unwrap(),
            PipelineStatus::Failed { .. }
        );
    }

    #[tokio::test]
    async fn test_sync_recreates_drifted_job() {
        let cluster = Arc::new(InMemoryCluster::new());
        let (build, _) = stages(&cluster);
        let mut m = mapping(true, false);

        build.sync(&owner(), &m, None).await.unwrap();
        let name = cluster.jobs()[0].meta.name.clone();
        cluster.set_job_phase("drivers", &name, JobPhase::Failed);

        if let Some(b) = m.build.as_mut() {
            b.build_args.push(BuildArg {
                name: "FIX".into(),
                value: "1".into(),
            });
        }

        // Drift deletes the job, the following pass creates the new one
        assert_eq!(
            build.sync(&owner(), &m, None).await.unwrap(),
            PipelineStatus::InProgress
        );
        assert!(cluster.jobs().is_empty());

        build.sync(&owner(), &m, None).await.unwrap();
        let jobs = cluster.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].phase, JobPhase::NotStarted);
        assert!(jobs[0].template.args.contains(&"--build-arg=FIX=1".to_string()));
    }

    #[tokio::test]
    async fn test_sync_rejects_duplicate_jobs() {
        let cluster = Arc::new(InMemoryCluster::new());
        let (build, _) = stages(&cluster);
        let m = mapping(true, false);

        build.sync(&owner(), &m, None).await.unwrap();
        let mut twin = cluster.jobs()[0].clone();
        twin.meta.name = "kmod-build-twin".into();
        cluster.insert_job(twin);

        assert_matches!(
            build.sync(&owner(), &m, None).await,
            Err(Error::DuplicateJobs { count: 2, .. })
        );
    }

    #[tokio::test]
    async fn test_sync_ignores_jobs_of_other_owner_kind() {
        let cluster = Arc::new(InMemoryCluster::new());
        let (build, _) = stages(&cluster);
        let m = mapping(true, false);
        let hub_owner = OwnerRef {
            kind: "ManagedClusterModule".into(),
            uid: "uid-hub".into(),
            ..owner()
        };

        build.sync(&hub_owner, &m, None).await.unwrap();
        let hub_job = cluster.jobs().remove(0);

        assert_eq!(
            build.sync(&owner(), &m, None).await.unwrap(),
            PipelineStatus::InProgress
        );

        let jobs = cluster.jobs();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.contains(&hub_job));
        assert!(jobs.iter().any(|j| j.meta.name != hub_job.meta.name));
    }

    #[tokio::test]
    async fn test_sign_reads_intermediate_image() {
        let cluster = Arc::new(InMemoryCluster::new());
        let (_, sign) = stages(&cluster);
        let m = mapping(true, true);
        let intermediate = m.intermediate_image();

        sign.sync(&owner(), &m, Some(&intermediate)).await.unwrap();
        let jobs = cluster.jobs();
        assert_eq!(jobs[0].stage, StageKind::Sign);
        assert_eq!(jobs[0].template.args[1], intermediate);
        assert_eq!(jobs[0].template.args[3], m.container_image);
    }
}
