//! Execution job naming, labeling and status translation

use crate::domain::{
    short_hash, DerivedMeta, ExecutionJob, JobPhase, JobTemplate, OwnerRef, StageKind,
};
use crate::kernel::{KernelVersion, ResolvedMapping};
use crate::labels::{owner_selector, JOB_TYPE_LABEL, TARGET_KERNEL_LABEL};
use std::collections::BTreeMap;

/// Longest name a Job may have while its pods stay addressable by label
const MAX_JOB_NAME: usize = 63;

/// Outcome of one pipeline stage for one kernel version
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineStatus {
    Completed,
    InProgress,
    Failed { reason: String },
}

/// Deterministic job name for an (owner kind, module, kernel, stage) tuple
pub fn job_name(owner_kind: &str, module: &str, kernel: &KernelVersion, stage: StageKind) -> String {
    let suffix = format!(
        "-{}-{}",
        stage,
        short_hash(&format!("{}/{}", owner_kind, kernel))
    );
    let budget = MAX_JOB_NAME - suffix.len();
    let prefix: String = module.chars().take(budget).collect();
    format!("{}{}", prefix.trim_end_matches(['-', '.']), suffix)
}

/// Labels used to find the job of an (owner kind, module, kernel, stage) tuple
pub fn job_labels(
    owner_kind: &str,
    module: &str,
    kernel: &KernelVersion,
    stage: StageKind,
) -> BTreeMap<String, String> {
    let mut labels = owner_selector(owner_kind, module);
    labels.insert(TARGET_KERNEL_LABEL.to_string(), kernel.to_string());
    labels.insert(JOB_TYPE_LABEL.to_string(), stage.to_string());
    labels
}

/// Build the job object for a stage of `mapping`
pub fn new_job(
    owner: &OwnerRef,
    mapping: &ResolvedMapping,
    stage: StageKind,
    template: JobTemplate,
    hash: String,
) -> ExecutionJob {
    let meta = DerivedMeta::new(
        job_name(&owner.kind, &mapping.module.name, &mapping.kernel_version, stage),
        mapping.module.namespace.clone(),
        job_labels(&owner.kind, &mapping.module.name, &mapping.kernel_version, stage),
    )
    .with_owner(owner)
    .with_hash(hash);

    ExecutionJob {
        meta,
        stage,
        template,
        phase: JobPhase::NotStarted,
        completed_at: None,
    }
}

/// Translate a job phase; anything not terminal keeps the stage in progress
pub fn status_from_phase(job: &ExecutionJob) -> PipelineStatus {
    match &job.phase {
        JobPhase::Succeeded => PipelineStatus::Completed,
        JobPhase::Failed => PipelineStatus::Failed {
            reason: format!("{} job {} failed", job.stage, job.meta.name),
        },
        JobPhase::NotStarted | JobPhase::Running | JobPhase::Unknown(_) => {
            PipelineStatus::InProgress
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::{MODULE_NAME_LABEL, OWNER_KIND_LABEL};

    #[test]
    fn test_job_name_is_deterministic_and_bounded() {
        let kernel = KernelVersion::normalize("5.14.0-284.el9.x86_64");
        let a = job_name("Module", "kmod", &kernel, StageKind::Build);
        assert_eq!(a, job_name("Module", "kmod", &kernel, StageKind::Build));
        assert!(a.starts_with("kmod-build-"));
        assert_ne!(a, job_name("Module", "kmod", &kernel, StageKind::Sign));
        assert_ne!(a, job_name("ManagedClusterModule", "kmod", &kernel, StageKind::Build));

        let long = "a".repeat(80);
        let name = job_name("Module", &long, &kernel, StageKind::Sign);
        assert!(name.len() <= MAX_JOB_NAME);
    }

    #[test]
    fn test_job_labels() {
        let kernel = KernelVersion::normalize("5.14.0-1");
        let labels = job_labels("Module", "kmod", &kernel, StageKind::Sign);
        assert_eq!(labels[MODULE_NAME_LABEL], "kmod");
        assert_eq!(labels[OWNER_KIND_LABEL], "Module");
        assert_eq!(labels[TARGET_KERNEL_LABEL], "5.14.0-1");
        assert_eq!(labels[JOB_TYPE_LABEL], "sign");
    }

    #[test]
    fn test_status_from_phase() {
        let mut job = ExecutionJob {
            meta: DerivedMeta::new("kmod-build-x", "ns", BTreeMap::new()),
            stage: StageKind::Build,
            template: JobTemplate::default(),
            phase: JobPhase::Running,
            completed_at: None,
        };
        assert_eq!(status_from_phase(&job), PipelineStatus::InProgress);

        job.phase = JobPhase::Unknown("Suspended".into());
        assert_eq!(status_from_phase(&job), PipelineStatus::InProgress);

        job.phase = JobPhase::Succeeded;
        assert_eq!(status_from_phase(&job), PipelineStatus::Completed);

        job.phase = JobPhase::Failed;
        assert!(matches!(status_from_phase(&job), PipelineStatus::Failed { .. }));
    }
}
