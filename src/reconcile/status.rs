//! Status aggregation
//!
//! Folds the per-kernel results of a pass into the object-level status. The
//! functions here are pure; the hooks decide whether the result differs from
//! the stored status and only write when it does.

use super::projector::Projection;
use super::selector::Selection;
use crate::crd::{
    ImageState, ImageStatus, ManagedClusterModuleStatus, ModuleCondition, ModuleLoaderStatus,
    ModuleStatus, TemplateErrorStatus,
};
use crate::domain::{DerivedObject, RemoteManifest, StageKind, Workload};
use crate::kernel::{KernelVersion, ResolutionFailure};
use crate::labels::TARGET_KERNEL_LABEL;
use crate::pipeline::Orchestration;
use std::collections::BTreeMap;

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_PROGRESSING: &str = "Progressing";
pub const CONDITION_DEGRADED: &str = "Degraded";

/// Image state shown for one kernel version
pub fn image_state(outcome: Option<&Orchestration>) -> (ImageState, Option<String>) {
    match outcome {
        None => (ImageState::Pending, None),
        Some(Orchestration::Completed { .. }) => (ImageState::Ready, None),
        Some(Orchestration::InProgress {
            stage: StageKind::Build,
        }) => (ImageState::Building, None),
        Some(Orchestration::InProgress {
            stage: StageKind::Sign,
        }) => (ImageState::Signing, None),
        Some(Orchestration::Failed { reason, .. }) => (ImageState::Error, Some(reason.clone())),
    }
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

fn join_kernels<'a>(kernels: impl Iterator<Item = &'a KernelVersion>) -> String {
    kernels.map(|k| k.as_str()).collect::<Vec<_>>().join(", ")
}

/// Compute the Module status of a pass
pub fn module_status(
    previous: Option<&ModuleStatus>,
    generation: Option<i64>,
    selection: &Selection,
    outcomes: &BTreeMap<KernelVersion, Orchestration>,
    projection: &Projection,
    workloads: &[Workload],
) -> ModuleStatus {
    let mut status = ModuleStatus {
        conditions: previous.map(|p| p.conditions.clone()).unwrap_or_default(),
        observed_generation: generation,
        ..Default::default()
    };

    let desired = selection.desired_targets();
    let ready = projection.ready_targets.len();
    let available: u32 = workloads
        .iter()
        .filter(|w| {
            w.label(TARGET_KERNEL_LABEL)
                .map(|k| projection.deployed.iter().any(|d| d.as_str() == k))
                .unwrap_or(false)
        })
        .map(|w| w.status.available)
        .sum();

    status.module_loader = ModuleLoaderStatus {
        nodes_matching_selector_number: count(selection.candidates),
        desired_number: count(desired),
        ready_number: count(ready),
        available_number: available,
    };

    status.images = selection
        .groups
        .iter()
        .map(|(kernel, group)| {
            let (state, message) = image_state(outcomes.get(kernel));
            ImageStatus {
                kernel_version: kernel.to_string(),
                image: group.mapping.container_image.clone(),
                state,
                message,
            }
        })
        .collect();

    for (kernel, failure) in selection.unresolved() {
        match failure {
            ResolutionFailure::NoMatchingMapping => {
                status.unmatched_kernel_versions.push(kernel.to_string())
            }
            ResolutionFailure::InvalidMapping(msg) | ResolutionFailure::Template(msg) => {
                status.template_errors.push(TemplateErrorStatus {
                    kernel_version: kernel.to_string(),
                    message: msg.clone(),
                })
            }
        }
    }

    let in_progress: Vec<_> = outcomes
        .iter()
        .filter(|(_, o)| o.is_in_progress())
        .map(|(k, _)| k)
        .collect();
    let failed: Vec<_> = outcomes
        .iter()
        .filter(|(_, o)| matches!(o, Orchestration::Failed { .. }))
        .map(|(k, _)| k)
        .collect();

    status.set_condition(if desired == 0 {
        ModuleCondition::new(CONDITION_READY, false, "NoTargetNodes", "No node resolved to a kernel mapping")
    } else if ready == desired {
        ModuleCondition::new(CONDITION_READY, true, "AllNodesReady", format!("{}/{} nodes ready", ready, desired))
    } else {
        ModuleCondition::new(CONDITION_READY, false, "NodesPending", format!("{}/{} nodes ready", ready, desired))
    });

    status.set_condition(if in_progress.is_empty() {
        ModuleCondition::new(CONDITION_PROGRESSING, false, "Idle", "No pipeline running")
    } else {
        ModuleCondition::new(
            CONDITION_PROGRESSING,
            true,
            "PipelineRunning",
            format!("Images in progress for kernels: {}", join_kernels(in_progress.into_iter())),
        )
    });

    status.set_condition(if !failed.is_empty() {
        ModuleCondition::new(
            CONDITION_DEGRADED,
            true,
            "PipelineFailed",
            format!("Image pipeline failed for kernels: {}", join_kernels(failed.into_iter())),
        )
    } else if !status.template_errors.is_empty() {
        ModuleCondition::new(
            CONDITION_DEGRADED,
            true,
            "TemplateError",
            format!("{} kernel version(s) could not be resolved", status.template_errors.len()),
        )
    } else if !status.unmatched_kernel_versions.is_empty() {
        ModuleCondition::new(
            CONDITION_DEGRADED,
            true,
            "NoKernelMapping",
            format!("No mapping for kernels: {}", status.unmatched_kernel_versions.join(", ")),
        )
    } else {
        ModuleCondition::new(CONDITION_DEGRADED, false, "AsExpected", "")
    });

    status
}

/// Compute the ManagedClusterModule status of a pass
pub fn hub_status(
    previous: Option<&ManagedClusterModuleStatus>,
    selected_clusters: usize,
    selection: &Selection,
    outcomes: &BTreeMap<KernelVersion, Orchestration>,
    manifests: &[RemoteManifest],
) -> ManagedClusterModuleStatus {
    let mut status = ManagedClusterModuleStatus {
        conditions: previous.map(|p| p.conditions.clone()).unwrap_or_default(),
        number_desired: count(selected_clusters),
        number_applied: count(manifests.iter().filter(|m| m.applied).count()),
        number_available: count(manifests.iter().filter(|m| m.available).count()),
    };

    let in_progress = outcomes.values().filter(|o| o.is_in_progress()).count();
    let failed: Vec<_> = outcomes
        .iter()
        .filter(|(_, o)| matches!(o, Orchestration::Failed { .. }))
        .map(|(k, _)| k)
        .collect();
    let unresolved = selection.unresolved();

    let (desired, available) = (status.number_desired, status.number_available);
    status.set_condition(if desired > 0 && available == desired {
        ModuleCondition::new(CONDITION_READY, true, "AllClustersAvailable", "")
    } else {
        ModuleCondition::new(
            CONDITION_READY,
            false,
            "ClustersPending",
            format!("{}/{} clusters available", available, desired),
        )
    });
    status.set_condition(ModuleCondition::new(
        CONDITION_PROGRESSING,
        in_progress > 0,
        if in_progress > 0 { "PipelineRunning" } else { "Idle" },
        format!("{} kernel image(s) in progress", in_progress),
    ));
    status.set_condition(if !failed.is_empty() {
        ModuleCondition::new(
            CONDITION_DEGRADED,
            true,
            "PipelineFailed",
            format!("Image pipeline failed for kernels: {}", join_kernels(failed.into_iter())),
        )
    } else if !unresolved.is_empty() {
        ModuleCondition::new(
            CONDITION_DEGRADED,
            true,
            "UnresolvedKernels",
            format!("Unresolved kernels: {}", join_kernels(unresolved.keys().copied())),
        )
    } else {
        ModuleCondition::new(CONDITION_DEGRADED, false, "AsExpected", "")
    });

    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DerivedMeta, ModuleRef, WorkloadSpec, WorkloadStatus};
    use crate::kernel::{MappingCache, ResolvedMapping};
    use crate::labels::kernel_labels;
    use crate::Error;

    fn selection(kernels: &[(&str, &str)]) -> Selection {
        let mut selection = Selection::default();
        let mut cache = MappingCache::new();
        selection.candidates = kernels.len();
        for (node, kernel) in kernels {
            selection.record(&mut cache, node, kernel, |k| {
                if k.as_str().starts_with('6') {
                    return Err(Error::NoKernelMapping {
                        kernel_version: k.to_string(),
                    });
                }
                Ok(ResolvedMapping {
                    module: ModuleRef::new("kmod", "drivers"),
                    kernel_version: k.clone(),
                    container_image: format!("img:{}", k),
                    image_repo_secret: None,
                    build: None,
                    sign: None,
                })
            });
        }
        selection
    }

    fn workload(kernel: &str, available: u32) -> Workload {
        Workload {
            meta: DerivedMeta::new(format!("kmod-{}", kernel), "drivers", kernel_labels("kmod", kernel)),
            spec: WorkloadSpec::default(),
            status: WorkloadStatus {
                desired: available,
                ready: available,
                available,
            },
        }
    }

    #[test]
    fn test_counts_and_states() {
        let selection = selection(&[("n1", "5.14.0-1"), ("n2", "5.14.0-1"), ("n3", "5.15.0-2"), ("n4", "6.0.0-rc1")]);
        let outcomes = BTreeMap::from([
            (KernelVersion::normalize("5.14.0-1"), Orchestration::Completed { image: "img:5.14.0-1".into() }),
            (KernelVersion::normalize("5.15.0-2"), Orchestration::InProgress { stage: StageKind::Sign }),
        ]);
        let projection = Projection {
            deployed: [KernelVersion::normalize("5.14.0-1")].into(),
            ready_targets: ["n1".to_string(), "n2".to_string()].into(),
        };
        let workloads = vec![workload("5.14.0-1", 2), workload("5.13.0-9", 5)];

        let status = module_status(None, Some(3), &selection, &outcomes, &projection, &workloads);

        assert_eq!(status.module_loader.nodes_matching_selector_number, 4);
        assert_eq!(status.module_loader.desired_number, 3);
        assert_eq!(status.module_loader.ready_number, 2);
        assert_eq!(status.module_loader.available_number, 2);
        assert_eq!(status.observed_generation, Some(3));
        assert_eq!(status.image("5.15.0-2").unwrap().state, ImageState::Signing);
        assert_eq!(status.image("5.14.0-1").unwrap().state, ImageState::Ready);
        assert_eq!(status.unmatched_kernel_versions, vec!["6.0.0-rc1".to_string()]);

        assert_eq!(status.condition(CONDITION_READY).unwrap().status, "False");
        assert_eq!(status.condition(CONDITION_PROGRESSING).unwrap().status, "True");
        let degraded = status.condition(CONDITION_DEGRADED).unwrap();
        assert_eq!(degraded.reason.as_deref(), Some("NoKernelMapping"));
    }

    #[test]
    fn test_failed_pipeline_is_degraded() {
        let selection = selection(&[("n1", "5.14.0-1")]);
        let outcomes = BTreeMap::from([(
            KernelVersion::normalize("5.14.0-1"),
            Orchestration::Failed { stage: StageKind::Build, reason: "build job kmod-build-x failed".into() },
        )]);

        let status = module_status(None, None, &selection, &outcomes, &Projection::default(), &[]);

        let image = status.image("5.14.0-1").unwrap();
        assert_eq!(image.state, ImageState::Error);
        assert!(image.message.as_deref().unwrap().contains("failed"));
        assert_eq!(
            status.condition(CONDITION_DEGRADED).unwrap().reason.as_deref(),
            Some("PipelineFailed")
        );
    }

    #[test]
    fn test_unchanged_pass_yields_equal_status() {
        let selection = selection(&[("n1", "5.14.0-1")]);
        let outcomes = BTreeMap::from([(
            KernelVersion::normalize("5.14.0-1"),
            Orchestration::Completed { image: "img:5.14.0-1".into() },
        )]);
        let projection = Projection {
            deployed: [KernelVersion::normalize("5.14.0-1")].into(),
            ready_targets: ["n1".to_string()].into(),
        };

        let first = module_status(None, Some(1), &selection, &outcomes, &projection, &[]);
        let second = module_status(Some(&first), Some(1), &selection, &outcomes, &projection, &[]);
        assert_eq!(first, second);
        assert_eq!(first.condition(CONDITION_READY).unwrap().status, "True");
    }
}
