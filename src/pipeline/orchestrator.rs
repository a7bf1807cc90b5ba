//! Build-then-sign orchestration for one kernel version

use super::job::PipelineStatus;
use super::stage::PipelineStageRef;
use crate::domain::{OwnerRef, StageKind};
use crate::error::Result;
use crate::kernel::{KernelVersion, ResolvedMapping};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Where the image of one kernel version stands after a pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Orchestration {
    /// The final image exists and can be deployed
    Completed { image: String },
    InProgress { stage: StageKind },
    Failed { stage: StageKind, reason: String },
}

impl Orchestration {
    pub fn is_completed(&self) -> bool {
        matches!(self, Orchestration::Completed { .. })
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self, Orchestration::InProgress { .. })
    }
}

/// Runs the build stage, then the sign stage once the build is done
pub struct BuildSignOrchestrator {
    build: PipelineStageRef,
    sign: PipelineStageRef,
}

impl BuildSignOrchestrator {
    pub fn new(build: PipelineStageRef, sign: PipelineStageRef) -> Self {
        Self { build, sign }
    }

    #[instrument(skip(self, owner, mapping), fields(
        module = %mapping.module.name,
        kernel_version = %mapping.kernel_version,
    ))]
    pub async fn run(&self, owner: &OwnerRef, mapping: &ResolvedMapping) -> Result<Orchestration> {
        if self.build.should_sync(mapping).await {
            match self.build.sync(owner, mapping, None).await? {
                PipelineStatus::Completed => debug!("Build completed"),
                PipelineStatus::InProgress => {
                    return Ok(Orchestration::InProgress {
                        stage: StageKind::Build,
                    })
                }
                PipelineStatus::Failed { reason } => {
                    return Ok(Orchestration::Failed {
                        stage: StageKind::Build,
                        reason,
                    })
                }
            }
        }

        if self.sign.should_sync(mapping).await {
            let unsigned = mapping.sign_input();
            match self.sign.sync(owner, mapping, unsigned.as_deref()).await? {
                PipelineStatus::Completed => debug!("Sign completed"),
                PipelineStatus::InProgress => {
                    return Ok(Orchestration::InProgress {
                        stage: StageKind::Sign,
                    })
                }
                PipelineStatus::Failed { reason } => {
                    return Ok(Orchestration::Failed {
                        stage: StageKind::Sign,
                        reason,
                    })
                }
            }
        }

        Ok(Orchestration::Completed {
            image: mapping.container_image.clone(),
        })
    }

    /// Run every kernel version concurrently.
    ///
    /// All runs complete before returning; when some of them failed with an
    /// error, the first one is returned and the other outcomes are dropped.
    pub async fn run_all<'a, I>(
        &self,
        owner: &OwnerRef,
        mappings: I,
    ) -> Result<BTreeMap<KernelVersion, Orchestration>>
    where
        I: IntoIterator<Item = &'a Arc<ResolvedMapping>>,
    {
        let runs = mappings.into_iter().map(|mapping| async move {
            (mapping.kernel_version.clone(), self.run(owner, mapping).await)
        });

        let mut outcomes = BTreeMap::new();
        let mut first_error = None;
        for (kernel, result) in join_all(runs).await {
            match result {
                Ok(outcome) => {
                    outcomes.insert(kernel, outcome);
                }
                Err(e) => {
                    warn!(kernel_version = %kernel, error = %e, "Pipeline step failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(outcomes),
        }
    }
}
