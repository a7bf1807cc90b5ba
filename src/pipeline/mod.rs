//! Build and sign pipeline
//!
//! Each kernel version of a module goes through up to two stages. Stages
//! never wait: they create or inspect a job and report `InProgress` until a
//! later pass observes the job finished.

pub mod build;
pub mod job;
pub mod orchestrator;
pub mod sign;
pub mod stage;

pub use job::{job_labels, job_name, PipelineStatus};
pub use orchestrator::{BuildSignOrchestrator, Orchestration};
pub use stage::{JobStage, PipelineStage, PipelineStageRef};
