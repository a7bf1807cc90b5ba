//! Execution jobs as `batch/v1` Jobs

use super::{delete_object, derived_meta, list_params, map_kube_error, object_meta, KubeCluster};
use crate::domain::{
    ApplyOutcome, DerivedObject, ExecutionJob, JobPhase, JobTemplate, JobVolume, ObjectStore,
    StageKind, VolumeSource,
};
use crate::error::{Error, Result};
use crate::labels::JOB_TYPE_LABEL;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{Job, JobSpec, JobStatus};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, PodSpec, PodTemplateSpec, SecretVolumeSource, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::PostParams;
use kube::Api;
use std::collections::BTreeMap;
use tracing::{debug, instrument};

/// Render an execution job as a Kubernetes Job
pub fn to_job(job: &ExecutionJob) -> Job {
    let template = &job.template;

    let volumes: Vec<Volume> = template
        .volumes
        .iter()
        .map(|v| match &v.source {
            VolumeSource::Secret(secret) => Volume {
                name: v.name.clone(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            VolumeSource::ConfigMap(config_map) => Volume {
                name: v.name.clone(),
                config_map: Some(ConfigMapVolumeSource {
                    name: Some(config_map.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        })
        .collect();

    let mounts: Vec<VolumeMount> = template
        .volumes
        .iter()
        .map(|v| VolumeMount {
            name: v.name.clone(),
            mount_path: v.mount_path.clone(),
            read_only: Some(true),
            ..Default::default()
        })
        .collect();

    Job {
        metadata: object_meta(&job.meta),
        spec: Some(JobSpec {
            backoff_limit: Some(template.backoff_limit),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(job.meta.labels.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: job.stage.as_str().to_string(),
                        image: Some(template.image.clone()),
                        args: (!template.args.is_empty()).then(|| template.args.clone()),
                        volume_mounts: (!mounts.is_empty()).then_some(mounts),
                        ..Default::default()
                    }],
                    volumes: (!volumes.is_empty()).then_some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

fn condition_time(status: &JobStatus, r#type: &str) -> Option<DateTime<Utc>> {
    status
        .conditions
        .iter()
        .flatten()
        .find(|c| c.type_ == r#type && c.status == "True")
        .and_then(|c| c.last_transition_time.as_ref().map(|t| t.0))
}

fn has_condition(status: &JobStatus, r#type: &str) -> bool {
    status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == r#type && c.status == "True")
}

/// Map a Job status onto the execution job phase vocabulary
pub fn job_phase(status: Option<&JobStatus>) -> JobPhase {
    let Some(status) = status else {
        return JobPhase::NotStarted;
    };
    if has_condition(status, "Complete") || status.succeeded.unwrap_or(0) > 0 {
        JobPhase::Succeeded
    } else if has_condition(status, "Failed") {
        JobPhase::Failed
    } else if status.active.unwrap_or(0) > 0 {
        JobPhase::Running
    } else if status.start_time.is_none() {
        JobPhase::NotStarted
    } else {
        JobPhase::Unknown("job started but has no active pods".to_string())
    }
}

fn from_job(job: &Job) -> Result<ExecutionJob> {
    let meta = derived_meta(&job.metadata);
    let stage = meta
        .labels
        .get(JOB_TYPE_LABEL)
        .and_then(|s| StageKind::parse(s))
        .ok_or_else(|| {
            Error::Internal(format!("job {} has no valid {} label", meta.name, JOB_TYPE_LABEL))
        })?;

    let spec = job.spec.as_ref();
    let pod = spec.and_then(|s| s.template.spec.as_ref());
    let container = pod.and_then(|p| p.containers.first());

    let volumes = container
        .and_then(|c| c.volume_mounts.as_ref())
        .map(|mounts| {
            mounts
                .iter()
                .filter_map(|m| {
                    let volume = pod?.volumes.as_ref()?.iter().find(|v| v.name == m.name)?;
                    let source = if let Some(secret) = &volume.secret {
                        VolumeSource::Secret(secret.secret_name.clone()?)
                    } else {
                        VolumeSource::ConfigMap(volume.config_map.as_ref()?.name.clone()?)
                    };
                    Some(JobVolume {
                        name: m.name.clone(),
                        source,
                        mount_path: m.mount_path.clone(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let status = job.status.as_ref();
    Ok(ExecutionJob {
        meta,
        stage,
        template: JobTemplate {
            image: container.and_then(|c| c.image.clone()).unwrap_or_default(),
            args: container.and_then(|c| c.args.clone()).unwrap_or_default(),
            volumes,
            backoff_limit: spec.and_then(|s| s.backoff_limit).unwrap_or_default(),
        },
        phase: job_phase(status),
        completed_at: status.and_then(|s| {
            s.completion_time
                .as_ref()
                .map(|t| t.0)
                .or_else(|| condition_time(s, "Failed"))
        }),
    })
}

#[async_trait]
impl ObjectStore<ExecutionJob> for KubeCluster {
    async fn list(
        &self,
        namespace: Option<&str>,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<ExecutionJob>> {
        let api: Api<Job> = self.api(namespace);
        let jobs = api.list(&list_params(selector)).await?;
        jobs.items.iter().map(from_job).collect()
    }

    /// Jobs are created once; a job whose template drifted is deleted by the
    /// stage and recreated on a later pass
    #[instrument(skip_all, fields(job = %object.name(), namespace = %object.namespace()))]
    async fn apply(&self, object: &ExecutionJob) -> Result<ApplyOutcome> {
        let api: Api<Job> = self.api(Some(object.namespace()));

        if let Some(existing) = api.get_opt(object.name()).await? {
            let existing = from_job(&existing)?;
            if existing.desired_hash() == object.desired_hash() {
                return Ok(ApplyOutcome::Unchanged);
            }
            return Err(Error::Conflict {
                kind: ExecutionJob::KIND.to_string(),
                name: object.name().to_string(),
            });
        }

        api.create(&PostParams::default(), &to_job(object))
            .await
            .map_err(|e| map_kube_error(ExecutionJob::KIND, object.name(), e))?;
        debug!(stage = %object.stage, "Created job");
        Ok(ApplyOutcome::Created)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Job> = self.api(Some(namespace));
        delete_object(&api, ExecutionJob::KIND, name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DerivedMeta;
    use crate::labels::kernel_labels;
    use k8s_openapi::api::batch::v1::JobCondition;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn build_job() -> ExecutionJob {
        let mut labels = kernel_labels("kmod", "5.14.0-1");
        labels.insert(JOB_TYPE_LABEL.to_string(), "build".to_string());
        ExecutionJob {
            meta: DerivedMeta::new("kmod-build-abc", "drivers", labels).with_hash("h1"),
            stage: StageKind::Build,
            template: JobTemplate {
                image: "gcr.io/kaniko-project/executor:latest".into(),
                args: vec!["--destination=quay.io/acme/kmod:5.14.0-1".into()],
                volumes: vec![
                    JobVolume {
                        name: "dockerfile".into(),
                        source: VolumeSource::ConfigMap("kmod-dockerfile".into()),
                        mount_path: "/workspace".into(),
                    },
                    JobVolume {
                        name: "secret-token".into(),
                        source: VolumeSource::Secret("token".into()),
                        mount_path: "/run/secrets/token".into(),
                    },
                ],
                backoff_limit: 3,
            },
            phase: JobPhase::NotStarted,
            completed_at: None,
        }
    }

    #[test]
    fn test_job_rendering() {
        let job = to_job(&build_job());
        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(3));

        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod.containers[0].name, "build");
        assert_eq!(pod.volumes.unwrap().len(), 2);
    }

    #[test]
    fn test_job_read_back() {
        let original = build_job();
        let back = from_job(&to_job(&original)).unwrap();
        assert_eq!(back.stage, StageKind::Build);
        assert_eq!(back.template, original.template);
        assert_eq!(back.desired_hash(), Some("h1"));
        assert_eq!(back.phase, JobPhase::NotStarted);
    }

    #[test]
    fn test_job_without_stage_label_is_rejected() {
        let mut job = to_job(&build_job());
        job.metadata.labels.as_mut().unwrap().remove(JOB_TYPE_LABEL);
        assert!(matches!(from_job(&job), Err(Error::Internal(_))));
    }

    #[test]
    fn test_job_phase_mapping() {
        assert_eq!(job_phase(None), JobPhase::NotStarted);

        let running = JobStatus {
            active: Some(1),
            start_time: Some(Time(Utc::now())),
            ..Default::default()
        };
        assert_eq!(job_phase(Some(&running)), JobPhase::Running);

        let succeeded = JobStatus {
            succeeded: Some(1),
            ..Default::default()
        };
        assert_eq!(job_phase(Some(&succeeded)), JobPhase::Succeeded);

        let failed_at = Utc::now();
        let failed = JobStatus {
            failed: Some(4),
            conditions: Some(vec![JobCondition {
                type_: "Failed".into(),
                status: "True".into(),
                last_transition_time: Some(Time(failed_at)),
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert_eq!(job_phase(Some(&failed)), JobPhase::Failed);
        assert_eq!(condition_time(&failed, "Failed"), Some(failed_at));

        let stalled = JobStatus {
            start_time: Some(Time(Utc::now())),
            ..Default::default()
        };
        assert!(matches!(job_phase(Some(&stalled)), JobPhase::Unknown(_)));
    }
}
