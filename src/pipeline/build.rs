//! Build job template

use crate::config::OperatorConfig;
use crate::domain::{JobTemplate, JobVolume, VolumeSource};
use crate::kernel::{ResolvedBuild, ResolvedMapping};

const WORKSPACE: &str = "/workspace";
const DOCKER_CONFIG: &str = "/kaniko/.docker";

/// Job template building `mapping` and pushing the result to `destination`
pub fn build_job_template(
    mapping: &ResolvedMapping,
    build: &ResolvedBuild,
    destination: &str,
    config: &OperatorConfig,
) -> JobTemplate {
    let kernel = mapping.kernel_version.as_str();
    let mut args = vec![
        format!("--dockerfile={}/dockerfile", WORKSPACE),
        format!("--context=dir://{}", WORKSPACE),
        format!("--destination={}", destination),
        format!("--build-arg=KERNEL_VERSION={}", kernel),
        format!("--build-arg=KERNEL_FULL_VERSION={}", kernel),
        format!("--build-arg=MOD_NAME={}", mapping.module.name),
        format!("--build-arg=MOD_NAMESPACE={}", mapping.module.namespace),
    ];
    args.extend(
        build
            .build_args
            .iter()
            .map(|a| format!("--build-arg={}={}", a.name, a.value)),
    );
    if build.insecure_registry {
        args.push("--insecure".into());
        args.push("--skip-tls-verify".into());
    }

    let mut volumes = vec![JobVolume {
        name: "dockerfile".into(),
        source: VolumeSource::ConfigMap(build.dockerfile_config_map.clone()),
        mount_path: WORKSPACE.into(),
    }];
    volumes.extend(build.secrets.iter().map(|s| JobVolume {
        name: format!("secret-{}", s),
        source: VolumeSource::Secret(s.clone()),
        mount_path: format!("/run/secrets/{}", s),
    }));
    if let Some(secret) = &mapping.image_repo_secret {
        volumes.push(JobVolume {
            name: "docker-config".into(),
            source: VolumeSource::Secret(secret.clone()),
            mount_path: DOCKER_CONFIG.into(),
        });
    }

    JobTemplate {
        image: config.builder_image.clone(),
        args,
        volumes,
        backoff_limit: config.job.backoff_limit,
    }
}
