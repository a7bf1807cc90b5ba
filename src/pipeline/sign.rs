//! Sign job template

use crate::config::OperatorConfig;
use crate::domain::{JobTemplate, JobVolume, VolumeSource};
use crate::kernel::{ResolvedMapping, ResolvedSign};

const KEY_DIR: &str = "/run/secrets/key";
const CERT_DIR: &str = "/run/secrets/cert";

/// Job template signing the files of `unsigned_image` into `destination`
pub fn sign_job_template(
    mapping: &ResolvedMapping,
    sign: &ResolvedSign,
    unsigned_image: &str,
    destination: &str,
    config: &OperatorConfig,
) -> JobTemplate {
    let args = vec![
        "-unsignedimage".to_string(),
        unsigned_image.to_string(),
        "-signedimage".to_string(),
        destination.to_string(),
        "-filestosign".to_string(),
        sign.files_to_sign.join(":"),
        "-key".to_string(),
        format!("{}/key", KEY_DIR),
        "-cert".to_string(),
        format!("{}/cert", CERT_DIR),
    ];

    let mut volumes = vec![
        JobVolume {
            name: "signing-key".into(),
            source: VolumeSource::Secret(sign.key_secret.clone()),
            mount_path: KEY_DIR.into(),
        },
        JobVolume {
            name: "signing-cert".into(),
            source: VolumeSource::Secret(sign.cert_secret.clone()),
            mount_path: CERT_DIR.into(),
        },
    ];
    if let Some(secret) = &mapping.image_repo_secret {
        volumes.push(JobVolume {
            name: "docker-config".into(),
            source: VolumeSource::Secret(secret.clone()),
            mount_path: "/docker_config".into(),
        });
    }

    JobTemplate {
        image: config.signer_image.clone(),
        args,
        volumes,
        backoff_limit: config.job.backoff_limit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ModuleRef;
    use crate::kernel::KernelVersion;

    #[test]
    fn test_sign_template() {
        let sign = ResolvedSign {
            key_secret: "signing-key".into(),
            cert_secret: "signing-cert".into(),
            files_to_sign: vec!["/opt/a.ko".into(), "/opt/b.ko".into()],
            unsigned_image: Some("registry.local/kmod:unsigned".into()),
        };
        let mapping = ResolvedMapping {
            module: ModuleRef::new("kmod", "drivers"),
            kernel_version: KernelVersion::normalize("5.14.0-1"),
            container_image: "registry.local/kmod:signed".into(),
            image_repo_secret: None,
            build: None,
            sign: Some(sign.clone()),
        };
        let config = OperatorConfig::default();

        let template = sign_job_template(
            &mapping,
            &sign,
            "registry.local/kmod:unsigned",
            "registry.local/kmod:signed",
            &config,
        );

        assert_eq!(template.image, config.signer_image);
        assert_eq!(template.args[1], "registry.local/kmod:unsigned");
        assert_eq!(template.args[3], "registry.local/kmod:signed");
        assert_eq!(template.args[5], "/opt/a.ko:/opt/b.ko");
        assert_eq!(template.volumes.len(), 2);
    }
}
