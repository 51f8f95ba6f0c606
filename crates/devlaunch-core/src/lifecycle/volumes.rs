//! Named volumes for the output and synthpop data
//!
//! Volumes are filled from the host directories before the container starts
//! and copied back after it stops, using a small rsync helper image.
//! Population is not atomic: a failed copy can leave a volume empty or
//! partial, so every populated volume is checked before the container runs.

use crate::host::HostShell;
use crate::state::VolumeNames;
use crate::{CoreError, Result};
use devlaunch_config::DockerConfig;
use devlaunch_provider::{sh_quote, DockerCli, MountConfig};

/// Dockerfile of the sync helper, streamed to `docker build -`
pub const HELPER_DOCKERFILE: &str = "FROM alpine:3.20\nRUN apk add --no-cache rsync\n";

const DATA: &str = "/data";
const HOST: &str = "/host";

pub struct VolumeSync<'a> {
    docker: &'a DockerCli,
    shell: &'a HostShell,
    config: &'a DockerConfig,
}

impl<'a> VolumeSync<'a> {
    pub fn new(docker: &'a DockerCli, shell: &'a HostShell, config: &'a DockerConfig) -> Self {
        Self {
            docker,
            shell,
            config,
        }
    }

    /// Build the helper image once
    pub async fn ensure_helper(&self) -> Result<()> {
        let image = &self.config.helper_image;
        let exists = self
            .docker
            .image_exists(image)
            .await
            .map_err(|e| CoreError::docker("checking sync helper image", e))?;
        if !exists {
            tracing::info!("Building sync helper image {}", image);
            self.docker
                .build_from_stdin(image, HELPER_DOCKERFILE)
                .await
                .map_err(|e| CoreError::docker("building sync helper image", e))?;
        }
        Ok(())
    }

    fn owner(&self) -> String {
        format!("{}:{}", self.config.service_uid, self.config.service_gid)
    }

    async fn helper(&self, mounts: &[MountConfig], script: &str) -> Result<()> {
        let mut args = Vec::new();
        for mount in mounts {
            args.push("--mount".to_string());
            args.push(mount.to_arg());
        }
        args.push(self.config.helper_image.clone());
        args.extend(["sh".to_string(), "-c".to_string(), script.to_string()]);
        self.docker.run_once(&args).await?;
        Ok(())
    }

    /// Create both volumes and fill them from their host directories
    pub async fn prepare(&self, names: &VolumeNames, pairs: &[(&str, &str)]) -> Result<()> {
        self.ensure_helper().await?;
        for (volume, host_dir) in pairs {
            self.populate(volume, host_dir)
                .await
                .map_err(|e| CoreError::docker(&format!("preparing volume {}", volume), e))?;
        }
        tracing::debug!("Volumes ready for {}", names.output);
        Ok(())
    }

    /// Create a volume, fix its ownership and copy `host_dir` into it
    pub async fn populate(&self, volume: &str, host_dir: &str) -> Result<()> {
        tracing::info!("Populating volume {} from {}", volume, host_dir);
        self.docker.volume_create(volume).await?;

        let owner = self.owner();
        let script = format!(
            "chown {owner} {data} && rsync -a --chown={owner} {host}/ {data}/",
            owner = owner,
            data = DATA,
            host = HOST
        );
        self.helper(
            &[
                MountConfig::volume(volume, DATA),
                MountConfig::bind(host_dir, HOST).read_only(),
            ],
            &script,
        )
        .await?;

        if !self.shell.dir_is_empty(host_dir).await? && self.volume_is_empty(volume).await? {
            return Err(CoreError::Docker(format!(
                "volume {} is empty after copying from non-empty {}",
                volume, host_dir
            )));
        }
        Ok(())
    }

    async fn volume_is_empty(&self, volume: &str) -> Result<bool> {
        let check = format!("[ -z \"$(ls -A {})\" ]", DATA);
        let mut args = vec![
            "--mount".to_string(),
            MountConfig::volume(volume, DATA).read_only().to_arg(),
            self.config.helper_image.clone(),
        ];
        args.extend(["sh".to_string(), "-c".to_string(), check]);
        match self.docker.run_once(&args).await {
            Ok(_) => Ok(true),
            Err(devlaunch_provider::ProviderError::CommandFailed { status: 1, .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Copy a volume's contents back to `host_dir`
    ///
    /// Returns `false` when the volume no longer exists.
    pub async fn sync_back(&self, volume: &str, host_dir: &str) -> Result<bool> {
        if !self.docker.volume_exists(volume).await? {
            tracing::debug!("Volume {} already gone", volume);
            return Ok(false);
        }
        tracing::info!("Copying volume {} back to {}", volume, host_dir);
        self.shell
            .run_checked(&format!("mkdir -p {}", sh_quote(host_dir)))
            .await?;
        let script = format!("rsync -a {}/ {}/", DATA, HOST);
        self.helper(
            &[
                MountConfig::volume(volume, DATA).read_only(),
                MountConfig::bind(host_dir, HOST),
            ],
            &script,
        )
        .await?;
        Ok(true)
    }

    pub async fn remove(&self, volume: &str) -> Result<bool> {
        Ok(self.docker.volume_remove(volume).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockRunner;
    use devlaunch_provider::{CommandOutput, DockerChannel};
    use std::sync::Arc;

    fn parts(runner: &Arc<MockRunner>) -> (DockerCli, HostShell, DockerConfig) {
        (
            DockerCli::new(runner.clone(), DockerChannel::LocalSocket),
            HostShell::local(runner.clone()),
            DockerConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_helper_built_when_missing() {
        let runner = Arc::new(MockRunner::new());
        runner.on("docker image inspect", CommandOutput::failed(1, "No such image"));
        let (docker, shell, config) = parts(&runner);
        VolumeSync::new(&docker, &shell, &config)
            .ensure_helper()
            .await
            .unwrap();
        let builds = runner.find("docker build -t devlaunch-sync:latest -");
        assert_eq!(builds.len(), 1);
        assert_eq!(
            builds[0].stdin.as_deref(),
            Some(HELPER_DOCKERFILE.as_bytes())
        );
    }

    #[tokio::test]
    async fn test_populate_chowns_then_copies() {
        let runner = Arc::new(MockRunner::new());
        // host dir is empty, so no emptiness check is needed
        let (docker, shell, config) = parts(&runner);
        VolumeSync::new(&docker, &shell, &config)
            .populate("Foo_alice_output", "/data/out")
            .await
            .unwrap();
        let create = runner.position("docker volume create Foo_alice_output").unwrap();
        let copy = runner.position("rsync -a --chown=1000:1000").unwrap();
        assert!(create < copy);
        assert_eq!(runner.count("ls -A /data)"), 0);
    }

    #[tokio::test]
    async fn test_empty_volume_after_populate_is_reported() {
        let runner = Arc::new(MockRunner::new());
        // host directory has content
        runner.on("ls -A /data/out", CommandOutput::failed(1, ""));
        let (docker, shell, config) = parts(&runner);
        let err = VolumeSync::new(&docker, &shell, &config)
            .populate("Foo_alice_output", "/data/out")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Docker);
        assert!(err.to_string().contains("Foo_alice_output"));
    }

    #[tokio::test]
    async fn test_sync_back_skips_missing_volume() {
        let runner = Arc::new(MockRunner::new());
        runner.on("docker volume inspect", CommandOutput::failed(1, "no such volume"));
        let (docker, shell, config) = parts(&runner);
        let synced = VolumeSync::new(&docker, &shell, &config)
            .sync_back("Foo_alice_output", "/data/out")
            .await
            .unwrap();
        assert!(!synced);
        assert_eq!(runner.count("rsync"), 0);
    }
}
