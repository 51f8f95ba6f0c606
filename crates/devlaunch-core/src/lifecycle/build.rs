//! Image build with a prerequisite fallback
//!
//! The main definition is built first. If that fails, the prerequisite
//! definition is built and the main one is retried exactly once.

use crate::chain::{Attempt, FallbackChain, Strategy};
use crate::host::{posix_join, HostShell};
use crate::state::BuildInfo;
use crate::{CoreError, Result};
use async_trait::async_trait;
use devlaunch_config::DockerConfig;
use devlaunch_provider::{build_args, sh_quote, BuildConfig, DockerCli};

/// Image tag for a repository: lower-cased name plus the configured suffix
pub fn image_name(repo: &str, suffix: &str) -> String {
    format!("{}{}", repo.to_lowercase(), suffix)
}

pub fn prerequisite_image_name(image: &str) -> String {
    match image.split_once(':') {
        Some((name, tag)) => format!("{}-prerequisite:{}", name, tag),
        None => format!("{}-prerequisite", image),
    }
}

/// Both build definitions for one repository
pub struct BuildRequest {
    pub docker: DockerCli,
    /// Runs builds on the engine's host when the repository lives there
    pub shell: HostShell,
    pub main: BuildConfig,
    pub prerequisite: BuildConfig,
}

impl BuildRequest {
    pub fn for_repo(
        docker: DockerCli,
        shell: HostShell,
        config: &DockerConfig,
        repo: &str,
        repo_root: &str,
        no_cache: bool,
    ) -> Self {
        let context = posix_join(repo_root, &config.build_dir);
        let image = image_name(repo, &config.image_suffix);
        Self {
            docker,
            shell,
            main: BuildConfig {
                context: context.clone(),
                dockerfile: posix_join(&context, &config.dockerfile),
                tag: image.clone(),
                no_cache,
                ..Default::default()
            },
            prerequisite: BuildConfig {
                context: context.clone(),
                dockerfile: posix_join(&context, &config.prerequisite_dockerfile),
                tag: prerequisite_image_name(&image),
                no_cache,
                ..Default::default()
            },
        }
    }

    /// Build one definition, client-side locally, host-side for remote repositories
    async fn build(&self, config: &BuildConfig) -> std::result::Result<(), String> {
        tracing::info!("Building {} from {}", config.tag, config.dockerfile);
        if self.shell.is_remote() {
            let script = std::iter::once("docker".to_string())
                .chain(build_args(config))
                .map(|w| sh_quote(&w))
                .collect::<Vec<_>>()
                .join(" ");
            match self.shell.run(&script).await {
                Ok(out) if out.success() => Ok(()),
                Ok(out) => Err(format!("exit {}: {}", out.status, tail(&out.combined()))),
                Err(e) => Err(e.to_string()),
            }
        } else {
            self.docker.build(config).await.map_err(|e| e.to_string())
        }
    }
}

fn tail(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(20)..].join("\n")
}

/// Build the main definition
pub struct BuildMain;

#[async_trait]
impl Strategy<BuildRequest, ()> for BuildMain {
    fn name(&self) -> &'static str {
        "main build"
    }

    async fn attempt(&self, req: &BuildRequest) -> Attempt<()> {
        match req.build(&req.main).await {
            Ok(()) => Attempt::Done(()),
            Err(e) => Attempt::Failed(e),
        }
    }
}

/// Build the prerequisite definition, then the main one again
pub struct BuildPrerequisiteThenMain;

#[async_trait]
impl Strategy<BuildRequest, ()> for BuildPrerequisiteThenMain {
    fn name(&self) -> &'static str {
        "prerequisite then main build"
    }

    async fn attempt(&self, req: &BuildRequest) -> Attempt<()> {
        let check = format!("[ -f {} ]", sh_quote(&req.prerequisite.dockerfile));
        match req.shell.run(&check).await {
            Ok(out) if !out.success() => {
                return Attempt::Unavailable(format!(
                    "{} does not exist",
                    req.prerequisite.dockerfile
                ));
            }
            Err(e) => return Attempt::Failed(e.to_string()),
            Ok(_) => {}
        }
        if let Err(e) = req.build(&req.prerequisite).await {
            return Attempt::Failed(format!("prerequisite: {}", e));
        }
        match req.build(&req.main).await {
            Ok(()) => Attempt::Done(()),
            Err(e) => Attempt::Failed(e),
        }
    }
}

pub fn build_chain() -> FallbackChain<BuildRequest, ()> {
    FallbackChain::new("image build")
        .with(BuildMain)
        .with(BuildPrerequisiteThenMain)
}

/// Whether the image has to be built: it is missing or a rebuild was asked for
pub async fn needs_build(request: &BuildRequest, rebuild: bool) -> Result<bool> {
    if rebuild {
        return Ok(true);
    }
    let image = &request.main.tag;
    let exists = request
        .docker
        .image_exists(image)
        .await
        .map_err(|e| CoreError::docker("checking image", e))?;
    if exists {
        tracing::debug!("Image {} already present", image);
    }
    Ok(!exists)
}

/// Run the build chain for the main image
pub async fn build_image(request: &BuildRequest) -> Result<BuildInfo> {
    let image = request.main.tag.clone();
    let ok = build_chain()
        .run(request)
        .await
        .map_err(|e| CoreError::docker(&format!("building {}", image), e))?;
    tracing::info!("Built {} ({})", image, ok.strategy);
    Ok(BuildInfo {
        image,
        built: true,
        strategy: Some(ok.strategy.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockRunner;
    use devlaunch_provider::{CommandOutput, DockerChannel};
    use std::sync::Arc;

    fn request(runner: Arc<MockRunner>) -> BuildRequest {
        BuildRequest::for_repo(
            DockerCli::new(runner.clone(), DockerChannel::LocalSocket),
            HostShell::local(runner),
            &DockerConfig::default(),
            "Foo",
            "/repos/Foo",
            false,
        )
    }

    #[test]
    fn test_image_names() {
        assert_eq!(image_name("Foo", ""), "foo");
        assert_eq!(image_name("Foo", ":dev"), "foo:dev");
        assert_eq!(prerequisite_image_name("foo"), "foo-prerequisite");
        assert_eq!(prerequisite_image_name("foo:dev"), "foo-prerequisite:dev");
    }

    #[tokio::test]
    async fn test_existing_image_is_not_rebuilt() {
        let runner = Arc::new(MockRunner::new());
        assert!(!needs_build(&request(runner.clone()), false).await.unwrap());
        assert_eq!(runner.count("docker image inspect"), 1);

        runner.on("docker image inspect", CommandOutput::failed(1, "No such image"));
        assert!(needs_build(&request(runner.clone()), false).await.unwrap());
    }

    #[tokio::test]
    async fn test_prerequisite_fallback_succeeds() {
        let runner = Arc::new(MockRunner::new());
        runner.on("docker image inspect", CommandOutput::failed(1, "No such image"));
        runner.once("-t foo /repos", CommandOutput::failed(1, "base image missing"));
        let req = request(runner.clone());
        assert!(needs_build(&req, false).await.unwrap());
        let info = build_image(&req).await.unwrap();
        assert!(info.built);
        assert_eq!(info.strategy.as_deref(), Some("prerequisite then main build"));
        assert_eq!(runner.count("Dockerfile.prerequisite -t foo-prerequisite"), 1);
        assert_eq!(runner.count("-t foo /repos"), 2);
    }

    #[tokio::test]
    async fn test_rebuild_skips_existence_check() {
        let runner = Arc::new(MockRunner::new());
        assert!(needs_build(&request(runner.clone()), true).await.unwrap());
        assert_eq!(runner.count("docker image inspect"), 0);
    }
}
