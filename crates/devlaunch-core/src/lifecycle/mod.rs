//! Container lifecycle: build, start and stop
//!
//! Start validates the request, ensures the image, prepares volumes, runs
//! the container and records the session. Stop tears everything down in a
//! fixed order, attempting every step even when an earlier one failed.

mod build;
mod volumes;

pub use build::*;
pub use volumes::*;

use crate::git::GitChangeDetector;
use crate::host::{posix_join, HostShell};
use crate::metadata::{MetadataRecord, MetadataStore};
use crate::state::{ActiveSnapshot, BuildInfo, GitBaseline, LifecycleState, SessionState, VolumeNames};
use crate::{CoreError, Result};
use chrono::Utc;
use devlaunch_config::{config_value_from_str, GlobalConfig};
use devlaunch_provider::{sh_quote, DockerCli, MountConfig, PortConfig, ProviderError, RunConfig};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;

/// Ports a session may publish
pub const PORT_RANGE: RangeInclusive<u16> = 1024..=65535;

/// What a successful start produced
#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub container_id: String,
    pub port: u16,
    pub build: BuildInfo,
    pub snapshot: ActiveSnapshot,
    pub volumes: Option<VolumeNames>,
    pub baseline: Option<GitBaseline>,
    pub warnings: Vec<String>,
}

/// What a stop did; `errors` lists every step that failed
#[derive(Debug, Clone, Default)]
pub struct StopOutcome {
    /// `false` when the container was already gone
    pub container_stopped: bool,
    pub volumes_synced: Vec<String>,
    pub volumes_removed: Vec<String>,
    /// `false` when there was no record to delete
    pub record_deleted: bool,
    pub errors: Vec<String>,
}

impl StopOutcome {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// All step failures as a single error
    pub fn into_result(self) -> Result<Self> {
        if self.errors.is_empty() {
            Ok(self)
        } else {
            Err(CoreError::Docker(self.errors.join("; ")))
        }
    }
}

/// Output and synthpop directories from the project config
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataDirs {
    pub output: Option<String>,
    pub synthpop: Option<String>,
}

pub struct LifecycleController<'a> {
    config: &'a GlobalConfig,
    docker: &'a DockerCli,
    shell: &'a HostShell,
    store: &'a MetadataStore,
}

impl<'a> LifecycleController<'a> {
    pub fn new(
        config: &'a GlobalConfig,
        docker: &'a DockerCli,
        shell: &'a HostShell,
        store: &'a MetadataStore,
    ) -> Self {
        Self {
            config,
            docker,
            shell,
            store,
        }
    }

    /// Port to publish: fixed locally, requested or default remotely
    pub fn resolve_port(&self, state: &SessionState) -> Result<u16> {
        let port = if state.location.is_remote() {
            state
                .ports
                .requested
                .unwrap_or(self.config.remote.default_port)
        } else {
            if let Some(requested) = state.ports.requested {
                if requested != self.config.local.port {
                    tracing::warn!(
                        "Ignoring requested port {}, local sessions use {}",
                        requested,
                        self.config.local.port
                    );
                }
            }
            self.config.local.port
        };

        if !PORT_RANGE.contains(&port) {
            return Err(CoreError::Validation(format!(
                "port {} is outside {}..={}",
                port,
                PORT_RANGE.start(),
                PORT_RANGE.end()
            )));
        }
        if state.ports.used.contains(&port) {
            return Err(CoreError::Validation(format!(
                "port {} is already used by another container",
                port
            )));
        }
        Ok(port)
    }

    /// Read the output and synthpop directories from the project config
    ///
    /// Relative values resolve against the repository root. A missing config
    /// file or key leaves the directory unset.
    pub async fn resolve_data_dirs(&self, repo_root: &str, warnings: &mut Vec<String>) -> DataDirs {
        let path = posix_join(repo_root, &self.config.project.config_file);
        let content = match self.shell.read_file(&path).await {
            Ok(Some(content)) => content,
            Ok(None) => {
                warnings.push(format!("project config {} not found", path));
                return DataDirs::default();
            }
            Err(e) => {
                warnings.push(format!("could not read project config {}: {}", path, e));
                return DataDirs::default();
            }
        };

        let lookup = |key: &str, warnings: &mut Vec<String>| {
            let value = config_value_from_str(&content, key).map(|v| posix_join(repo_root, &v));
            if value.is_none() {
                warnings.push(format!("{} has no {} entry", path, key));
            }
            value
        };
        DataDirs {
            output: lookup(&self.config.project.output_key, warnings),
            synthpop: lookup(&self.config.project.synthpop_key, warnings),
        }
    }

    /// Assemble the `docker run` invocation
    pub fn run_config(
        &self,
        state: &SessionState,
        image: &str,
        port: u16,
        password: &str,
        dirs: &DataDirs,
        volumes: Option<&VolumeNames>,
    ) -> Result<RunConfig> {
        let docker = &self.config.docker;
        let repo = state
            .repo
            .as_deref()
            .ok_or_else(|| CoreError::Validation("no repository selected".to_string()))?;
        let repo_root = state.repo_root()?;
        let home = format!("/home/{}", docker.service_user);
        let workdir = posix_join(&home, repo);

        let mut env = BTreeMap::new();
        env.insert("USERID".to_string(), docker.service_uid.to_string());
        env.insert("GROUPID".to_string(), docker.service_gid.to_string());

        let mut mounts = vec![MountConfig::bind(repo_root, &workdir)];
        if repo_root != workdir {
            mounts.push(MountConfig::bind(repo_root, repo_root));
        }

        let data = [
            (dirs.output.as_deref(), volumes.map(|v| v.output.as_str())),
            (dirs.synthpop.as_deref(), volumes.map(|v| v.synthpop.as_str())),
        ];
        for (dir, volume) in data {
            let Some(dir) = dir else { continue };
            mounts.push(match volume {
                Some(volume) => MountConfig::volume(volume, dir),
                None => MountConfig::bind(dir, dir),
            });
        }

        let key_target = format!("{}/.ssh/id_ed25519", home);
        let known_hosts_target = format!("{}/.ssh/known_hosts", home);
        if let Some(key) = state.paths.engine_key.as_deref() {
            mounts.push(MountConfig::bind(key, &key_target).read_only());
            let mut git_ssh = format!("ssh -i {} -o IdentitiesOnly=yes", key_target);
            if let Some(known_hosts) = state.paths.engine_known_hosts.as_deref() {
                mounts.push(MountConfig::bind(known_hosts, &known_hosts_target).read_only());
                git_ssh.push_str(&format!(
                    " -o StrictHostKeyChecking=yes -o UserKnownHostsFile={}",
                    known_hosts_target
                ));
            }
            env.insert("GIT_SSH_COMMAND".to_string(), git_ssh);
        }

        let (cpus, memory) = if state.flags.high_compute {
            (
                Some(docker.high_compute_cpus.clone()),
                Some(docker.high_compute_memory.clone()),
            )
        } else {
            (None, None)
        };

        Ok(RunConfig {
            image: image.to_string(),
            name: state.container_name()?,
            env,
            env_passthrough: vec![(docker.password_env.clone(), password.to_string())],
            mounts,
            ports: vec![PortConfig {
                host_port: port,
                container_port: docker.container_port,
            }],
            working_dir: Some(workdir),
            cpus,
            memory,
            auto_remove: true,
        })
    }

    /// Start this session's container
    ///
    /// Moves `state.metadata.lifecycle` through `Building` (only when an
    /// image is built) and `Starting` while the work runs, ending in
    /// `Running`. A failure after leaving the initial state goes back to
    /// `Idle`.
    pub async fn start(&self, state: &mut SessionState) -> Result<StartOutcome> {
        match self.launch(state).await {
            Ok(outcome) => {
                state.metadata.lifecycle = state
                    .metadata
                    .lifecycle
                    .transition(LifecycleState::Running)?;
                Ok(outcome)
            }
            Err(e) => {
                if matches!(
                    state.metadata.lifecycle,
                    LifecycleState::Building | LifecycleState::Starting
                ) {
                    state.metadata.lifecycle = LifecycleState::Idle;
                }
                Err(e)
            }
        }
    }

    async fn launch(&self, state: &mut SessionState) -> Result<StartOutcome> {
        if state.flags.relaunch_guard || state.metadata.running {
            return Err(CoreError::Validation(format!(
                "{} is already running",
                state.container_name()?
            )));
        }
        if !state
            .metadata
            .lifecycle
            .can_transition_to(LifecycleState::Starting)
        {
            return Err(CoreError::Validation(format!(
                "cannot start while {:?}",
                state.metadata.lifecycle
            )));
        }

        let name = state.container_name()?;
        let repo = state
            .repo
            .clone()
            .ok_or_else(|| CoreError::Validation("no repository selected".to_string()))?;
        let repo_root = state.repo_root()?.to_string();
        let port = self.resolve_port(state)?;
        let password = state
            .identity
            .password
            .clone()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| CoreError::Validation("a session password is required".to_string()))?;

        let mut warnings = Vec::new();
        let dirs = self.resolve_data_dirs(&repo_root, &mut warnings).await;
        for dir in [&dirs.output, &dirs.synthpop].into_iter().flatten() {
            self.shell
                .run_checked(&format!("mkdir -p {}", sh_quote(dir)))
                .await
                .map_err(|e| CoreError::docker(&format!("creating {}", dir), e))?;
        }

        let request = BuildRequest::for_repo(
            self.docker.clone(),
            self.shell.clone(),
            &self.config.docker,
            &repo,
            &repo_root,
            state.flags.rebuild,
        );
        let build = if needs_build(&request, state.flags.rebuild).await? {
            state.metadata.lifecycle = state
                .metadata
                .lifecycle
                .transition(LifecycleState::Building)?;
            build_image(&request).await?
        } else {
            BuildInfo {
                image: request.main.tag.clone(),
                built: false,
                strategy: None,
            }
        };
        state.metadata.lifecycle = state
            .metadata
            .lifecycle
            .transition(LifecycleState::Starting)?;

        let volumes = if state.flags.use_volumes {
            let names = VolumeNames::for_container(&name);
            let mut pairs = Vec::new();
            if let Some(dir) = dirs.output.as_deref() {
                pairs.push((names.output.as_str(), dir));
            }
            if let Some(dir) = dirs.synthpop.as_deref() {
                pairs.push((names.synthpop.as_str(), dir));
            }
            VolumeSync::new(self.docker, self.shell, &self.config.docker)
                .prepare(&names, &pairs)
                .await?;
            Some(names)
        } else {
            None
        };

        let run = self.run_config(state, &build.image, port, &password, &dirs, volumes.as_ref())?;
        tracing::info!("Starting {} on port {}", name, port);
        let container_id = match self.docker.run(&run).await {
            Ok(id) => id,
            Err(e) => {
                if let Some(names) = &volumes {
                    self.discard_volumes(names).await;
                }
                return Err(match e {
                    ProviderError::NameConflict(name) => CoreError::ContainerExists(name),
                    other => CoreError::docker(&format!("starting {}", name), other),
                });
            }
        };

        let record = MetadataRecord {
            container: name.clone(),
            repo: repo.clone(),
            user: state.identity.username.clone(),
            password,
            port: port.to_string(),
            use_volumes: volumes.is_some(),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.store.write(&record).await {
            warnings.push(format!("could not write session record: {}", e));
        }

        let baseline = GitChangeDetector::new(self.shell.clone(), None, None)
            .capture_baseline(&repo_root)
            .await;
        if baseline.is_none() {
            warnings.push(format!("no git baseline captured for {}", repo_root));
        }

        for warning in &warnings {
            tracing::warn!("{}", warning);
        }
        Ok(StartOutcome {
            container_id,
            port,
            build,
            snapshot: ActiveSnapshot {
                port,
                use_volumes: volumes.is_some(),
                repo_path: repo_root,
                location: state.location.clone(),
                output_dir: dirs.output,
                synthpop_dir: dirs.synthpop,
            },
            volumes,
            baseline,
            warnings,
        })
    }

    async fn discard_volumes(&self, names: &VolumeNames) {
        for volume in [&names.output, &names.synthpop] {
            if let Err(e) = self.docker.volume_remove(volume).await {
                tracing::warn!("Could not remove volume {}: {}", volume, e);
            }
        }
    }

    /// Stop the container and release everything it held
    ///
    /// Uses the values snapshotted at start, never current selections.
    /// Never returns early: inspect [`StopOutcome::errors`].
    pub async fn stop(&self, container: &str, snapshot: Option<&ActiveSnapshot>) -> StopOutcome {
        let mut outcome = StopOutcome::default();

        tracing::info!("Stopping {}", container);
        match self.docker.stop(container).await {
            Ok(stopped) => outcome.container_stopped = stopped,
            Err(e) => outcome.errors.push(format!("stopping {}: {}", container, e)),
        }

        if let Some(snapshot) = snapshot.filter(|s| s.use_volumes) {
            let names = VolumeNames::for_container(container);
            let sync = VolumeSync::new(self.docker, self.shell, &self.config.docker);
            let pairs = [
                (names.output.as_str(), snapshot.output_dir.as_deref()),
                (names.synthpop.as_str(), snapshot.synthpop_dir.as_deref()),
            ];
            for (volume, dir) in pairs {
                let synced = match dir {
                    Some(dir) => match sync.sync_back(volume, dir).await {
                        Ok(true) => {
                            outcome.volumes_synced.push(volume.to_string());
                            true
                        }
                        Ok(false) => continue,
                        Err(e) => {
                            outcome
                                .errors
                                .push(format!("copying {} back to {}: {}", volume, dir, e));
                            false
                        }
                    },
                    None => {
                        tracing::warn!("No host directory recorded for {}, keeping it", volume);
                        false
                    }
                };
                // A volume whose data could not be copied out is kept
                if !synced {
                    continue;
                }
                match sync.remove(volume).await {
                    Ok(true) => outcome.volumes_removed.push(volume.to_string()),
                    Ok(false) => {}
                    Err(e) => outcome.errors.push(format!("removing {}: {}", volume, e)),
                }
            }
        }

        match self.store.delete(container).await {
            Ok(deleted) => outcome.record_deleted = deleted,
            Err(e) => outcome
                .errors
                .push(format!("deleting session record for {}: {}", container, e)),
        }

        for error in &outcome.errors {
            tracing::error!("{}", error);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Location;
    use crate::test_support::MockRunner;
    use devlaunch_provider::{CommandOutput, DockerChannel};
    use std::sync::Arc;

    struct Fixture {
        runner: Arc<MockRunner>,
        config: GlobalConfig,
        docker: DockerCli,
        shell: HostShell,
        store: MetadataStore,
        _tmp: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let runner = Arc::new(MockRunner::new());
        let tmp = tempfile::tempdir().unwrap();
        Fixture {
            docker: DockerCli::new(runner.clone(), DockerChannel::LocalSocket),
            shell: HostShell::local(runner.clone()),
            store: MetadataStore::local(tmp.path()),
            config: GlobalConfig::default(),
            runner,
            _tmp: tmp,
        }
    }

    fn state(location: Location) -> SessionState {
        let mut state = SessionState::new(&GlobalConfig::default(), "alice", location).unwrap();
        state.repo = Some("Foo".into());
        state.paths.repo_root = Some("/srv/repos/Foo".into());
        state.identity.password = Some("s3cret".into());
        state.paths.engine_key = Some("/srv/keys/id_ed25519_alice".into());
        state.paths.engine_known_hosts = Some("/srv/keys/known_hosts".into());
        state
    }

    fn remote() -> Location {
        Location::Remote {
            host: "10.0.0.5".into(),
        }
    }

    #[test]
    fn test_port_validation() {
        let f = fixture();
        let ctl = LifecycleController::new(&f.config, &f.docker, &f.shell, &f.store);

        let mut s = state(remote());
        assert_eq!(ctl.resolve_port(&s).unwrap(), 8788);
        s.ports.requested = Some(9000);
        assert_eq!(ctl.resolve_port(&s).unwrap(), 9000);
        s.ports.used.insert(9000);
        assert!(ctl.resolve_port(&s).is_err());
        s.ports.requested = Some(80);
        assert!(ctl.resolve_port(&s).is_err());

        let mut s = state(Location::Local);
        s.ports.requested = Some(9000);
        assert_eq!(ctl.resolve_port(&s).unwrap(), 8787);
    }

    #[test]
    fn test_run_config_with_volumes() {
        let f = fixture();
        let ctl = LifecycleController::new(&f.config, &f.docker, &f.shell, &f.store);
        let mut s = state(remote());
        s.flags.high_compute = true;
        let dirs = DataDirs {
            output: Some("/srv/repos/Foo/out".into()),
            synthpop: Some("/data/synthpop".into()),
        };
        let names = VolumeNames::for_container("Foo_alice");
        let run = ctl
            .run_config(&s, "foo", 8788, "s3cret", &dirs, Some(&names))
            .unwrap();

        assert_eq!(run.name, "Foo_alice");
        assert_eq!(run.working_dir.as_deref(), Some("/home/rstudio/Foo"));
        assert_eq!(run.cpus.as_deref(), Some("16"));
        assert_eq!(run.memory.as_deref(), Some("64g"));
        assert_eq!(run.env.get("USERID").map(String::as_str), Some("1000"));
        assert!(run.env["GIT_SSH_COMMAND"].contains("StrictHostKeyChecking=yes"));
        assert_eq!(run.ports[0].host_port, 8788);
        assert_eq!(run.ports[0].container_port, 8787);

        let args = run.to_args();
        assert!(!args.iter().any(|a| a.contains("s3cret")));
        let mounts: Vec<String> = run.mounts.iter().map(MountConfig::to_arg).collect();
        assert!(mounts.contains(&"type=bind,source=/srv/repos/Foo,target=/home/rstudio/Foo".into()));
        assert!(mounts.contains(&"type=bind,source=/srv/repos/Foo,target=/srv/repos/Foo".into()));
        assert!(mounts.contains(&"type=volume,source=Foo_alice_output,target=/srv/repos/Foo/out".into()));
        assert!(mounts.contains(&"type=volume,source=Foo_alice_synthpop,target=/data/synthpop".into()));
        assert!(mounts.contains(
            &"type=bind,source=/srv/keys/id_ed25519_alice,target=/home/rstudio/.ssh/id_ed25519,readonly".into()
        ));
        assert!(mounts.contains(
            &"type=bind,source=/srv/keys/known_hosts,target=/home/rstudio/.ssh/known_hosts,readonly".into()
        ));
    }

    #[test]
    fn test_run_config_binds_without_volumes() {
        let f = fixture();
        let ctl = LifecycleController::new(&f.config, &f.docker, &f.shell, &f.store);
        let dirs = DataDirs {
            output: Some("/out".into()),
            synthpop: None,
        };
        let run = ctl
            .run_config(&state(remote()), "foo", 8788, "pw", &dirs, None)
            .unwrap();
        let mounts: Vec<String> = run.mounts.iter().map(MountConfig::to_arg).collect();
        assert!(mounts.contains(&"type=bind,source=/out,target=/out".into()));
        assert!(run.cpus.is_none());
    }

    #[tokio::test]
    async fn test_data_dirs_resolve_against_repo() {
        let f = fixture();
        f.runner.on(
            "inputs/sim_design.yaml",
            CommandOutput::ok("output_dir: outputs\nsynthpop_dir: \"/data/synthpop\"\n"),
        );
        let ctl = LifecycleController::new(&f.config, &f.docker, &f.shell, &f.store);
        let mut warnings = Vec::new();
        let dirs = ctl.resolve_data_dirs("/srv/repos/Foo", &mut warnings).await;
        assert_eq!(dirs.output.as_deref(), Some("/srv/repos/Foo/outputs"));
        assert_eq!(dirs.synthpop.as_deref(), Some("/data/synthpop"));
        assert!(warnings.is_empty());
    }

    #[tokio::test]
    async fn test_start_refuses_relaunch() {
        let f = fixture();
        let ctl = LifecycleController::new(&f.config, &f.docker, &f.shell, &f.store);
        let mut s = state(remote());
        s.flags.relaunch_guard = true;
        let err = ctl.start(&mut s).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
        assert_eq!(f.runner.count("docker run"), 0);
    }

    #[tokio::test]
    async fn test_name_conflict_is_classified() {
        let f = fixture();
        f.runner.on(
            "docker run -d",
            CommandOutput::failed(
                125,
                "Conflict. The container name \"/Foo_alice\" is already in use by container \"x\"",
            ),
        );
        let ctl = LifecycleController::new(&f.config, &f.docker, &f.shell, &f.store);
        let mut s = state(remote());
        let err = ctl.start(&mut s).await.unwrap_err();
        assert!(matches!(err, CoreError::ContainerExists(_)));
        assert_eq!(s.metadata.lifecycle, LifecycleState::Idle);
        assert_eq!(f.runner.count("docker run -d"), 1);
    }

    #[tokio::test]
    async fn test_start_walks_the_lifecycle() {
        let f = fixture();
        f.runner.on("docker image inspect", CommandOutput::failed(1, "No such image"));
        f.runner.on("docker run -d", CommandOutput::ok("c0ffee\n"));
        let ctl = LifecycleController::new(&f.config, &f.docker, &f.shell, &f.store);
        let mut s = state(remote());
        s.metadata.lifecycle = LifecycleState::Stopped;

        let outcome = ctl.start(&mut s).await.unwrap();
        assert!(outcome.build.built);
        assert_eq!(s.metadata.lifecycle, LifecycleState::Running);
        let build = f.runner.position("docker build").unwrap();
        assert!(build < f.runner.position("docker run").unwrap());
    }

    #[tokio::test]
    async fn test_failed_build_returns_to_idle() {
        let f = fixture();
        f.runner.on("docker image inspect", CommandOutput::failed(1, "No such image"));
        f.runner.on("docker build", CommandOutput::failed(1, "build failed"));
        let ctl = LifecycleController::new(&f.config, &f.docker, &f.shell, &f.store);
        let mut s = state(remote());

        let err = ctl.start(&mut s).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Docker);
        assert_eq!(s.metadata.lifecycle, LifecycleState::Idle);
        assert_eq!(f.runner.count("docker run"), 0);
    }

    #[tokio::test]
    async fn test_start_refused_while_stopping() {
        let f = fixture();
        let ctl = LifecycleController::new(&f.config, &f.docker, &f.shell, &f.store);
        let mut s = state(remote());
        s.metadata.lifecycle = LifecycleState::Stopping;
        let err = ctl.start(&mut s).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
        assert_eq!(s.metadata.lifecycle, LifecycleState::Stopping);
        assert_eq!(f.runner.count("docker image inspect"), 0);
    }

    #[tokio::test]
    async fn test_stop_keeps_volume_when_copy_fails() {
        let f = fixture();
        f.runner.on("rsync -a /data/ /host/", CommandOutput::failed(23, "io error"));
        let ctl = LifecycleController::new(&f.config, &f.docker, &f.shell, &f.store);
        let snapshot = ActiveSnapshot {
            port: 8788,
            use_volumes: true,
            repo_path: "/srv/repos/Foo".into(),
            location: remote(),
            output_dir: Some("/out".into()),
            synthpop_dir: None,
        };
        let outcome = ctl.stop("Foo_alice", Some(&snapshot)).await;
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.volumes_removed.is_empty());
        assert_eq!(f.runner.count("docker volume rm"), 0);
        assert!(f.runner.position("docker stop Foo_alice").unwrap() < f.runner.position("rsync").unwrap());
        assert!(!outcome.record_deleted);
        assert!(outcome.into_result().is_err());
    }
}
