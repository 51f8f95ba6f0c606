//! Workflow coordinator
//!
//! Owns the [`SessionState`] and runs the phases against it in order:
//! connect, select a repository, refresh status, start, stop and change
//! detection. Each phase borrows the state, and the coordinator applies the
//! fragment it returns. Any phase failure is tagged with its [`Phase`] and
//! ends the workflow.

use crate::connectivity::{Connectivity, ConnectivityResolver};
use crate::git::{GitChangeDetector, GitOutcome};
use crate::host::{posix_join, HostShell};
use crate::interaction::Interaction;
use crate::lifecycle::{LifecycleController, StartOutcome, StopOutcome};
use crate::metadata::MetadataStore;
use crate::state::{
    validate_repo_name, ActiveSnapshot, LifecycleState, Location, SessionState, VolumeNames,
};
use crate::status::{StatusReport, StatusService};
use crate::{CoreError, Phase, Result};
use devlaunch_config::GlobalConfig;
use devlaunch_provider::{CommandRunner, DockerCli, SshTarget};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Everything a workflow needs that is not session state
#[derive(Clone)]
pub struct WorkflowContext {
    pub config: GlobalConfig,
    pub runner: Arc<dyn CommandRunner>,
    /// Local directory for session records in local mode
    pub data_dir: PathBuf,
    pub debug: bool,
}

impl WorkflowContext {
    pub fn new(config: GlobalConfig, runner: Arc<dyn CommandRunner>, data_dir: PathBuf) -> Self {
        let debug = config.defaults.debug;
        Self {
            config,
            runner,
            data_dir,
            debug,
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug |= debug;
        self
    }
}

/// Handles that exist once connectivity is resolved
struct Session {
    docker: DockerCli,
    shell: HostShell,
    store: MetadataStore,
}

/// What a stop did, including the change detection that followed it
#[derive(Debug)]
pub struct StopReport {
    pub container: String,
    pub stop: StopOutcome,
    pub git: Option<GitOutcome>,
}

pub struct Workflow {
    ctx: WorkflowContext,
    interaction: Arc<dyn Interaction>,
    state: SessionState,
    session: Option<Session>,
}

impl Workflow {
    pub fn new(
        ctx: WorkflowContext,
        interaction: Arc<dyn Interaction>,
        username: &str,
        location: Location,
    ) -> Result<Self> {
        let mut state = SessionState::new(&ctx.config, username, location)?;
        state.flags.debug |= ctx.debug;
        Ok(Self {
            ctx,
            interaction,
            state,
            session: None,
        })
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Mutable access for request options (flags, requested port, remote user)
    pub fn state_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }

    pub fn config(&self) -> &GlobalConfig {
        &self.ctx.config
    }

    fn session(&self) -> Result<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| CoreError::Validation("not connected to a Docker engine".to_string()))
    }

    /// Resolve the docker channel and everything that depends on the engine host
    pub async fn connect(&mut self) -> Result<Connectivity> {
        let resolver = ConnectivityResolver::new(&self.ctx.config, self.ctx.runner.clone());
        let connectivity = resolver
            .resolve(&self.state, self.interaction.as_ref())
            .await
            .map_err(|e| e.in_phase(Phase::Connect))?;

        let shell = match &self.state.location {
            Location::Local => HostShell::local(self.ctx.runner.clone()),
            Location::Remote { host } => {
                let target = SshTarget::new(
                    &self.state.identity.remote_user,
                    host,
                    &self.state.paths.private_key,
                )
                .with_connect_timeout(Duration::from_secs(self.ctx.config.ssh.connect_timeout_secs));
                HostShell::remote(self.ctx.runner.clone(), target)
            }
        };
        let store = match connectivity.remote_home.as_deref() {
            Some(home) => MetadataStore::remote(shell.clone(), home, &self.ctx.config.remote.state_dir),
            None => MetadataStore::local(self.ctx.data_dir.join("sessions")),
        };

        let paths = &mut self.state.paths;
        if self.state.location.is_remote() {
            paths.remote_repo_base = Some(connectivity.repo_base.clone());
        }
        paths.remote_home = connectivity.remote_home.clone();
        paths.engine_key = connectivity.engine_key.clone();
        paths.engine_known_hosts = connectivity.engine_known_hosts.clone();
        self.state.repositories = connectivity.repositories.clone();
        self.state.flags.direct_ssh = connectivity.channel.is_direct_ssh();
        self.state.channel = Some(connectivity.channel.clone());

        tracing::info!("Connected via {}", connectivity.channel);
        self.session = Some(Session {
            docker: DockerCli::new(self.ctx.runner.clone(), connectivity.channel.clone()),
            shell,
            store,
        });
        Ok(connectivity)
    }

    /// Choose the repository this session works on
    pub fn select_repo(&mut self, repo: &str) -> Result<()> {
        validate_repo_name(repo)?;
        if !self.state.repositories.is_empty() && !self.state.repositories.iter().any(|r| r == repo) {
            return Err(CoreError::Validation(format!(
                "repository {} not found (available: {})",
                repo,
                self.state.repositories.join(", ")
            )));
        }
        let base = match &self.state.location {
            Location::Local => self.state.paths.local_repo_base.to_string_lossy().to_string(),
            Location::Remote { .. } => self
                .state
                .paths
                .remote_repo_base
                .clone()
                .ok_or_else(|| CoreError::Validation("remote repository base unknown".to_string()))?,
        };
        self.state.paths.repo_root = Some(posix_join(&base, repo));
        self.state.repo = Some(repo.to_string());
        Ok(())
    }

    /// Look at the engine and adopt this session's container if it is running
    pub async fn refresh_status(&mut self) -> Result<StatusReport> {
        let session = self.session()?;
        let report = StatusService::new(&self.ctx.config, &session.docker, &session.store)
            .reconcile(&self.state)
            .await
            .map_err(|e| e.in_phase(Phase::Status))?;

        let own = report.own.as_ref().map(|c| c.name.as_str());
        self.state.ports.used = report
            .containers
            .iter()
            .filter(|c| c.is_running() && Some(c.name.as_str()) != own)
            .flat_map(|c| c.host_ports())
            .collect();

        let facts = &mut self.state.metadata;
        facts.containers = report.containers.clone();
        facts.user_containers = report.user_containers.clone();
        facts.running = report.running;
        facts.recovered = report.recovered.clone();

        if report.running {
            // Started by another process
            facts.lifecycle = LifecycleState::Running;
            if facts.recovered.use_volumes == Some(true) {
                if let Some(name) = own {
                    facts.volumes = Some(VolumeNames::for_container(name));
                }
            }
            if self.state.identity.password.is_none() {
                self.state.identity.password = report.recovered.password.clone();
            }
            if let Some(port) = report.recovered.port {
                self.state.ports.assigned = Some(port);
            }
        } else if facts.lifecycle == LifecycleState::Running {
            tracing::warn!("Container is no longer running");
            facts.lifecycle = LifecycleState::Stopped;
            facts.active = None;
            self.state.flags.relaunch_guard = false;
        }
        Ok(report)
    }

    /// Build if needed and start the container
    pub async fn start(&mut self) -> Result<StartOutcome> {
        self.refresh_status().await?;
        let container = self.state.container_name()?;

        let missing = self.state.identity.password.as_deref().map_or(true, str::is_empty);
        if missing && !self.state.metadata.running {
            let password = self
                .interaction
                .session_password(&container)?
                .filter(|p| !p.is_empty())
                .ok_or_else(|| {
                    CoreError::Validation("a session password is required".to_string())
                        .in_phase(Phase::Start)
                })?;
            self.state.identity.password = Some(password);
        }

        let session = self
            .session
            .as_ref()
            .ok_or_else(|| CoreError::Validation("not connected to a Docker engine".to_string()))?;
        let outcome = LifecycleController::new(
            &self.ctx.config,
            &session.docker,
            &session.shell,
            &session.store,
        )
        .start(&mut self.state)
        .await
        .map_err(|e| e.in_phase(Phase::Start))?;

        let facts = &mut self.state.metadata;
        facts.running = true;
        facts.build = Some(outcome.build.clone());
        facts.active = Some(outcome.snapshot.clone());
        facts.volumes = outcome.volumes.clone();
        facts.baseline = outcome.baseline.clone();
        self.state.flags.relaunch_guard = true;
        self.state.ports.assigned = Some(outcome.port);
        self.state.paths.output_dir = outcome.snapshot.output_dir.clone();
        self.state.paths.synthpop_dir = outcome.snapshot.synthpop_dir.clone();

        tracing::info!("{} running on port {}", container, outcome.port);
        Ok(outcome)
    }

    /// Values captured at start, or recovered when this process did not start it
    async fn stop_snapshot(&self, container: &str) -> Result<ActiveSnapshot> {
        if let Some(active) = &self.state.metadata.active {
            return Ok(active.clone());
        }
        let session = self.session()?;
        let mut warnings = Vec::new();
        let recovered = StatusService::new(&self.ctx.config, &session.docker, &session.store)
            .recover(container, &mut warnings)
            .await;
        let repo_path = self.state.repo_root()?.to_string();
        let use_volumes = match recovered.use_volumes {
            Some(flag) => flag,
            None => leftover_volumes(&session.docker, container, &mut warnings).await,
        };

        let (output_dir, synthpop_dir) = if use_volumes {
            let dirs = LifecycleController::new(
                &self.ctx.config,
                &session.docker,
                &session.shell,
                &session.store,
            )
            .resolve_data_dirs(&repo_path, &mut warnings)
            .await;
            (dirs.output, dirs.synthpop)
        } else {
            (None, None)
        };
        for warning in &warnings {
            tracing::warn!("{}", warning);
        }

        Ok(ActiveSnapshot {
            port: recovered
                .port
                .or(self.state.ports.assigned)
                .unwrap_or_default(),
            use_volumes,
            repo_path,
            location: self.state.location.clone(),
            output_dir,
            synthpop_dir,
        })
    }

    /// Stop the container, then optionally look for uncommitted changes
    ///
    /// Change detection runs even when a stop step failed; the stop failure
    /// is still returned.
    pub async fn stop(&mut self, detect_changes: bool) -> Result<StopReport> {
        let container = self.state.container_name()?;
        let snapshot = self
            .stop_snapshot(&container)
            .await
            .map_err(|e| e.in_phase(Phase::Stop))?;

        let facts = &mut self.state.metadata;
        if facts.lifecycle.can_transition_to(LifecycleState::Stopping) {
            facts.lifecycle = LifecycleState::Stopping;
        }

        let session = self.session()?;
        let stop = LifecycleController::new(
            &self.ctx.config,
            &session.docker,
            &session.shell,
            &session.store,
        )
        .stop(&container, Some(&snapshot))
        .await;

        let facts = &mut self.state.metadata;
        if facts.lifecycle == LifecycleState::Stopping {
            facts.lifecycle = LifecycleState::Stopped;
        }
        facts.running = false;
        facts.active = None;
        facts.volumes = None;
        facts.recovered = Default::default();
        self.state.flags.relaunch_guard = false;
        self.state.ports.assigned = None;

        let git = if detect_changes {
            match self.detect_changes_in(&snapshot.repo_path).await {
                Ok(outcome) => Some(outcome),
                Err(e) if !stop.is_clean() => {
                    tracing::error!("Change detection failed: {}", e);
                    None
                }
                Err(e) => return Err(e.in_phase(Phase::Git)),
            }
        } else {
            None
        };

        let stop = stop.into_result().map_err(|e| e.in_phase(Phase::Stop))?;
        Ok(StopReport {
            container,
            stop,
            git,
        })
    }

    /// Look for uncommitted changes in the selected repository
    pub async fn detect_changes(&self) -> Result<GitOutcome> {
        let repo = self.state.repo_root()?.to_string();
        self.detect_changes_in(&repo)
            .await
            .map_err(|e| e.in_phase(Phase::Git))
    }

    async fn detect_changes_in(&self, repo: &str) -> Result<GitOutcome> {
        let session = self.session()?;
        GitChangeDetector::new(
            session.shell.clone(),
            self.state.paths.engine_key.clone(),
            self.state.paths.engine_known_hosts.clone(),
        )
        .detect(
            repo,
            self.state.metadata.baseline.as_ref(),
            self.interaction.as_ref(),
        )
        .await
    }
}

/// Whether this container's volumes exist even though no record says it used them
///
/// They are then copied back like any other session volumes.
async fn leftover_volumes(docker: &DockerCli, container: &str, warnings: &mut Vec<String>) -> bool {
    let names = VolumeNames::for_container(container);
    let mut found = Vec::new();
    for volume in [&names.output, &names.synthpop] {
        match docker.volume_exists(volume).await {
            Ok(true) => found.push(volume.as_str()),
            Ok(false) => {}
            Err(e) => warnings.push(format!("could not inspect volume {}: {}", volume, e)),
        }
    }
    if found.is_empty() {
        return false;
    }
    warnings.push(format!(
        "no session record for {}, copying back leftover volumes {}",
        container,
        found.join(", ")
    ));
    true
}
