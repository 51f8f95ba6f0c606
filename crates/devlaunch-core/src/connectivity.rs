//! Connectivity resolution
//!
//! Produces the [`DockerChannel`] every later docker call goes through.
//!
//! Local mode makes sure the engine is up (starting it if needed) and binds
//! a named context to the local socket. Remote mode makes sure the session
//! key authenticates (bootstrapping it with a one-time password when it does
//! not), syncs the key and the git host's `known_hosts` entry to the remote
//! host, lists the remote repositories and binds a context to
//! `ssh://user@host`, falling back to a `DOCKER_HOST` override. Either way
//! docker's ssh transport gets the session key from a [`SessionAgent`].
//!
//! Only the final readiness check of the chosen channel is fatal among the
//! best-effort steps.

use crate::host::{posix_join, HostShell};
use crate::interaction::Interaction;
use crate::ssh::{bootstrap_chain, BootstrapRequest, KeyPair, SessionAgent};
use crate::state::{key_file_name, Location, SessionState};
use crate::{CoreError, Result};
use devlaunch_config::{DockerConfig, GlobalConfig};
use devlaunch_provider::{CommandRunner, CommandSpec, DockerChannel, DockerCli, SshTarget};
use std::sync::Arc;
use std::time::Duration;

/// Result of the connectivity phase
#[derive(Debug, Clone)]
pub struct Connectivity {
    pub channel: DockerChannel,
    /// Repository base on the engine's host, absolute
    pub repo_base: String,
    pub repositories: Vec<String>,
    pub remote_home: Option<String>,
    /// Private key path on the engine's host
    pub engine_key: Option<String>,
    pub engine_known_hosts: Option<String>,
    /// Whether the password bootstrap had to run
    pub bootstrapped: bool,
    pub warnings: Vec<String>,
}

pub struct ConnectivityResolver<'a> {
    config: &'a GlobalConfig,
    runner: Arc<dyn CommandRunner>,
}

impl<'a> ConnectivityResolver<'a> {
    pub fn new(config: &'a GlobalConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    pub async fn resolve(
        &self,
        state: &SessionState,
        interaction: &dyn Interaction,
    ) -> Result<Connectivity> {
        self.check_prerequisites(&state.location)?;
        match &state.location {
            Location::Local => self.resolve_local(state).await,
            Location::Remote { host } => self.resolve_remote(state, host, interaction).await,
        }
    }

    /// Tools that must exist before anything else is attempted
    pub fn check_prerequisites(&self, location: &Location) -> Result<()> {
        let required: &[&str] = match location {
            Location::Local => &["docker"],
            Location::Remote { .. } => &["docker", "ssh"],
        };
        for tool in required {
            if !self.runner.is_available(tool) {
                return Err(CoreError::FatalPrerequisite(format!(
                    "`{}` was not found on PATH",
                    tool
                )));
            }
        }
        Ok(())
    }

    async fn resolve_local(&self, state: &SessionState) -> Result<Connectivity> {
        let mut warnings = Vec::new();

        let keys = KeyPair::new(&state.paths.private_key, &state.paths.public_key);
        if let Err(e) = keys
            .ensure_exists(self.runner.as_ref(), &state.identity.username)
            .await
        {
            warnings.push(format!("could not prepare SSH key: {}", e));
        }

        let socket = DockerCli::new(self.runner.clone(), DockerChannel::LocalSocket);
        if let Err(e) = socket.ping().await {
            tracing::info!("Docker engine is not answering ({}), starting it", e);
            self.start_local_engine(&mut warnings).await;
            wait_for_engine(&socket, &self.config.docker).await?;
        }

        let channel = self.select_local_channel(&mut warnings).await;

        let shell = HostShell::local(self.runner.clone());
        let repo_base = state.paths.local_repo_base.to_string_lossy().to_string();
        let repositories = shell.list_dirs(&repo_base).await.unwrap_or_else(|e| {
            warnings.push(format!("could not list repositories in {}: {}", repo_base, e));
            Vec::new()
        });

        let engine_key = state
            .paths
            .private_key
            .exists()
            .then(|| state.paths.private_key.to_string_lossy().to_string());
        let engine_known_hosts = state
            .paths
            .known_hosts
            .exists()
            .then(|| state.paths.known_hosts.to_string_lossy().to_string());
        if engine_known_hosts.is_none() {
            warnings.push(format!(
                "{:?} does not exist, git inside the container cannot verify host keys",
                state.paths.known_hosts
            ));
        }

        log_warnings(&warnings);
        Ok(Connectivity {
            channel,
            repo_base,
            repositories,
            remote_home: None,
            engine_key,
            engine_known_hosts,
            bootstrapped: false,
            warnings,
        })
    }

    async fn start_local_engine(&self, warnings: &mut Vec<String>) {
        let Some((program, args)) = self.config.local.start_command.split_first() else {
            warnings.push("no command configured to start the Docker engine".to_string());
            return;
        };
        let spec = CommandSpec::new(program.as_str())
            .args(args.iter().cloned())
            .timeout(Duration::from_secs(self.config.docker.operation_timeout_secs));
        match self.runner.run_checked(&spec).await {
            Ok(_) => tracing::info!("Requested Docker engine start"),
            Err(e) => warnings.push(format!("could not start the Docker engine: {}", e)),
        }
    }

    /// Reuse or create the local context, falling back to the bare socket
    async fn select_local_channel(&self, warnings: &mut Vec<String>) -> DockerChannel {
        let name = &self.config.local.context_name;
        match DockerCli::context_exists(self.runner.as_ref(), name).await {
            Ok(true) => {
                return DockerChannel::context(name.as_str());
            }
            Ok(false) => {}
            Err(e) => tracing::debug!("docker context inspect {} failed: {}", name, e),
        }
        match DockerCli::context_create(self.runner.as_ref(), name, &self.config.local.docker_socket)
            .await
        {
            Ok(()) => {
                tracing::info!("Created docker context {}", name);
                DockerChannel::context(name.as_str())
            }
            Err(e) => {
                warnings.push(format!(
                    "could not create docker context {}, using the default socket: {}",
                    name, e
                ));
                DockerChannel::LocalSocket
            }
        }
    }

    async fn resolve_remote(
        &self,
        state: &SessionState,
        host: &str,
        interaction: &dyn Interaction,
    ) -> Result<Connectivity> {
        let mut warnings = Vec::new();
        let user = state.identity.remote_user.as_str();

        let keys = KeyPair::new(&state.paths.private_key, &state.paths.public_key);
        keys.ensure_exists(self.runner.as_ref(), &state.identity.username)
            .await?;

        let target = SshTarget::new(user, host, &keys.private)
            .with_connect_timeout(Duration::from_secs(self.config.ssh.connect_timeout_secs));
        let bootstrapped = self.ensure_key_access(&target, &keys, interaction).await?;

        let shell = HostShell::remote(self.runner.clone(), target);
        let home = remote_home(&shell).await?;
        let repo_base = posix_join(&home, &self.config.remote.repo_base);

        let (engine_key, engine_known_hosts) = self
            .sync_credentials(&shell, &home, &keys, &state.identity.username, &mut warnings)
            .await;

        let repositories = shell.list_dirs(&repo_base).await.unwrap_or_else(|e| {
            warnings.push(format!("could not list repositories in {}: {}", repo_base, e));
            Vec::new()
        });

        let agent = match SessionAgent::for_key(&keys)
            .ensure(self.runner.as_ref(), &keys)
            .await
        {
            Ok(socket) => Some(socket),
            Err(e) => {
                warnings.push(format!(
                    "could not load the session key into ssh-agent, docker will only offer the default identities: {}",
                    e
                ));
                None
            }
        };
        let channel = self
            .select_remote_channel(user, host, &mut warnings)
            .await
            .with_ssh_agent(agent);
        let docker = DockerCli::new(self.runner.clone(), channel.clone());
        wait_for_engine(&docker, &self.config.docker).await?;

        log_warnings(&warnings);
        Ok(Connectivity {
            channel,
            repo_base,
            repositories,
            remote_home: Some(home),
            engine_key,
            engine_known_hosts,
            bootstrapped,
            warnings,
        })
    }

    async fn key_auth_works(&self, target: &SshTarget) -> bool {
        match self.runner.run(&target.auth_check()).await {
            Ok(output) => output.success(),
            Err(e) => {
                tracing::debug!("Key auth check to {} failed: {}", target.destination(), e);
                false
            }
        }
    }

    /// Make sure the session key authenticates, bootstrapping it if needed
    ///
    /// Returns `true` when the bootstrap ran.
    pub async fn ensure_key_access(
        &self,
        target: &SshTarget,
        keys: &KeyPair,
        interaction: &dyn Interaction,
    ) -> Result<bool> {
        if self.key_auth_works(target).await {
            tracing::debug!("Key authentication to {} works", target.destination());
            return Ok(false);
        }

        tracing::info!(
            "Key authentication to {} is not set up yet, installing the key",
            target.destination()
        );
        let public_key = keys.public_key()?;
        let password = interaction
            .remote_password(&target.user, &target.host)?
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                CoreError::Connectivity(format!(
                    "key authentication to {} failed and no password was given",
                    target.destination()
                ))
            })?;

        let request = BootstrapRequest {
            runner: self.runner.clone(),
            user: target.user.clone(),
            host: target.host.clone(),
            password,
            public_key,
            connect_timeout: target.connect_timeout,
        };
        let chain = bootstrap_chain();
        let attempts = self.config.ssh.bootstrap_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match chain.run(&request).await {
                Ok(ok) => tracing::info!("Installed key with {}", ok.strategy),
                Err(e) if !e.any_ran() => {
                    return Err(CoreError::FatalPrerequisite(format!(
                        "no password bootstrap tool is installed (need one of: {})",
                        chain.names().join(", ")
                    )));
                }
                Err(e) => {
                    tracing::warn!("Bootstrap attempt {}/{} failed", attempt, attempts);
                    last_error = e.to_string();
                }
            }
            if self.key_auth_works(target).await {
                return Ok(true);
            }
        }

        Err(CoreError::Connectivity(format!(
            "key authentication to {} still fails after {} bootstrap attempt(s){}",
            target.destination(),
            attempts,
            if last_error.is_empty() {
                String::new()
            } else {
                format!(": {}", last_error)
            }
        )))
    }

    /// Copy the private key and the git host's `known_hosts` entries to the
    /// remote state directory, over the authenticated ssh channel
    async fn sync_credentials(
        &self,
        shell: &HostShell,
        home: &str,
        keys: &KeyPair,
        username: &str,
        warnings: &mut Vec<String>,
    ) -> (Option<String>, Option<String>) {
        let dir = posix_join(&posix_join(home, &self.config.remote.state_dir), "ssh");
        let key_path = posix_join(&dir, &key_file_name(username));
        let known_hosts_path = posix_join(&dir, "known_hosts");

        let engine_key = match std::fs::read(&keys.private) {
            Ok(bytes) => match shell.write_file(&key_path, &bytes, 0o600).await {
                Ok(()) => Some(key_path),
                Err(e) => {
                    warnings.push(format!("could not copy SSH key to the remote host: {}", e));
                    None
                }
            },
            Err(e) => {
                warnings.push(format!("could not read {:?}: {}", keys.private, e));
                None
            }
        };

        let entries = self.known_host_entries().await;
        let engine_known_hosts = if entries.is_empty() {
            warnings.push(format!(
                "no known_hosts entry for {}, git push from the container will be refused",
                self.config.ssh.git_host
            ));
            None
        } else {
            match shell
                .write_file(&known_hosts_path, entries.as_bytes(), 0o644)
                .await
            {
                Ok(()) => Some(known_hosts_path),
                Err(e) => {
                    warnings.push(format!("could not copy known_hosts to the remote host: {}", e));
                    None
                }
            }
        };

        (engine_key, engine_known_hosts)
    }

    /// Host key lines for the git host: from the local known_hosts, else scanned
    async fn known_host_entries(&self) -> String {
        let git_host = &self.config.ssh.git_host;
        let known_hosts = self.config.ssh.known_hosts_path();
        let lookup = CommandSpec::new("ssh-keygen")
            .args(["-F", git_host.as_str(), "-f"])
            .arg(known_hosts.to_string_lossy().to_string());
        if let Ok(out) = self.runner.run(&lookup).await {
            let lines = key_lines(&out.stdout);
            if out.success() && !lines.is_empty() {
                return lines;
            }
        }

        tracing::debug!("{} not in {:?}, scanning", git_host, known_hosts);
        let scan = CommandSpec::new("ssh-keyscan")
            .args(["-T", "10", git_host.as_str()])
            .timeout(Duration::from_secs(20));
        match self.runner.run(&scan).await {
            Ok(out) if out.success() => key_lines(&out.stdout),
            Ok(out) => {
                tracing::debug!("ssh-keyscan failed: {}", out.combined());
                String::new()
            }
            Err(e) => {
                tracing::debug!("ssh-keyscan failed: {}", e);
                String::new()
            }
        }
    }

    /// Reuse or create the remote context, falling back to `DOCKER_HOST`
    async fn select_remote_channel(
        &self,
        user: &str,
        host: &str,
        warnings: &mut Vec<String>,
    ) -> DockerChannel {
        let name = remote_context_name(&self.config.remote.context_prefix, user, host);
        let url = DockerChannel::ssh_url(user, host);

        if let Ok(true) = DockerCli::context_exists(self.runner.as_ref(), &name).await {
            tracing::debug!("Reusing docker context {}", name);
            return DockerChannel::context(name);
        }
        match DockerCli::context_create(self.runner.as_ref(), &name, &url).await {
            Ok(()) => {
                tracing::info!("Created docker context {} for {}", name, url);
                DockerChannel::context(name)
            }
            Err(e) => {
                warnings.push(format!(
                    "could not create docker context {}, using DOCKER_HOST instead: {}",
                    name, e
                ));
                DockerChannel::direct_ssh(url)
            }
        }
    }
}

/// `<prefix>-<user>-<host>`, restricted to characters docker accepts
pub fn remote_context_name(prefix: &str, user: &str, host: &str) -> String {
    format!("{}-{}-{}", prefix, user, host)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// The remote account's `$HOME`
pub async fn remote_home(shell: &HostShell) -> Result<String> {
    let output = shell
        .run_checked("printf '%s' \"$HOME\"")
        .await
        .map_err(|e| CoreError::connectivity("reading remote home directory", e))?;
    let home = output.stdout.trim().to_string();
    if home.is_empty() || !home.starts_with('/') {
        return Err(CoreError::Connectivity(format!(
            "remote home directory {:?} is not an absolute path",
            home
        )));
    }
    Ok(home)
}

/// Poll the engine until it answers
///
/// Bounded by `poll_max_attempts` and, overall, by `operation_timeout_secs`.
pub async fn wait_for_engine(docker: &DockerCli, config: &DockerConfig) -> Result<()> {
    let interval = Duration::from_secs(config.poll_interval_secs);
    let attempts = config.poll_max_attempts.max(1);
    let overall = Duration::from_secs(config.operation_timeout_secs);

    let poll = async {
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match docker.ping().await {
                Ok(()) => {
                    tracing::debug!("Docker engine ready via {}", docker.channel());
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!("Engine not ready ({}/{}): {}", attempt, attempts, e);
                    last_error = e.to_string();
                }
            }
            if attempt < attempts {
                tokio::time::sleep(interval).await;
            }
        }
        Err(CoreError::Connectivity(format!(
            "Docker engine via {} not ready after {} attempts: {}",
            docker.channel(),
            attempts,
            last_error
        )))
    };

    tokio::time::timeout(overall, poll).await.map_err(|_| {
        CoreError::Connectivity(format!(
            "Docker engine via {} not ready within {}s",
            docker.channel(),
            overall.as_secs()
        ))
    })?
}

fn key_lines(output: &str) -> String {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| format!("{}\n", l))
        .collect()
}

fn log_warnings(warnings: &[String]) {
    for warning in warnings {
        tracing::warn!("{}", warning);
    }
}
