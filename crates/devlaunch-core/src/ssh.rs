//! SSH keys and password bootstrap
//!
//! Key auth is the only way this tool talks to a remote host once a session
//! is established. When the session's public key is not yet trusted, a
//! password is asked for once and used to append the key to the remote
//! `authorized_keys` through one of two bootstrap strategies.
//!
//! # Security
//!
//! - Private keys are written with 0600 permissions
//! - The bootstrap password lives in a [`OneTimePassword`], is passed through
//!   an environment variable or a redacted argument, and is wiped on drop
//! - Host keys are pinned on first contact (`StrictHostKeyChecking=accept-new`)

use crate::chain::{Attempt, FallbackChain, Strategy};
use crate::{CoreError, Result};
use async_trait::async_trait;
use devlaunch_provider::{sh_quote, CommandRunner, CommandSpec, ProviderError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Printed by the bootstrap script once the key is installed
pub const BOOTSTRAP_MARKER: &str = "DEVLAUNCH_BOOTSTRAP_OK";

/// The session's ed25519 key pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private: PathBuf,
    pub public: PathBuf,
}

impl KeyPair {
    pub fn new(private: impl Into<PathBuf>, public: impl Into<PathBuf>) -> Self {
        Self {
            private: private.into(),
            public: public.into(),
        }
    }

    /// Ensure the key pair exists, generating it if necessary
    ///
    /// Returns `true` when a new key was generated.
    pub async fn ensure_exists(&self, runner: &dyn CommandRunner, user: &str) -> Result<bool> {
        if self.private.exists() && self.public.exists() {
            tracing::debug!("SSH keys already exist at {:?}", self.private);
            return Ok(false);
        }

        if self.private.exists() {
            tracing::info!("Public key missing, deriving it from {:?}", self.private);
            let spec = CommandSpec::new("ssh-keygen")
                .args(["-y", "-f"])
                .arg(path_str(&self.private)?);
            let output = runner.run_checked(&spec).await.map_err(keygen_error)?;
            std::fs::write(&self.public, format!("{}\n", output.stdout.trim()))?;
            return Ok(false);
        }

        tracing::info!("Generating SSH keypair at {:?}", self.private);
        if let Some(parent) = self.private.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let spec = CommandSpec::new("ssh-keygen")
            .args(["-q", "-t", "ed25519", "-f"])
            .arg(path_str(&self.private)?)
            .args(["-N", "", "-C"])
            .arg(format!("devlaunch-{}", user));
        runner.run_checked(&spec).await.map_err(keygen_error)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if self.private.exists() {
                let mut perms = std::fs::metadata(&self.private)?.permissions();
                perms.set_mode(0o600);
                std::fs::set_permissions(&self.private, perms)?;
            }
        }

        tracing::info!("Generated SSH keypair successfully");
        Ok(true)
    }

    /// Public key line, trimmed
    pub fn public_key(&self) -> Result<String> {
        let content = std::fs::read_to_string(&self.public)?;
        let line = content.trim();
        if line.is_empty() {
            return Err(CoreError::Connectivity(format!(
                "public key {:?} is empty",
                self.public
            )));
        }
        Ok(line.to_string())
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| {
        CoreError::Validation(format!("key path {:?} contains invalid UTF-8", path))
    })
}

fn keygen_error(e: ProviderError) -> CoreError {
    match e {
        ProviderError::ToolNotFound(tool) => CoreError::FatalPrerequisite(tool),
        other => CoreError::connectivity("ssh-keygen failed", other),
    }
}

/// ssh-agent serving the session key to docker's ssh transport
///
/// Docker's ssh connection helper only offers the default identities and the
/// keys held by an agent, so the per-user key reaches it through an agent
/// listening on a fixed socket next to the key. A live agent is reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAgent {
    pub socket: PathBuf,
}

impl SessionAgent {
    /// `<private key>.agent`
    pub fn for_key(keys: &KeyPair) -> Self {
        let mut name = keys
            .private
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".agent");
        Self {
            socket: keys.private.with_file_name(name),
        }
    }

    /// Start the agent if nothing answers on the socket, then load the key
    ///
    /// Returns the socket path for `SSH_AUTH_SOCK`.
    pub async fn ensure(&self, runner: &dyn CommandRunner, keys: &KeyPair) -> Result<String> {
        let socket = path_str(&self.socket)?.to_string();
        let key = path_str(&keys.private)?;

        let list = CommandSpec::new("ssh-add")
            .arg("-l")
            .env("SSH_AUTH_SOCK", socket.as_str());
        // ssh-add exits 2 when it cannot reach an agent
        let alive = matches!(runner.run(&list).await, Ok(out) if out.status != 2);

        if !alive {
            match std::fs::remove_file(&self.socket) {
                Ok(()) => tracing::debug!("Removed stale agent socket {:?}", self.socket),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            let start = CommandSpec::new("ssh-agent").args(["-a", socket.as_str()]);
            runner
                .run_checked(&start)
                .await
                .map_err(|e| agent_error("ssh-agent failed to start", e))?;
            tracing::info!("Started ssh-agent on {:?}", self.socket);
        }

        let add = CommandSpec::new("ssh-add")
            .arg(key)
            .env("SSH_AUTH_SOCK", socket.as_str());
        runner
            .run_checked(&add)
            .await
            .map_err(|e| agent_error("ssh-add failed", e))?;
        tracing::debug!("Session key loaded into the agent at {:?}", self.socket);
        Ok(socket)
    }
}

fn agent_error(context: &str, e: ProviderError) -> CoreError {
    match e {
        ProviderError::ToolNotFound(tool) => CoreError::FatalPrerequisite(tool),
        other => CoreError::connectivity(context, other),
    }
}

/// A password entered for a single bootstrap
///
/// Never serialized, never logged, and overwritten when dropped.
pub struct OneTimePassword(String);

impl OneTimePassword {
    pub fn new(password: impl Into<String>) -> Self {
        Self(password.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for OneTimePassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OneTimePassword(****)")
    }
}

impl Drop for OneTimePassword {
    fn drop(&mut self) {
        let mut bytes = std::mem::take(&mut self.0).into_bytes();
        bytes.iter_mut().for_each(|b| *b = 0);
        std::hint::black_box(&bytes);
    }
}

/// Everything a bootstrap strategy needs
pub struct BootstrapRequest {
    pub runner: Arc<dyn CommandRunner>,
    pub user: String,
    pub host: String,
    pub password: OneTimePassword,
    pub public_key: String,
    pub connect_timeout: Duration,
}

impl BootstrapRequest {
    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn timeout(&self) -> Duration {
        self.connect_timeout + Duration::from_secs(30)
    }
}

/// Shell lines that install `public_key` for the current account
pub fn bootstrap_script_lines(public_key: &str) -> Vec<String> {
    let key = sh_quote(public_key);
    vec![
        "umask 077".to_string(),
        "mkdir -p \"$HOME/.ssh\"".to_string(),
        "chmod 700 \"$HOME/.ssh\"".to_string(),
        "touch \"$HOME/.ssh/authorized_keys\"".to_string(),
        "chmod 600 \"$HOME/.ssh/authorized_keys\"".to_string(),
        format!(
            "grep -qxF {key} \"$HOME/.ssh/authorized_keys\" || printf '%s\\n' {key} >> \"$HOME/.ssh/authorized_keys\"",
            key = key
        ),
        format!("echo {}", BOOTSTRAP_MARKER),
    ]
}

fn check_marker(spec: &CommandSpec, output: devlaunch_provider::CommandOutput) -> Attempt<()> {
    if output.success() && output.stdout.contains(BOOTSTRAP_MARKER) {
        Attempt::Done(())
    } else if output.success() {
        Attempt::Failed("install script did not confirm success".to_string())
    } else {
        Attempt::Failed(format!(
            "exit {}: {}",
            output.status,
            spec.mask(&output.combined())
        ))
    }
}

fn spawn_failure(e: ProviderError) -> Attempt<()> {
    match e {
        ProviderError::ToolNotFound(tool) => Attempt::Unavailable(format!("{} not found", tool)),
        other => Attempt::Failed(other.to_string()),
    }
}

/// Password session driven by `sshpass`, script streamed over stdin
pub struct ManagedSession;

#[async_trait]
impl Strategy<BootstrapRequest, ()> for ManagedSession {
    fn name(&self) -> &'static str {
        "sshpass session"
    }

    async fn attempt(&self, req: &BootstrapRequest) -> Attempt<()> {
        if !req.runner.is_available("sshpass") {
            return Attempt::Unavailable("sshpass not found".to_string());
        }
        let script = bootstrap_script_lines(&req.public_key).join("\n") + "\n";
        let spec = CommandSpec::new("sshpass")
            .args(["-e", "ssh"])
            .args(["-o", "StrictHostKeyChecking=accept-new"])
            .args(["-o", "PubkeyAuthentication=no"])
            .args(["-o", "PreferredAuthentications=password,keyboard-interactive"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", req.connect_timeout.as_secs().max(1)))
            .arg(req.destination())
            .args(["sh", "-s"])
            .env("SSHPASS", req.password.expose())
            .redact(req.password.expose())
            .stdin(script)
            .timeout(req.timeout());
        match req.runner.run(&spec).await {
            Ok(output) => check_marker(&spec, output),
            Err(e) => spawn_failure(e),
        }
    }
}

/// PuTTY's `plink` with an inline password
///
/// The host key prompt is answered with `y` on stdin.
pub struct LegacyClient;

#[async_trait]
impl Strategy<BootstrapRequest, ()> for LegacyClient {
    fn name(&self) -> &'static str {
        "plink"
    }

    async fn attempt(&self, req: &BootstrapRequest) -> Attempt<()> {
        if !req.runner.is_available("plink") {
            return Attempt::Unavailable("plink not found".to_string());
        }
        let script = bootstrap_script_lines(&req.public_key).join("; ");
        let spec = CommandSpec::new("plink")
            .args(["-ssh", "-pw", req.password.expose()])
            .arg(req.destination())
            .arg(script)
            .redact(req.password.expose())
            .stdin("y\n")
            .timeout(req.timeout());
        match req.runner.run(&spec).await {
            Ok(output) => check_marker(&spec, output),
            Err(e) => spawn_failure(e),
        }
    }
}

/// The bootstrap methods in the order they are tried
pub fn bootstrap_chain() -> FallbackChain<BootstrapRequest, ()> {
    FallbackChain::new("key bootstrap")
        .with(ManagedSession)
        .with(LegacyClient)
}
