//! Session state
//!
//! One [`SessionState`] exists per run. The workflow coordinator owns it and
//! lends it to each component; components hand back fragments which the
//! coordinator merges.

use crate::{CoreError, Result};
use chrono::{DateTime, Utc};
use devlaunch_config::GlobalConfig;
use devlaunch_provider::{ContainerInfo, DockerChannel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Write content to a file atomically using a temp-file-then-rename pattern.
///
/// A crash during write leaves the old file intact.
pub(crate) fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(content)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Where the Docker engine (and the repositories it mounts) lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Location {
    Local,
    Remote { host: String },
}

impl Location {
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote { host } => write!(f, "remote ({})", host),
        }
    }
}

/// Normalize a username for use in container, volume and key names
///
/// Lower-cases, turns whitespace into `_` and drops anything docker would
/// reject in a container name.
pub fn normalize_username(raw: &str) -> Result<String> {
    let normalized: String = raw
        .trim()
        .chars()
        .filter_map(|c| match c {
            c if c.is_whitespace() => Some('_'),
            c if c.is_ascii_alphanumeric() => Some(c.to_ascii_lowercase()),
            '_' | '-' | '.' => Some(c),
            _ => None,
        })
        .collect();

    match normalized.chars().next() {
        Some(first) if first.is_ascii_alphanumeric() => Ok(normalized),
        _ => Err(CoreError::Validation(format!(
            "username {:?} does not contain a usable name",
            raw
        ))),
    }
}

/// Check a repository name can be used in a container name and a path
pub fn validate_repo_name(repo: &str) -> Result<()> {
    let valid_chars = repo
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    let valid_start = repo
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric());
    if valid_chars && valid_start {
        Ok(())
    } else {
        Err(CoreError::Validation(format!(
            "repository name {:?} must start with a letter or digit and contain only letters, digits, '_', '-' or '.'",
            repo
        )))
    }
}

/// `<repo>_<user>`, unique per repository and user on one engine
pub fn container_name(repo: &str, user: &str) -> String {
    format!("{}_{}", repo, user)
}

/// File name of the private key for a normalized user
pub fn key_file_name(user: &str) -> String {
    format!("id_ed25519_{}", user)
}

/// Who is running the session
#[derive(Debug, Clone, Default)]
pub struct Identity {
    /// Normalized username
    pub username: String,
    /// Service credential inside the container
    pub password: Option<String>,
    /// Account on the remote host
    pub remote_user: String,
}

#[derive(Debug, Clone, Default)]
pub struct SessionFlags {
    pub debug: bool,
    /// Docker is reached through `DOCKER_HOST` instead of a context
    pub direct_ssh: bool,
    pub use_volumes: bool,
    pub rebuild: bool,
    pub high_compute: bool,
    /// Set once this process has started the container
    pub relaunch_guard: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PortState {
    pub requested: Option<u16>,
    pub assigned: Option<u16>,
    /// Host ports published by running containers on the engine
    pub used: BTreeSet<u16>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionPaths {
    pub local_repo_base: PathBuf,
    /// Remote repository base, absolute once the remote home is known
    pub remote_repo_base: Option<String>,
    pub remote_home: Option<String>,
    /// Selected repository on the engine host
    pub repo_root: Option<String>,
    pub output_dir: Option<String>,
    pub synthpop_dir: Option<String>,
    pub private_key: PathBuf,
    pub public_key: PathBuf,
    pub known_hosts: PathBuf,
    /// Private key as seen by the engine host (mounted into the container)
    pub engine_key: Option<String>,
    pub engine_known_hosts: Option<String>,
}

/// Container lifecycle as driven by this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    #[default]
    Idle,
    Building,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl LifecycleState {
    /// Whether moving to `next` is allowed
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Idle | Stopped, Building | Starting)
                | (Building, Starting | Idle)
                | (Starting, Running | Idle)
                | (Running | Idle, Stopping)
                | (Stopping, Stopped)
        )
    }

    pub fn transition(self, next: LifecycleState) -> Result<LifecycleState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(CoreError::Validation(format!(
                "cannot go from {:?} to {:?}",
                self, next
            )))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub image: String,
    /// Whether this session built the image (vs. found it present)
    pub built: bool,
    /// Name of the build strategy that succeeded
    pub strategy: Option<String>,
}

/// Where recovered facts came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoverySource {
    MetadataRecord,
    ContainerInspection,
    #[default]
    Unrecovered,
}

/// Facts recovered for a container started by an earlier process
///
/// Every field defaults to empty so a partial recovery can be read safely.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveredSecrets {
    pub password: Option<String>,
    pub port: Option<u16>,
    pub use_volumes: Option<bool>,
    pub started_at: Option<DateTime<Utc>>,
    pub source: RecoverySource,
}

/// Values in force when the container was started
///
/// Stop-time volume sync and git detection read these, never the current
/// selections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSnapshot {
    pub port: u16,
    pub use_volumes: bool,
    pub repo_path: String,
    pub location: Location,
    pub output_dir: Option<String>,
    pub synthpop_dir: Option<String>,
}

/// Repository state captured before the container starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitBaseline {
    pub commit: Option<String>,
    pub dirty: bool,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeNames {
    pub output: String,
    pub synthpop: String,
}

impl VolumeNames {
    pub fn for_container(container: &str) -> Self {
        Self {
            output: format!("{}_output", container),
            synthpop: format!("{}_synthpop", container),
        }
    }
}

/// Facts discovered or produced while the session runs
#[derive(Debug, Clone, Default)]
pub struct RuntimeFacts {
    pub build: Option<BuildInfo>,
    /// Every container visible on the engine
    pub containers: Vec<ContainerInfo>,
    /// Other containers belonging to this user
    pub user_containers: Vec<ContainerInfo>,
    pub running: bool,
    pub recovered: RecoveredSecrets,
    pub active: Option<ActiveSnapshot>,
    pub baseline: Option<GitBaseline>,
    pub volumes: Option<VolumeNames>,
    pub lifecycle: LifecycleState,
}

/// The shared record for one run
#[derive(Debug, Clone)]
pub struct SessionState {
    pub identity: Identity,
    pub location: Location,
    pub repo: Option<String>,
    pub paths: SessionPaths,
    pub flags: SessionFlags,
    pub ports: PortState,
    pub metadata: RuntimeFacts,
    /// Resolved once per session by the connectivity phase
    pub channel: Option<DockerChannel>,
    /// Candidate repositories on the engine host
    pub repositories: Vec<String>,
}

impl SessionState {
    pub fn new(config: &GlobalConfig, username: &str, location: Location) -> Result<Self> {
        let username = normalize_username(username)?;
        let key_dir = config.ssh.key_dir_path();
        let private_key = key_dir.join(key_file_name(&username));
        let mut public_key = private_key.clone().into_os_string();
        public_key.push(".pub");

        let remote_user = config
            .remote
            .user
            .clone()
            .unwrap_or_else(|| username.clone());

        Ok(Self {
            identity: Identity {
                username,
                password: None,
                remote_user,
            },
            location,
            repo: None,
            paths: SessionPaths {
                local_repo_base: config.local.repo_base_path(),
                private_key,
                public_key: PathBuf::from(public_key),
                known_hosts: config.ssh.known_hosts_path(),
                ..Default::default()
            },
            flags: SessionFlags {
                debug: config.defaults.debug,
                ..Default::default()
            },
            ports: PortState::default(),
            metadata: RuntimeFacts::default(),
            channel: None,
            repositories: Vec::new(),
        })
    }

    /// Override the remote account (defaults to the session username)
    pub fn with_remote_user(mut self, user: &str) -> Self {
        let user = user.trim();
        if !user.is_empty() {
            self.identity.remote_user = user.to_string();
        }
        self
    }

    /// Derived container name for the selected repository
    pub fn container_name(&self) -> Result<String> {
        let repo = self
            .repo
            .as_deref()
            .ok_or_else(|| CoreError::Validation("no repository selected".to_string()))?;
        Ok(container_name(repo, &self.identity.username))
    }

    pub fn repo_root(&self) -> Result<&str> {
        self.paths
            .repo_root
            .as_deref()
            .ok_or_else(|| CoreError::Validation("repository path not resolved".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_username() {
        assert_eq!(normalize_username("  Alice ").unwrap(), "alice");
        assert_eq!(normalize_username("Mary Ann").unwrap(), "mary_ann");
        assert_eq!(normalize_username("bob@corp!").unwrap(), "bobcorp");
        assert!(normalize_username("   ").is_err());
        assert!(normalize_username("_x").is_err());
    }

    #[test]
    fn test_container_names_never_collide() {
        assert_eq!(container_name("Foo", "alice"), "Foo_alice");
        assert_ne!(container_name("Foo", "alice"), container_name("Bar", "alice"));
        assert_ne!(container_name("Foo", "alice"), container_name("Foo", "bob"));
    }

    #[test]
    fn test_key_paths_are_deterministic() {
        let mut config = GlobalConfig::default();
        config.ssh.key_dir = "/keys".to_string();
        let a = SessionState::new(&config, "Alice", Location::Local).unwrap();
        let b = SessionState::new(&config, "alice", Location::Local).unwrap();
        assert_eq!(a.paths.private_key, PathBuf::from("/keys/id_ed25519_alice"));
        assert_eq!(a.paths.public_key, PathBuf::from("/keys/id_ed25519_alice.pub"));
        assert_eq!(a.paths.private_key, b.paths.private_key);
    }

    #[test]
    fn test_remote_user_defaults_to_username() {
        let config = GlobalConfig::default();
        let state = SessionState::new(
            &config,
            "alice",
            Location::Remote {
                host: "10.0.0.5".into(),
            },
        )
        .unwrap();
        assert_eq!(state.identity.remote_user, "alice");
        let state = state.with_remote_user("svc");
        assert_eq!(state.identity.remote_user, "svc");
    }

    #[test]
    fn test_container_name_requires_repo() {
        let config = GlobalConfig::default();
        let mut state = SessionState::new(&config, "alice", Location::Local).unwrap();
        assert!(state.container_name().is_err());
        state.repo = Some("Foo".to_string());
        assert_eq!(state.container_name().unwrap(), "Foo_alice");
    }

    #[test]
    fn test_validate_repo_name() {
        assert!(validate_repo_name("Foo").is_ok());
        assert!(validate_repo_name("my-repo.v2").is_ok());
        assert!(validate_repo_name("").is_err());
        assert!(validate_repo_name("../etc").is_err());
        assert!(validate_repo_name("a b").is_err());
    }

    #[test]
    fn test_lifecycle_transitions() {
        use LifecycleState::*;
        assert!(Idle.can_transition_to(Building));
        assert!(Building.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Starting));
        assert!(!Running.can_transition_to(Starting));
        assert!(Idle.transition(Running).is_err());
    }

    #[test]
    fn test_atomic_write_replaces_content() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f.json");
        atomic_write(&path, b"one").unwrap();
        atomic_write(&path, b"two").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
    }
}
