//! Global configuration for devlaunch
//!
//! Located at `~/.config/devlaunch/config.toml`

use crate::{ConfigError, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Global devlaunch configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub defaults: DefaultsConfig,
    pub local: LocalConfig,
    pub remote: RemoteConfig,
    pub ssh: SshConfig,
    pub docker: DockerConfig,
    pub project: ProjectConfig,
}

/// Default settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    /// Username used when none is given on the command line
    pub username: Option<String>,
    /// Repository selected when none is given on the command line
    pub repo: Option<String>,
    /// Enable debug logging
    pub debug: bool,
}

/// Settings for a Docker engine on this machine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Directory holding the repositories
    pub repo_base: String,
    /// Fixed host port published in local mode
    pub port: u16,
    /// Docker socket path
    pub docker_socket: String,
    /// Command used to start a stopped engine
    pub start_command: Vec<String>,
    /// Name of the docker context bound to the local socket
    pub context_name: String,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            repo_base: "~/repos".to_string(),
            port: 8787,
            docker_socket: default_docker_socket(),
            start_command: default_start_command(),
            context_name: "local".to_string(),
        }
    }
}

#[cfg(windows)]
fn default_docker_socket() -> String {
    "npipe:////./pipe/docker_engine".to_string()
}

#[cfg(not(windows))]
fn default_docker_socket() -> String {
    "unix:///var/run/docker.sock".to_string()
}

#[cfg(target_os = "macos")]
fn default_start_command() -> Vec<String> {
    vec!["open".to_string(), "-a".to_string(), "Docker".to_string()]
}

#[cfg(windows)]
fn default_start_command() -> Vec<String> {
    vec![
        "cmd".to_string(),
        "/C".to_string(),
        "start".to_string(),
        "".to_string(),
        "C:\\Program Files\\Docker\\Docker\\Docker Desktop.exe".to_string(),
    ]
}

#[cfg(not(any(target_os = "macos", windows)))]
fn default_start_command() -> Vec<String> {
    vec![
        "systemctl".to_string(),
        "--user".to_string(),
        "start".to_string(),
        "docker-desktop".to_string(),
    ]
}

/// Settings for a Docker engine reached over SSH
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Remote host name or IP
    pub host: Option<String>,
    /// Account on the remote host (defaults to the session username)
    pub user: Option<String>,
    /// Repository directory on the remote host, relative paths resolve against `$HOME`
    pub repo_base: String,
    /// Host port published when the caller does not choose one
    pub default_port: u16,
    /// Prefix of the docker context created for the remote engine
    pub context_prefix: String,
    /// Directory (relative to the remote `$HOME`) for session records and synced keys
    pub state_dir: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: None,
            user: None,
            repo_base: "repos".to_string(),
            default_port: 8788,
            context_prefix: "devlaunch".to_string(),
            state_dir: ".devlaunch".to_string(),
        }
    }
}

/// SSH key and bootstrap settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Directory holding the generated key pairs
    pub key_dir: String,
    /// Local known_hosts file
    pub known_hosts: String,
    pub connect_timeout_secs: u64,
    /// How many times the password bootstrap chain is run before giving up
    pub bootstrap_attempts: u32,
    /// Git server whose host key is synced for in-container git operations
    pub git_host: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            key_dir: "~/.ssh".to_string(),
            known_hosts: "~/.ssh/known_hosts".to_string(),
            connect_timeout_secs: 10,
            bootstrap_attempts: 2,
            git_host: "github.com".to_string(),
        }
    }
}

/// Image, container and polling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Directory (relative to the repository root) holding the build definitions
    pub build_dir: String,
    pub dockerfile: String,
    pub prerequisite_dockerfile: String,
    /// Appended to the lower-cased repository name to form the image tag
    pub image_suffix: String,
    /// Small image used to copy data in and out of volumes
    pub helper_image: String,
    /// Port the service listens on inside the container
    pub container_port: u16,
    pub service_user: String,
    pub service_uid: u32,
    pub service_gid: u32,
    /// Environment variable carrying the service password
    pub password_env: String,
    pub high_compute_cpus: String,
    pub high_compute_memory: String,
    pub poll_interval_secs: u64,
    pub poll_max_attempts: u32,
    /// Upper bound for any readiness wait
    pub operation_timeout_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            build_dir: "docker_setup".to_string(),
            dockerfile: "Dockerfile".to_string(),
            prerequisite_dockerfile: "Dockerfile.prerequisite".to_string(),
            image_suffix: "".to_string(),
            helper_image: "devlaunch-sync:latest".to_string(),
            container_port: 8787,
            service_user: "rstudio".to_string(),
            service_uid: 1000,
            service_gid: 1000,
            password_env: "PASSWORD".to_string(),
            high_compute_cpus: "16".to_string(),
            high_compute_memory: "64g".to_string(),
            poll_interval_secs: 5,
            poll_max_attempts: 24,
            operation_timeout_secs: 180,
        }
    }
}

/// Where the per-repository project settings live
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Project config file, relative to the repository root
    pub config_file: String,
    pub output_key: String,
    pub synthpop_key: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            config_file: "inputs/sim_design.yaml".to_string(),
            output_key: "output_dir".to_string(),
            synthpop_key: "synthpop_dir".to_string(),
        }
    }
}

impl SshConfig {
    /// Key directory with `~` and environment variables expanded
    pub fn key_dir_path(&self) -> PathBuf {
        expand_path(&self.key_dir)
    }

    pub fn known_hosts_path(&self) -> PathBuf {
        expand_path(&self.known_hosts)
    }
}

impl LocalConfig {
    pub fn repo_base_path(&self) -> PathBuf {
        expand_path(&self.repo_base)
    }
}

/// Expand `~` and `$VARS` in a configured path, leaving it untouched on failure
pub fn expand_path(raw: &str) -> PathBuf {
    match shellexpand::full(raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(e) => {
            tracing::debug!("Could not expand {:?}: {}", raw, e);
            PathBuf::from(raw)
        }
    }
}

impl GlobalConfig {
    /// Load global configuration from the default path
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Load global configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;

        tracing::debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Reject values that would make every later phase fail
    pub fn validate(&self) -> Result<()> {
        if self.docker.poll_interval_secs == 0 || self.docker.poll_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "docker.poll_interval_secs and docker.poll_max_attempts must be non-zero"
                    .to_string(),
            ));
        }
        if self.ssh.bootstrap_attempts == 0 {
            return Err(ConfigError::Invalid(
                "ssh.bootstrap_attempts must be at least 1".to_string(),
            ));
        }
        if self.docker.container_port == 0 || self.local.port == 0 {
            return Err(ConfigError::Invalid("ports must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        self.save_to(&path)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError {
                path: path.to_path_buf(),
                source: e,
            })?;
        }

        let content = self.to_toml()?;

        std::fs::write(path, content).map_err(|e| ConfigError::WriteError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Render the configuration as pretty TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Get the default config file path
    ///
    /// `DEVLAUNCH_CONFIG_DIR` overrides the platform directory.
    pub fn config_path() -> Result<PathBuf> {
        if let Some(dir) = std::env::var_os("DEVLAUNCH_CONFIG_DIR") {
            return Ok(PathBuf::from(dir).join("config.toml"));
        }
        let dirs = ProjectDirs::from("", "", "devlaunch").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Get the data directory path
    ///
    /// `DEVLAUNCH_DATA_DIR` overrides the platform directory.
    pub fn data_dir() -> Result<PathBuf> {
        if let Some(dir) = std::env::var_os("DEVLAUNCH_DATA_DIR") {
            return Ok(PathBuf::from(dir));
        }
        let dirs = ProjectDirs::from("", "", "devlaunch").ok_or(ConfigError::NoDataDir)?;
        Ok(dirs.data_dir().to_path_buf())
    }
}
