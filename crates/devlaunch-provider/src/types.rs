//! Common types for docker invocations

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Container status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Restarting => write!(f, "restarting"),
            Self::Removing => write!(f, "removing"),
            Self::Exited => write!(f, "exited"),
            Self::Dead => write!(f, "dead"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl From<&str> for ContainerStatus {
    fn from(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }
}

/// A published port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub container_port: u16,
    pub host_port: Option<u16>,
    pub protocol: String,
    pub host_ip: Option<String>,
}

/// One row of `docker ps -a`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    pub ports: Vec<PortInfo>,
}

impl ContainerInfo {
    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }

    /// Host ports published by this container
    pub fn host_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.ports.iter().filter_map(|p| p.host_port)
    }
}

/// The parts of `docker container inspect` this tool reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    /// `KEY=VALUE` entries from the container config
    pub env: Vec<String>,
    pub ports: Vec<PortInfo>,
}

impl ContainerDetails {
    /// Value of an environment variable declared on the container
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            let (k, v) = entry.split_once('=')?;
            (k == key).then_some(v)
        })
    }

    /// First host port bound to `container_port`
    pub fn host_port_for(&self, container_port: u16) -> Option<u16> {
        self.ports
            .iter()
            .filter(|p| p.container_port == container_port)
            .find_map(|p| p.host_port)
    }
}

/// Configuration for `docker build`
#[derive(Debug, Clone, Default)]
pub struct BuildConfig {
    /// Build context directory on the engine host
    pub context: String,
    /// Dockerfile path
    pub dockerfile: String,
    pub tag: String,
    pub build_args: BTreeMap<String, String>,
    pub no_cache: bool,
}

/// Mount type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountType {
    Bind,
    Volume,
}

impl std::fmt::Display for MountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bind => write!(f, "bind"),
            Self::Volume => write!(f, "volume"),
        }
    }
}

/// Mount configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountConfig {
    pub mount_type: MountType,
    /// Host path or volume name
    pub source: String,
    /// Path in the container
    pub target: String,
    pub read_only: bool,
}

impl MountConfig {
    pub fn bind(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            mount_type: MountType::Bind,
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn volume(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            mount_type: MountType::Volume,
            source: name.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Render as a `--mount` value
    pub fn to_arg(&self) -> String {
        let mut arg = format!(
            "type={},source={},target={}",
            self.mount_type, self.source, self.target
        );
        if self.read_only {
            arg.push_str(",readonly");
        }
        arg
    }
}

/// Port configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    pub host_port: u16,
    pub container_port: u16,
}

/// Configuration for a detached `docker run`
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    pub image: String,
    pub name: String,
    /// Literal `KEY=VALUE` environment entries
    pub env: BTreeMap<String, String>,
    /// Variables passed by name only; values come from the docker CLI's environment
    pub env_passthrough: Vec<(String, String)>,
    pub mounts: Vec<MountConfig>,
    pub ports: Vec<PortConfig>,
    pub working_dir: Option<String>,
    pub cpus: Option<String>,
    pub memory: Option<String>,
    /// Remove the container when it stops
    pub auto_remove: bool,
}

impl RunConfig {
    /// Arguments after `docker run`
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec!["-d".to_string()];
        if self.auto_remove {
            args.push("--rm".to_string());
        }
        args.push("--name".to_string());
        args.push(self.name.clone());

        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        for (key, _) in &self.env_passthrough {
            args.push("-e".to_string());
            args.push(key.clone());
        }
        for port in &self.ports {
            args.push("-p".to_string());
            args.push(format!("{}:{}", port.host_port, port.container_port));
        }
        for mount in &self.mounts {
            args.push("--mount".to_string());
            args.push(mount.to_arg());
        }
        if let Some(ref cpus) = self.cpus {
            args.push(format!("--cpus={}", cpus));
        }
        if let Some(ref memory) = self.memory {
            args.push(format!("--memory={}", memory));
        }
        if let Some(ref wd) = self.working_dir {
            args.push("-w".to_string());
            args.push(wd.clone());
        }
        args.push(self.image.clone());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_status_from_str() {
        assert_eq!(ContainerStatus::from("running"), ContainerStatus::Running);
        assert_eq!(ContainerStatus::from("Exited"), ContainerStatus::Exited);
        assert_eq!(ContainerStatus::from(" created\n"), ContainerStatus::Created);
        assert_eq!(ContainerStatus::from("bogus"), ContainerStatus::Unknown);
    }

    #[test]
    fn test_env_value_and_host_port() {
        let details = ContainerDetails {
            id: "abc".to_string(),
            name: "Foo_alice".to_string(),
            image: "foo".to_string(),
            status: ContainerStatus::Running,
            env: vec!["PATH=/usr/bin".to_string(), "PASSWORD=a=b".to_string()],
            ports: vec![PortInfo {
                container_port: 8787,
                host_port: Some(8790),
                protocol: "tcp".to_string(),
                host_ip: Some("0.0.0.0".to_string()),
            }],
        };
        assert_eq!(details.env_value("PASSWORD"), Some("a=b"));
        assert_eq!(details.env_value("MISSING"), None);
        assert_eq!(details.host_port_for(8787), Some(8790));
        assert_eq!(details.host_port_for(22), None);
    }

    #[test]
    fn test_mount_to_arg() {
        let m = MountConfig::bind("/home/a/.ssh/key", "/keys/key").read_only();
        assert_eq!(
            m.to_arg(),
            "type=bind,source=/home/a/.ssh/key,target=/keys/key,readonly"
        );
        let v = MountConfig::volume("Foo_alice_output", "/out");
        assert_eq!(v.to_arg(), "type=volume,source=Foo_alice_output,target=/out");
    }

    #[test]
    fn test_run_config_args_order() {
        let mut env = BTreeMap::new();
        env.insert("USERID".to_string(), "1000".to_string());
        let config = RunConfig {
            image: "foo".to_string(),
            name: "Foo_alice".to_string(),
            env,
            env_passthrough: vec![("PASSWORD".to_string(), "pw".to_string())],
            mounts: vec![],
            ports: vec![PortConfig {
                host_port: 8788,
                container_port: 8787,
            }],
            working_dir: Some("/work".to_string()),
            cpus: Some("4".to_string()),
            memory: None,
            auto_remove: true,
        };
        let args = config.to_args();
        assert_eq!(
            args,
            vec![
                "-d", "--rm", "--name", "Foo_alice", "-e", "USERID=1000", "-e", "PASSWORD",
                "-p", "8788:8787", "--cpus=4", "-w", "/work", "foo"
            ]
        );
        assert!(!args.iter().any(|a| a.contains("pw")));
    }
}
