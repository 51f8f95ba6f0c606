//! How this process talks to a Docker engine

use serde::{Deserialize, Serialize};

/// The resolved Docker command channel
///
/// Exactly one mode is active per session. It decides which extra arguments
/// and environment variables every docker invocation receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DockerChannel {
    /// The engine's default local socket, no context selection
    LocalSocket,
    /// A named docker context (local socket or `ssh://user@host`)
    Context {
        name: String,
        /// Agent socket holding the session key, for ssh contexts
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ssh_auth_sock: Option<String>,
    },
    /// `DOCKER_HOST` override, used when a context could not be created
    DirectSsh {
        docker_host: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ssh_auth_sock: Option<String>,
    },
}

impl DockerChannel {
    pub fn context(name: impl Into<String>) -> Self {
        Self::Context {
            name: name.into(),
            ssh_auth_sock: None,
        }
    }

    pub fn direct_ssh(docker_host: impl Into<String>) -> Self {
        Self::DirectSsh {
            docker_host: docker_host.into(),
            ssh_auth_sock: None,
        }
    }

    /// Route docker's ssh transport through the agent at `socket`
    ///
    /// Has no effect on the local socket.
    pub fn with_ssh_agent(mut self, socket: Option<String>) -> Self {
        match &mut self {
            Self::LocalSocket => {}
            Self::Context { ssh_auth_sock, .. } | Self::DirectSsh { ssh_auth_sock, .. } => {
                *ssh_auth_sock = socket;
            }
        }
        self
    }

    pub fn ssh_auth_sock(&self) -> Option<&str> {
        match self {
            Self::LocalSocket => None,
            Self::Context { ssh_auth_sock, .. } | Self::DirectSsh { ssh_auth_sock, .. } => {
                ssh_auth_sock.as_deref()
            }
        }
    }

    /// Arguments placed before the docker subcommand
    pub fn context_args(&self) -> Vec<String> {
        match self {
            Self::LocalSocket | Self::DirectSsh { .. } => Vec::new(),
            Self::Context { name, .. } => vec!["--context".to_string(), name.clone()],
        }
    }

    /// Environment overrides for each docker invocation
    pub fn env_overrides(&self) -> Vec<(String, String)> {
        let mut env = Vec::new();
        if let Self::DirectSsh { docker_host, .. } = self {
            env.push(("DOCKER_HOST".to_string(), docker_host.clone()));
        }
        if let Some(socket) = self.ssh_auth_sock() {
            env.push(("SSH_AUTH_SOCK".to_string(), socket.to_string()));
        }
        env
    }

    pub fn is_direct_ssh(&self) -> bool {
        matches!(self, Self::DirectSsh { .. })
    }

    /// The `ssh://user@host` URL for a remote engine
    pub fn ssh_url(user: &str, host: &str) -> String {
        format!("ssh://{}@{}", user, host)
    }
}

impl std::fmt::Display for DockerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalSocket => write!(f, "local socket"),
            Self::Context { name, .. } => write!(f, "context '{}'", name),
            Self::DirectSsh { docker_host, .. } => write!(f, "DOCKER_HOST={}", docker_host),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_ssh_has_no_context_arg() {
        let channel = DockerChannel::direct_ssh(DockerChannel::ssh_url("alice", "10.0.0.5"));
        assert!(channel.context_args().is_empty());
        assert_eq!(
            channel.env_overrides(),
            vec![("DOCKER_HOST".to_string(), "ssh://alice@10.0.0.5".to_string())]
        );
        assert!(channel.is_direct_ssh());
    }

    #[test]
    fn test_named_context_yields_exactly_context_flag() {
        let channel = DockerChannel::context("devlaunch-10.0.0.5");
        assert_eq!(channel.context_args(), vec!["--context", "devlaunch-10.0.0.5"]);
        assert!(channel.env_overrides().is_empty());
    }

    #[test]
    fn test_local_socket_has_no_overrides() {
        let channel = DockerChannel::LocalSocket;
        assert!(channel.context_args().is_empty());
        assert!(channel.env_overrides().is_empty());
    }

    #[test]
    fn test_local_context() {
        let channel = DockerChannel::context("local");
        assert_eq!(channel.context_args(), vec!["--context", "local"]);
    }

    #[test]
    fn test_ssh_agent_reaches_every_remote_call() {
        let socket = Some("/home/alice/.ssh/id_ed25519_alice.agent".to_string());

        let direct = DockerChannel::direct_ssh("ssh://alice@10.0.0.5").with_ssh_agent(socket.clone());
        assert_eq!(
            direct.env_overrides(),
            vec![
                ("DOCKER_HOST".to_string(), "ssh://alice@10.0.0.5".to_string()),
                (
                    "SSH_AUTH_SOCK".to_string(),
                    "/home/alice/.ssh/id_ed25519_alice.agent".to_string()
                ),
            ]
        );

        let context = DockerChannel::context("devlaunch-alice-10.0.0.5").with_ssh_agent(socket.clone());
        assert_eq!(context.context_args(), vec!["--context", "devlaunch-alice-10.0.0.5"]);
        assert_eq!(context.ssh_auth_sock(), socket.as_deref());
        assert_eq!(context.env_overrides().len(), 1);

        let local = DockerChannel::LocalSocket.with_ssh_agent(socket);
        assert!(local.env_overrides().is_empty());
    }

    #[test]
    fn test_channel_without_agent_deserializes() {
        let channel: DockerChannel =
            serde_json::from_str(r#"{"mode":"direct_ssh","docker_host":"ssh://a@h"}"#).unwrap();
        assert_eq!(channel, DockerChannel::direct_ssh("ssh://a@h"));
    }
}
