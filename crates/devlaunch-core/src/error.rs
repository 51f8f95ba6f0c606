//! Error types for devlaunch-core

use devlaunch_provider::ProviderError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] devlaunch_config::ConfigError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("Docker error: {0}")]
    Docker(String),

    #[error("Container already exists: {0}")]
    ContainerExists(String),

    #[error("Git error: {0}")]
    Git(String),

    #[error("Missing prerequisite: {0}")]
    FatalPrerequisite(String),

    #[error("{phase} failed: {source}")]
    Phase {
        phase: Phase,
        #[source]
        source: Box<CoreError>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Classification used by callers to decide how to report a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Connectivity,
    Docker,
    Git,
    FatalPrerequisite,
    Internal,
}

/// Workflow phase an error was raised in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connect,
    Status,
    Start,
    Stop,
    Git,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Status => write!(f, "status"),
            Self::Start => write!(f, "start"),
            Self::Stop => write!(f, "stop"),
            Self::Git => write!(f, "git"),
        }
    }
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::Config(_) => ErrorKind::Validation,
            Self::Connectivity(_) => ErrorKind::Connectivity,
            Self::Docker(_) | Self::ContainerExists(_) => ErrorKind::Docker,
            Self::Git(_) => ErrorKind::Git,
            Self::FatalPrerequisite(_) => ErrorKind::FatalPrerequisite,
            Self::Provider(ProviderError::ToolNotFound(_)) => ErrorKind::FatalPrerequisite,
            Self::Provider(ProviderError::NameConflict(_)) => ErrorKind::Docker,
            Self::Phase { source, .. } => source.kind(),
            Self::Provider(_) | Self::Io(_) | Self::Json(_) => ErrorKind::Internal,
        }
    }

    /// Tag an error with the phase it occurred in (idempotent)
    pub fn in_phase(self, phase: Phase) -> Self {
        match self {
            Self::Phase { .. } => self,
            other => Self::Phase {
                phase,
                source: Box::new(other),
            },
        }
    }

    /// Phase the error was raised in, if tagged
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Phase { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    pub fn docker(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Docker(format!("{}: {}", context, err))
    }

    pub fn connectivity(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Connectivity(format!("{}: {}", context, err))
    }

    pub fn git(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Git(format!("{}: {}", context, err))
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_wrapping_keeps_kind() {
        let err = CoreError::Docker("build failed".into()).in_phase(Phase::Start);
        assert_eq!(err.kind(), ErrorKind::Docker);
        assert_eq!(err.phase(), Some(Phase::Start));
        assert_eq!(err.to_string(), "start failed: Docker error: build failed");

        let again = err.in_phase(Phase::Stop);
        assert_eq!(again.phase(), Some(Phase::Start));
    }

    #[test]
    fn test_provider_classification() {
        let missing = CoreError::from(ProviderError::ToolNotFound("docker".into()));
        assert_eq!(missing.kind(), ErrorKind::FatalPrerequisite);
        let conflict = CoreError::ContainerExists("Foo_alice".into());
        assert_eq!(conflict.kind(), ErrorKind::Docker);
    }
}
