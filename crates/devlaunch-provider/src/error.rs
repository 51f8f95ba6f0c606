//! Error types for process, docker and ssh invocations

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Failed to start `{program}`: {source}")]
    SpawnError {
        program: String,
        source: std::io::Error,
    },

    #[error("`{command}` exited with status {status}: {output}")]
    CommandFailed {
        command: String,
        status: i32,
        output: String,
    },

    #[error("`{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("Required tool not found on PATH: {0}")]
    ToolNotFound(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Container name already in use: {0}")]
    NameConflict(String),

    #[error("Could not parse {what}: {detail}")]
    ParseError { what: String, detail: String },

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProviderError>;
