//! Session records
//!
//! A small JSON document per container, written when the container starts and
//! deleted when it stops, kept on the Docker engine's host. A later process
//! that finds the container running reads it back to recover the password,
//! port and volume flag.
//!
//! The record holds the session password in plain text until a clean stop.
//! Writers are not locked against each other.

use crate::host::{posix_join, HostShell};
use crate::state::atomic_write;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataRecord {
    pub container: String,
    pub repo: String,
    pub user: String,
    pub password: String,
    /// Host port, kept as a string
    pub port: String,
    pub use_volumes: bool,
    pub timestamp: DateTime<Utc>,
}

impl MetadataRecord {
    pub fn port_number(&self) -> Option<u16> {
        self.port.trim().parse().ok()
    }
}

/// Where records are kept
#[derive(Clone)]
pub enum MetadataStore {
    /// A directory on this machine
    Local { dir: PathBuf },
    /// A directory on the remote engine host
    Remote { shell: HostShell, dir: String },
}

impl MetadataStore {
    pub fn local(dir: impl Into<PathBuf>) -> Self {
        Self::Local { dir: dir.into() }
    }

    /// Records under `<home>/<state_dir>/sessions`
    pub fn remote(shell: HostShell, home: &str, state_dir: &str) -> Self {
        Self::Remote {
            shell,
            dir: posix_join(&posix_join(home, state_dir), "sessions"),
        }
    }

    /// Where the record for `container` lives
    pub fn location(&self, container: &str) -> String {
        let file = format!("{}.json", container);
        match self {
            Self::Local { dir } => dir.join(file).to_string_lossy().to_string(),
            Self::Remote { dir, .. } => posix_join(dir, &file),
        }
    }

    pub async fn write(&self, record: &MetadataRecord) -> Result<()> {
        let content = serde_json::to_vec_pretty(record)?;
        match self {
            Self::Local { dir } => {
                std::fs::create_dir_all(dir)?;
                let path = dir.join(format!("{}.json", record.container));
                atomic_write(&path, &content)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
                }
            }
            Self::Remote { shell, .. } => {
                shell
                    .write_file(&self.location(&record.container), &content, 0o600)
                    .await?;
            }
        }
        tracing::debug!("Wrote session record for {}", record.container);
        Ok(())
    }

    /// Read the record for `container`, `None` when absent
    pub async fn read(&self, container: &str) -> Result<Option<MetadataRecord>> {
        let content = match self {
            Self::Local { dir } => {
                let path = dir.join(format!("{}.json", container));
                match std::fs::read_to_string(&path) {
                    Ok(content) => Some(content),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                    Err(e) => return Err(e.into()),
                }
            }
            Self::Remote { shell, .. } => shell.read_file(&self.location(container)).await?,
        };
        match content {
            Some(content) => Ok(Some(serde_json::from_str(&content)?)),
            None => Ok(None),
        }
    }

    /// Delete the record. Returns `false` when there was none.
    pub async fn delete(&self, container: &str) -> Result<bool> {
        match self {
            Self::Local { dir } => {
                let path = dir.join(format!("{}.json", container));
                match std::fs::remove_file(&path) {
                    Ok(()) => Ok(true),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
            Self::Remote { shell, .. } => shell.remove_file(&self.location(container)).await,
        }
    }
}
