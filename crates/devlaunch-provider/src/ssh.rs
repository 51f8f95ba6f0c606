//! ssh invocation builder

use crate::CommandSpec;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A remote account reached with a private key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub user: String,
    pub host: String,
    pub key: PathBuf,
    pub connect_timeout: Duration,
}

impl SshTarget {
    pub fn new(user: impl Into<String>, host: impl Into<String>, key: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            key: key.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// `user@host`
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Options for non-interactive key authentication
    ///
    /// Unknown host keys are accepted on first contact and pinned afterwards.
    pub fn key_auth_args(&self) -> Vec<String> {
        vec![
            "-i".to_string(),
            self.key.to_string_lossy().to_string(),
            "-o".to_string(),
            "IdentitiesOnly=yes".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ]
    }

    /// Run a shell snippet on the remote host
    pub fn command(&self, remote_script: &str) -> CommandSpec {
        CommandSpec::new("ssh")
            .args(self.key_auth_args())
            .arg(self.destination())
            .arg("--")
            .arg(remote_script)
    }

    /// The trivial authenticated command used to test key auth
    pub fn auth_check(&self) -> CommandSpec {
        self.command("true").timeout(self.connect_timeout + Duration::from_secs(5))
    }
}

/// Quote a path or word for a POSIX shell on the remote side
pub fn sh_quote(word: &str) -> String {
    shell_words::quote(word).into_owned()
}

/// Quote a path for a POSIX shell
pub fn sh_quote_path(path: &Path) -> String {
    sh_quote(&path.to_string_lossy())
}
