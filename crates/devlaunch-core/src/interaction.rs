//! Decisions the workflow needs from whoever is driving it
//!
//! The core never prompts on its own. When a phase needs a credential or a
//! commit decision it asks through this trait; the CLI answers with
//! terminal prompts, tests answer from a script.

use crate::git::{ChangeSummary, CommitDecision};
use crate::ssh::OneTimePassword;
use crate::Result;

pub trait Interaction: Send + Sync {
    /// Password for the remote account, used once to install the session key.
    /// `None` means the caller declined.
    fn remote_password(&self, user: &str, host: &str) -> Result<Option<OneTimePassword>>;

    /// Service password for a container about to start
    fn session_password(&self, container: &str) -> Result<Option<String>>;

    /// Whether to commit (and push) detected changes
    fn decide_commit(&self, summary: &ChangeSummary) -> Result<Option<CommitDecision>>;
}

/// Declines every request; used for non-interactive runs
#[derive(Debug, Clone, Copy, Default)]
pub struct NonInteractive;

impl Interaction for NonInteractive {
    fn remote_password(&self, _user: &str, _host: &str) -> Result<Option<OneTimePassword>> {
        Ok(None)
    }

    fn session_password(&self, _container: &str) -> Result<Option<String>> {
        Ok(None)
    }

    fn decide_commit(&self, _summary: &ChangeSummary) -> Result<Option<CommitDecision>> {
        Ok(None)
    }
}
