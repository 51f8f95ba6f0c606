//! Terminal prompts answering the workflow's decision requests

use devlaunch_core::{
    ChangeSummary, CommitDecision, CoreError, Interaction, OneTimePassword, Result,
};
use dialoguer::{theme::ColorfulTheme, Confirm, Input, Password};
use std::io::IsTerminal;

/// Prompts on the terminal; declines everything when stdin is not a TTY
pub struct TerminalInteraction {
    interactive: bool,
}

impl TerminalInteraction {
    pub fn new() -> Self {
        Self {
            interactive: std::io::stdin().is_terminal(),
        }
    }
}

fn prompt_error(e: dialoguer::Error) -> CoreError {
    CoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
}

/// Human-readable summary shown before the commit prompt
pub fn format_summary(summary: &ChangeSummary) -> String {
    let mut out = format!(
        "Uncommitted changes in {} (branch {}):",
        summary.repo_path,
        summary.branch.as_deref().unwrap_or("unknown")
    );
    for change in &summary.changes {
        out.push_str(&format!("\n  {:<2} {}", change.status, change.path));
    }
    if !summary.new_commits.is_empty() {
        out.push_str(&format!(
            "\n{} commit(s) since the session started:",
            summary.new_commits.len()
        ));
        for commit in &summary.new_commits {
            out.push_str(&format!("\n  {}", commit));
        }
    }
    out
}

impl Interaction for TerminalInteraction {
    fn remote_password(&self, user: &str, host: &str) -> Result<Option<OneTimePassword>> {
        if !self.interactive {
            tracing::warn!("Not a terminal, cannot ask for the password of {}@{}", user, host);
            return Ok(None);
        }
        eprintln!(
            "Key authentication to {}@{} is not set up. The password is used once to install the key.",
            user, host
        );
        let password = Password::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("Password for {}@{}", user, host))
            .allow_empty_password(true)
            .interact()
            .map_err(prompt_error)?;
        let password = OneTimePassword::new(password);
        Ok((!password.is_empty()).then_some(password))
    }

    fn session_password(&self, container: &str) -> Result<Option<String>> {
        if !self.interactive {
            return Ok(None);
        }
        let password = Password::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("Service password for {}", container))
            .with_confirmation("Repeat password", "Passwords do not match")
            .interact()
            .map_err(prompt_error)?;
        Ok(Some(password).filter(|p| !p.is_empty()))
    }

    fn decide_commit(&self, summary: &ChangeSummary) -> Result<Option<CommitDecision>> {
        eprintln!("{}", format_summary(summary));
        if !self.interactive {
            return Ok(None);
        }

        let theme = ColorfulTheme::default();
        let commit = Confirm::with_theme(&theme)
            .with_prompt("Commit these changes?")
            .default(false)
            .interact()
            .map_err(prompt_error)?;
        if !commit {
            return Ok(None);
        }

        let message: String = Input::with_theme(&theme)
            .with_prompt("Commit message")
            .validate_with(|input: &String| -> std::result::Result<(), &str> {
                if input.trim().is_empty() {
                    Err("The commit message cannot be empty")
                } else {
                    Ok(())
                }
            })
            .interact_text()
            .map_err(prompt_error)?;

        let push = summary.origin.is_some()
            && Confirm::with_theme(&theme)
                .with_prompt("Push to origin?")
                .default(true)
                .interact()
                .map_err(prompt_error)?;

        Ok(Some(CommitDecision { message, push }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devlaunch_core::FileChange;

    #[test]
    fn test_summary_lists_changes_and_commits() {
        let summary = ChangeSummary {
            repo_path: "/srv/repos/Foo".into(),
            branch: Some("main".into()),
            origin: None,
            changes: vec![
                FileChange {
                    status: "M".into(),
                    path: "analysis.R".into(),
                },
                FileChange {
                    status: "??".into(),
                    path: "notes.md".into(),
                },
            ],
            new_commits: vec!["abc123 Tune model".into()],
        };
        let text = format_summary(&summary);
        assert!(text.starts_with("Uncommitted changes in /srv/repos/Foo (branch main):"));
        assert!(text.contains("\n  M  analysis.R"));
        assert!(text.contains("\n  ?? notes.md"));
        assert!(text.contains("1 commit(s) since the session started"));
    }

    #[test]
    fn test_summary_without_branch() {
        let text = format_summary(&ChangeSummary::default());
        assert_eq!(text, "Uncommitted changes in  (branch unknown):");
    }
}
