//! Repository change detection after a session
//!
//! Runs git on the engine's host (where the repository is mounted from),
//! reports uncommitted changes and, when the caller agrees, commits and
//! pushes them. Pushes always go over SSH with strict host-key checking
//! against the synced `known_hosts`.

use crate::chain::{Attempt, FallbackChain, Strategy};
use crate::host::HostShell;
use crate::interaction::Interaction;
use crate::state::GitBaseline;
use crate::{CoreError, Result};
use async_trait::async_trait;
use chrono::Utc;
use devlaunch_provider::sh_quote;

/// Exit code the agent push uses when no agent could be started
const AGENT_UNAVAILABLE: i32 = 97;
const COMMAND_NOT_FOUND: i32 = 127;

/// One line of `git status --porcelain`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    /// Two-letter status code, e.g. ` M` or `??`
    pub status: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChangeSummary {
    pub repo_path: String,
    pub branch: Option<String>,
    pub origin: Option<String>,
    pub changes: Vec<FileChange>,
    /// `git log --oneline` entries made since the baseline commit
    pub new_commits: Vec<String>,
}

impl ChangeSummary {
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitDecision {
    pub message: String,
    pub push: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitOutcome {
    Clean,
    /// Changes exist but the caller chose not to commit
    Declined(ChangeSummary),
    Committed {
        summary: ChangeSummary,
        /// Push method that succeeded, `None` when not pushed
        pushed_with: Option<&'static str>,
    },
}

/// Parse `git status --porcelain` output
pub fn parse_porcelain(output: &str) -> Vec<FileChange> {
    output
        .lines()
        .filter(|l| l.len() > 3)
        .map(|l| FileChange {
            status: l[..2].to_string(),
            path: l[3..].trim().to_string(),
        })
        .collect()
}

/// Turn an HTTPS origin into its SSH form; other URLs are returned unchanged
///
/// `https://github.com/org/repo.git` becomes `git@github.com:org/repo.git`.
pub fn normalize_push_url(url: &str) -> String {
    let url = url.trim();
    let rest = match url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
    {
        Some(rest) => rest,
        None => return url.to_string(),
    };
    let Some((authority, path)) = rest.split_once('/') else {
        return url.to_string();
    };
    let host = authority.rsplit('@').next().unwrap_or(authority);
    let host = host.split(':').next().unwrap_or(host);
    let path = path.trim_end_matches('/');
    let suffix = if path.ends_with(".git") { "" } else { ".git" };
    format!("git@{}:{}{}", host, path, suffix)
}

pub struct GitChangeDetector {
    shell: HostShell,
    /// Private key on the repository's host
    key: Option<String>,
    known_hosts: Option<String>,
}

impl GitChangeDetector {
    pub fn new(shell: HostShell, key: Option<String>, known_hosts: Option<String>) -> Self {
        Self {
            shell,
            key,
            known_hosts,
        }
    }

    fn git(repo: &str, args: &str) -> String {
        format!("git -C {} {}", sh_quote(repo), args)
    }

    /// Current commit and dirty flag, `None` when git cannot be run
    pub async fn capture_baseline(&self, repo: &str) -> Option<GitBaseline> {
        let status = match self.shell.run(&Self::git(repo, "status --porcelain")).await {
            Ok(out) if out.success() => out,
            Ok(out) => {
                tracing::debug!("No git baseline for {}: {}", repo, out.combined());
                return None;
            }
            Err(e) => {
                tracing::debug!("No git baseline for {}: {}", repo, e);
                return None;
            }
        };
        let commit = match self.shell.run(&Self::git(repo, "rev-parse HEAD")).await {
            Ok(out) if out.success() => Some(out.stdout.trim().to_string()).filter(|c| !c.is_empty()),
            _ => None,
        };
        Some(GitBaseline {
            commit,
            dirty: !status.stdout.trim().is_empty(),
            captured_at: Utc::now(),
        })
    }

    /// Changes, branch and origin of `repo`
    pub async fn inspect(&self, repo: &str, baseline: Option<&GitBaseline>) -> Result<ChangeSummary> {
        let status = self.shell.run(&Self::git(repo, "status --porcelain")).await?;
        if status.status == COMMAND_NOT_FOUND {
            return Err(CoreError::FatalPrerequisite("git".to_string()));
        }
        if !status.success() {
            return Err(CoreError::git("git status", status.combined()));
        }

        let branch = self
            .shell
            .run(&Self::git(repo, "rev-parse --abbrev-ref HEAD"))
            .await?;
        let origin = self
            .shell
            .run(&Self::git(repo, "remote get-url origin"))
            .await?;

        let mut new_commits = Vec::new();
        if let Some(base) = baseline.and_then(|b| b.commit.as_deref()) {
            let log = self
                .shell
                .run(&Self::git(repo, &format!("log --oneline {}..HEAD", sh_quote(base))))
                .await?;
            if log.success() {
                new_commits = log.stdout.lines().map(str::to_string).collect();
            }
        }

        Ok(ChangeSummary {
            repo_path: repo.to_string(),
            branch: branch
                .success()
                .then(|| branch.stdout.trim().to_string())
                .filter(|b| !b.is_empty()),
            origin: origin
                .success()
                .then(|| origin.stdout.trim().to_string())
                .filter(|o| !o.is_empty()),
            changes: parse_porcelain(&status.stdout),
            new_commits,
        })
    }

    /// Stage everything and commit
    pub async fn commit(&self, repo: &str, message: &str) -> Result<()> {
        if message.trim().is_empty() {
            return Err(CoreError::Validation("commit message is empty".to_string()));
        }
        let script = format!(
            "{} && {}",
            Self::git(repo, "add -A"),
            Self::git(repo, &format!("commit -q -m {}", sh_quote(message)))
        );
        let output = self.shell.run(&script).await?;
        match output.status {
            0 => Ok(()),
            COMMAND_NOT_FOUND => Err(CoreError::FatalPrerequisite("git".to_string())),
            _ => Err(CoreError::git("git commit", output.combined())),
        }
    }

    /// Push the current branch over SSH, returning the method that worked
    pub async fn push(&self, summary: &ChangeSummary) -> Result<&'static str> {
        let origin = summary
            .origin
            .as_deref()
            .ok_or_else(|| CoreError::Git("repository has no origin remote".to_string()))?;
        let branch = match summary.branch.as_deref() {
            Some(b) if b != "HEAD" => b,
            _ => return Err(CoreError::Git("cannot push a detached HEAD".to_string())),
        };
        let (key, known_hosts) = match (&self.key, &self.known_hosts) {
            (Some(k), Some(h)) => (k.clone(), h.clone()),
            _ => {
                return Err(CoreError::Git(
                    "no SSH key or known_hosts available for push".to_string(),
                ))
            }
        };

        let request = PushRequest {
            shell: self.shell.clone(),
            repo: summary.repo_path.clone(),
            url: normalize_push_url(origin),
            branch: branch.to_string(),
            key,
            known_hosts,
        };
        tracing::info!("Pushing {} to {}", request.branch, request.url);
        push_chain()
            .run(&request)
            .await
            .map(|ok| ok.strategy)
            .map_err(|e| CoreError::git("git push", e))
    }

    /// Inspect `repo` and, if it has changes, commit/push as the caller decides
    pub async fn detect(
        &self,
        repo: &str,
        baseline: Option<&GitBaseline>,
        interaction: &dyn Interaction,
    ) -> Result<GitOutcome> {
        let summary = self.inspect(repo, baseline).await?;
        if !summary.has_changes() {
            tracing::info!("No uncommitted changes in {}", repo);
            return Ok(GitOutcome::Clean);
        }
        tracing::info!("{} uncommitted change(s) in {}", summary.changes.len(), repo);

        let Some(decision) = interaction.decide_commit(&summary)? else {
            return Ok(GitOutcome::Declined(summary));
        };
        self.commit(repo, &decision.message).await?;
        tracing::info!("Committed changes in {}", repo);

        let pushed_with = if decision.push {
            Some(self.push(&summary).await?)
        } else {
            None
        };
        Ok(GitOutcome::Committed {
            summary,
            pushed_with,
        })
    }
}

/// Inputs shared by the push methods
pub struct PushRequest {
    pub shell: HostShell,
    pub repo: String,
    /// Already normalized to SSH
    pub url: String,
    pub branch: String,
    pub key: String,
    pub known_hosts: String,
}

impl PushRequest {
    fn push_command(&self, ssh_command: &str) -> String {
        format!(
            "GIT_SSH_COMMAND={} git -C {} push {} {}",
            sh_quote(ssh_command),
            sh_quote(&self.repo),
            sh_quote(&self.url),
            sh_quote(&self.branch)
        )
    }

    fn strict_host_options(&self) -> String {
        format!(
            "-o StrictHostKeyChecking=yes -o UserKnownHostsFile={}",
            sh_quote(&self.known_hosts)
        )
    }
}

fn classify(result: Result<devlaunch_provider::CommandOutput>) -> Attempt<()> {
    match result {
        Ok(out) if out.success() => Attempt::Done(()),
        Ok(out) if out.status == AGENT_UNAVAILABLE => {
            Attempt::Unavailable("ssh-agent could not be started".to_string())
        }
        Ok(out) => Attempt::Failed(format!("exit {}: {}", out.status, out.combined())),
        Err(e) => Attempt::Failed(e.to_string()),
    }
}

/// Push through a short-lived ssh-agent holding the session key
pub struct AgentPush;

#[async_trait]
impl Strategy<PushRequest, ()> for AgentPush {
    fn name(&self) -> &'static str {
        "ssh-agent"
    }

    async fn attempt(&self, req: &PushRequest) -> Attempt<()> {
        let ssh = format!("ssh {}", req.strict_host_options());
        let script = [
            format!(
                "eval \"$(ssh-agent -s)\" >/dev/null 2>&1 || exit {}",
                AGENT_UNAVAILABLE
            ),
            "trap 'ssh-agent -k >/dev/null 2>&1' EXIT".to_string(),
            format!(
                "ssh-add {} >/dev/null 2>&1 || exit {}",
                sh_quote(&req.key),
                AGENT_UNAVAILABLE
            ),
            req.push_command(&ssh),
        ]
        .join("\n");
        classify(req.shell.run(&script).await)
    }
}

/// Push with the key given directly to ssh
pub struct DirectPush;

#[async_trait]
impl Strategy<PushRequest, ()> for DirectPush {
    fn name(&self) -> &'static str {
        "direct ssh"
    }

    async fn attempt(&self, req: &PushRequest) -> Attempt<()> {
        let ssh = format!(
            "ssh -i {} -o IdentitiesOnly=yes {}",
            sh_quote(&req.key),
            req.strict_host_options()
        );
        classify(req.shell.run(&req.push_command(&ssh)).await)
    }
}

pub fn push_chain() -> FallbackChain<PushRequest, ()> {
    FallbackChain::new("git push").with(AgentPush).with(DirectPush)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockRunner, ScriptedInteraction};
    use devlaunch_provider::CommandOutput;
    use std::sync::Arc;

    fn detector(runner: Arc<MockRunner>) -> GitChangeDetector {
        GitChangeDetector::new(
            HostShell::local(runner),
            Some("/keys/id_ed25519_alice".to_string()),
            Some("/keys/known_hosts".to_string()),
        )
    }

    #[test]
    fn test_normalize_push_url() {
        assert_eq!(
            normalize_push_url("https://github.com/org/repo.git"),
            "git@github.com:org/repo.git"
        );
        assert_eq!(
            normalize_push_url("https://token@github.com/org/repo"),
            "git@github.com:org/repo.git"
        );
        assert_eq!(
            normalize_push_url("git@github.com:org/repo.git"),
            "git@github.com:org/repo.git"
        );
        assert_eq!(
            normalize_push_url("ssh://git@example.com/org/repo.git"),
            "ssh://git@example.com/org/repo.git"
        );
    }

    #[test]
    fn test_parse_porcelain() {
        let changes = parse_porcelain(" M src/main.R\n?? notes.txt\nR  a.R -> b.R\n");
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0].status, " M");
        assert_eq!(changes[0].path, "src/main.R");
        assert_eq!(changes[1].status, "??");
        assert_eq!(changes[2].path, "a.R -> b.R");
    }

    #[tokio::test]
    async fn test_baseline_is_best_effort() {
        let runner = Arc::new(MockRunner::new());
        runner.on("status --porcelain", CommandOutput::failed(127, "git: not found"));
        assert!(detector(runner).capture_baseline("/r").await.is_none());

        let runner = Arc::new(MockRunner::new());
        runner.on("rev-parse HEAD", CommandOutput::ok("abc123\n"));
        runner.on("status --porcelain", CommandOutput::ok(" M x\n"));
        let base = detector(runner).capture_baseline("/r").await.unwrap();
        assert_eq!(base.commit.as_deref(), Some("abc123"));
        assert!(base.dirty);
    }

    #[tokio::test]
    async fn test_clean_repo_asks_nothing() {
        let runner = Arc::new(MockRunner::new());
        let interaction = ScriptedInteraction::new().with_decision("msg", true);
        let outcome = detector(runner)
            .detect("/r", None, &interaction)
            .await
            .unwrap();
        assert_eq!(outcome, GitOutcome::Clean);
        assert!(interaction.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_push_normalizes_before_any_attempt() {
        let runner = Arc::new(MockRunner::new());
        runner.on("status --porcelain", CommandOutput::ok(" M x\n"));
        runner.on("rev-parse --abbrev-ref HEAD", CommandOutput::ok("main\n"));
        runner.on(
            "remote get-url origin",
            CommandOutput::ok("https://github.com/org/repo.git\n"),
        );
        let interaction = ScriptedInteraction::new().with_decision("update", true);
        let outcome = detector(runner.clone())
            .detect("/r", None, &interaction)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            GitOutcome::Committed {
                pushed_with: Some("ssh-agent"),
                ..
            }
        ));

        let pushes = runner.find(" push ");
        assert_eq!(pushes.len(), 1);
        let line = crate::test_support::raw_line(&pushes[0]);
        assert!(line.contains("git@github.com:org/repo.git"));
        assert!(!line.contains("https://"));
        assert!(line.contains("StrictHostKeyChecking=yes"));
        assert!(runner.position("commit -q -m") < runner.position(" push "));
    }

    #[tokio::test]
    async fn test_agent_failure_falls_back_to_direct() {
        let runner = Arc::new(MockRunner::new());
        runner.on("ssh-agent -s", CommandOutput::failed(AGENT_UNAVAILABLE, ""));
        let summary = ChangeSummary {
            repo_path: "/r".into(),
            branch: Some("main".into()),
            origin: Some("https://github.com/org/repo.git".into()),
            changes: vec![],
            new_commits: vec![],
        };
        let method = detector(runner.clone()).push(&summary).await.unwrap();
        assert_eq!(method, "direct ssh");
        let direct = runner.find("IdentitiesOnly=yes");
        assert_eq!(direct.len(), 1);
    }

    #[tokio::test]
    async fn test_both_push_methods_failing_is_git_error() {
        let runner = Arc::new(MockRunner::new());
        runner.on(" push ", CommandOutput::failed(128, "Permission denied (publickey)"));
        let summary = ChangeSummary {
            repo_path: "/r".into(),
            branch: Some("main".into()),
            origin: Some("git@github.com:org/repo.git".into()),
            ..Default::default()
        };
        let err = detector(runner.clone()).push(&summary).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Git);
        assert_eq!(runner.count(" push "), 2);
    }

    #[tokio::test]
    async fn test_detached_head_cannot_push() {
        let runner = Arc::new(MockRunner::new());
        let summary = ChangeSummary {
            repo_path: "/r".into(),
            branch: Some("HEAD".into()),
            origin: Some("git@github.com:org/repo.git".into()),
            ..Default::default()
        };
        assert!(detector(runner).push(&summary).await.is_err());
    }
}
