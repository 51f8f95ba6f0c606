//! Shell access to the Docker engine's host
//!
//! Files the engine mounts (repositories, project config, session records,
//! synced keys) live on the engine's host. [`HostShell`] runs POSIX shell
//! snippets there: through `sh -c` locally, or over key-authenticated ssh.

use crate::Result;
use devlaunch_provider::{sh_quote, CommandOutput, CommandRunner, CommandSpec, SshTarget};
use std::sync::Arc;

/// Exit code the file helpers use for "does not exist"
const MISSING: i32 = 44;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKind {
    Local,
    Remote(SshTarget),
}

#[derive(Clone)]
pub struct HostShell {
    runner: Arc<dyn CommandRunner>,
    kind: HostKind,
}

impl HostShell {
    pub fn local(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            kind: HostKind::Local,
        }
    }

    pub fn remote(runner: Arc<dyn CommandRunner>, target: SshTarget) -> Self {
        Self {
            runner,
            kind: HostKind::Remote(target),
        }
    }

    pub fn kind(&self) -> &HostKind {
        &self.kind
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.kind, HostKind::Remote(_))
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    /// Command spec running `script` on the host
    pub fn spec(&self, script: &str) -> CommandSpec {
        match &self.kind {
            HostKind::Local => CommandSpec::new("sh").args(["-c", script]),
            HostKind::Remote(target) => target.command(script),
        }
    }

    /// Run a snippet; a non-zero exit is returned as output
    pub async fn run(&self, script: &str) -> Result<CommandOutput> {
        Ok(self.runner.run(&self.spec(script)).await?)
    }

    /// Run a snippet and fail on a non-zero exit
    pub async fn run_checked(&self, script: &str) -> Result<CommandOutput> {
        Ok(self.runner.run_checked(&self.spec(script)).await?)
    }

    /// Run a snippet with `input` on its stdin
    pub async fn run_with_stdin(&self, script: &str, input: Vec<u8>) -> Result<CommandOutput> {
        let spec = self.spec(script).stdin(input);
        Ok(self.runner.run_checked(&spec).await?)
    }

    /// Contents of a file, `None` when it does not exist
    pub async fn read_file(&self, path: &str) -> Result<Option<String>> {
        let p = sh_quote(path);
        let script = format!(
            "if [ -f {p} ]; then cat {p}; else exit {code}; fi",
            p = p,
            code = MISSING
        );
        let spec = self.spec(&script);
        let output = self.runner.run(&spec).await?;
        if output.status == MISSING {
            return Ok(None);
        }
        Ok(Some(output.into_result(&spec)?.stdout))
    }

    /// Write a file through stdin, creating parent directories
    ///
    /// The content never appears on a command line.
    pub async fn write_file(&self, path: &str, content: &[u8], mode: u32) -> Result<()> {
        let p = sh_quote(path);
        let dir = sh_quote(parent_dir(path));
        let script = format!(
            "umask 077 && mkdir -p {dir} && cat > {p} && chmod {mode:o} {p}",
            dir = dir,
            p = p,
            mode = mode
        );
        self.run_with_stdin(&script, content.to_vec()).await?;
        Ok(())
    }

    /// Remove a file. Returns `false` when it did not exist.
    pub async fn remove_file(&self, path: &str) -> Result<bool> {
        let p = sh_quote(path);
        let script = format!(
            "if [ -e {p} ]; then rm -f {p}; else exit {code}; fi",
            p = p,
            code = MISSING
        );
        let spec = self.spec(&script);
        let output = self.runner.run(&spec).await?;
        if output.status == MISSING {
            return Ok(false);
        }
        output.into_result(&spec)?;
        Ok(true)
    }

    /// Names of the immediate subdirectories of `base`, sorted
    ///
    /// A missing base directory yields an empty list.
    pub async fn list_dirs(&self, base: &str) -> Result<Vec<String>> {
        let script = format!(
            "cd {} 2>/dev/null || exit {}; for d in */; do [ -d \"$d\" ] && printf '%s\\n' \"${{d%/}}\"; done; true",
            sh_quote(base),
            MISSING
        );
        let spec = self.spec(&script);
        let output = self.runner.run(&spec).await?;
        if output.status == MISSING {
            tracing::warn!("Repository base {} does not exist", base);
            return Ok(Vec::new());
        }
        let output = output.into_result(&spec)?;
        let mut dirs: Vec<String> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && *l != "*")
            .map(str::to_string)
            .collect();
        dirs.sort();
        Ok(dirs)
    }

    /// Whether a directory exists
    pub async fn dir_exists(&self, path: &str) -> Result<bool> {
        let output = self.run(&format!("[ -d {} ]", sh_quote(path))).await?;
        Ok(output.success())
    }

    /// Whether a directory is missing or has no entries
    pub async fn dir_is_empty(&self, path: &str) -> Result<bool> {
        let script = format!("[ -z \"$(ls -A {} 2>/dev/null)\" ]", sh_quote(path));
        let output = self.run(&script).await?;
        Ok(output.success())
    }
}

/// Join POSIX paths; an absolute `rel` replaces `base`
pub fn posix_join(base: &str, rel: &str) -> String {
    if rel.starts_with('/') || base.is_empty() {
        return rel.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), rel.trim_start_matches("./"))
}

fn parent_dir(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) => "/",
        Some((dir, _)) => dir,
        None => ".",
    }
}
