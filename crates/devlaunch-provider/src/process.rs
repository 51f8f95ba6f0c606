//! External process execution
//!
//! Every docker, ssh and git call goes through [`CommandRunner`] so the
//! orchestration logic can be exercised without real tools installed.

use crate::{ProviderError, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// A fully described external command
#[derive(Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment variables for the child process
    pub env: Vec<(String, String)>,
    /// Bytes written to the child's stdin, then stdin is closed
    pub stdin: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
    /// Values that must never appear in logs or error messages
    pub redactions: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn envs(mut self, vars: &[(String, String)]) -> Self {
        self.env.extend(vars.iter().cloned());
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Mark a value as secret so it is masked in [`CommandSpec::display`]
    pub fn redact(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        if !secret.is_empty() {
            self.redactions.push(secret);
        }
        self
    }

    /// Shell-quoted command line with secrets masked
    pub fn display(&self) -> String {
        let mut words = Vec::with_capacity(self.args.len() + 1);
        words.push(self.program.as_str());
        words.extend(self.args.iter().map(String::as_str));
        let line = shell_words::join(words);
        self.mask(&line)
    }

    /// Replace every registered secret in `text` with `****`
    pub fn mask(&self, text: &str) -> String {
        self.redactions
            .iter()
            .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), "****"))
    }
}

impl std::fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let env_keys: Vec<&str> = self.env.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("CommandSpec")
            .field("command", &self.display())
            .field("env", &env_keys)
            .field("stdin", &self.stdin.as_ref().map(Vec::len))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Captured result of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, -1 when killed by a signal
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// A successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed output with the given exit code and stderr
    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// stdout followed by stderr, trimmed
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr).trim().to_string()
    }

    /// Turn a non-zero exit into [`ProviderError::CommandFailed`]
    pub fn into_result(self, spec: &CommandSpec) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(ProviderError::CommandFailed {
                command: spec.display(),
                status: self.status,
                output: spec.mask(&self.combined()),
            })
        }
    }
}

/// Executes external commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. A non-zero exit is returned as output, not as an error.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Whether `program` can be found on PATH
    fn is_available(&self, program: &str) -> bool;

    /// Run and fail on a non-zero exit
    async fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let output = self.run(spec).await?;
        output.into_result(spec)
    }
}

/// [`CommandRunner`] backed by `tokio::process`
#[derive(Debug, Clone, Default)]
pub struct TokioRunner;

impl TokioRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for TokioRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        tracing::debug!("Running: {}", spec.display());

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProviderError::ToolNotFound(spec.program.clone())
            } else {
                ProviderError::SpawnError {
                    program: spec.program.clone(),
                    source: e,
                }
            }
        })?;

        if let (Some(input), Some(mut stdin)) = (spec.stdin.as_ref(), child.stdin.take()) {
            stdin.write_all(input).await?;
            stdin.shutdown().await?;
        }

        let output = match spec.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| ProviderError::Timeout {
                    command: spec.display(),
                    timeout: limit,
                })??,
            None => child.wait_with_output().await?,
        };

        let result = CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        if !result.success() {
            tracing::debug!(
                "`{}` exited with {}: {}",
                spec.display(),
                result.status,
                spec.mask(result.stderr.trim())
            );
        }
        Ok(result)
    }

    fn is_available(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_quotes_and_masks() {
        let spec = CommandSpec::new("plink")
            .args(["-pw", "s3cret", "host1", "echo hello world"])
            .redact("s3cret");
        assert_eq!(
            spec.display(),
            "plink -pw **** host1 'echo hello world'"
        );
    }

    #[test]
    fn test_debug_hides_env_values() {
        let spec = CommandSpec::new("docker").env("PASSWORD", "hunter2");
        let rendered = format!("{:?}", spec);
        assert!(rendered.contains("PASSWORD"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_empty_redaction_ignored() {
        let spec = CommandSpec::new("echo").arg("x").redact("");
        assert_eq!(spec.display(), "echo x");
    }

    #[test]
    fn test_into_result_masks_output() {
        let spec = CommandSpec::new("ssh").redact("pw1");
        let err = CommandOutput::failed(255, "bad password pw1")
            .into_result(&spec)
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("255"));
        assert!(!msg.contains("pw1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tokio_runner_captures_output_and_stdin() {
        let runner = TokioRunner::new();
        let spec = CommandSpec::new("sh")
            .args(["-c", "cat; echo err >&2; exit 3"])
            .stdin("piped-in");
        let out = runner.run(&spec).await.unwrap();
        assert_eq!(out.status, 3);
        assert_eq!(out.stdout, "piped-in");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tokio_runner_missing_program() {
        let runner = TokioRunner::new();
        let err = runner
            .run(&CommandSpec::new("definitely-not-a-real-binary-xyz"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::ToolNotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tokio_runner_timeout() {
        let runner = TokioRunner::new();
        let spec = CommandSpec::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(100));
        let err = runner.run(&spec).await.unwrap_err();
        assert!(matches!(err, ProviderError::Timeout { .. }));
    }
}
