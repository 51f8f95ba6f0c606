//! Test support utilities for devlaunch-core
//!
//! Provides a scripted [`CommandRunner`] and a scripted [`Interaction`] so the
//! workflow can be exercised without docker, ssh or git installed.

use crate::git::{ChangeSummary, CommitDecision};
use crate::interaction::Interaction;
use crate::ssh::OneTimePassword;
use crate::Result;
use async_trait::async_trait;
use devlaunch_provider::{CommandOutput, CommandRunner, CommandSpec, ProviderError};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

struct Rule {
    pattern: String,
    output: CommandOutput,
}

#[derive(Default)]
struct MockState {
    calls: Vec<CommandSpec>,
    once: VecDeque<Rule>,
    sticky: Vec<Rule>,
    unavailable: HashSet<String>,
}

/// Scripted command runner
///
/// Responses are chosen by substring match against the raw command line
/// (`program` followed by the arguments joined with spaces). One-shot rules
/// are consulted before sticky ones; within each group the longest matching
/// pattern wins. Among sticky rules with equal patterns the latest one wins.
/// Unmatched commands succeed with empty output.
#[derive(Clone, Default)]
pub struct MockRunner {
    state: Arc<Mutex<MockState>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Answer every matching command with `output`
    pub fn on(&self, pattern: &str, output: CommandOutput) -> &Self {
        self.lock().sticky.push(Rule {
            pattern: pattern.to_string(),
            output,
        });
        self
    }

    /// Answer the next matching command with `output`
    pub fn once(&self, pattern: &str, output: CommandOutput) -> &Self {
        self.lock().once.push_back(Rule {
            pattern: pattern.to_string(),
            output,
        });
        self
    }

    /// Make `program` look absent from PATH
    pub fn set_unavailable(&self, program: &str) -> &Self {
        self.lock().unavailable.insert(program.to_string());
        self
    }

    /// Every command run so far
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.lock().calls.clone()
    }

    /// Raw command lines run so far
    pub fn lines(&self) -> Vec<String> {
        self.lock().calls.iter().map(raw_line).collect()
    }

    /// How many commands matched `pattern`
    pub fn count(&self, pattern: &str) -> usize {
        self.lines().iter().filter(|l| l.contains(pattern)).count()
    }

    /// Index of the first command matching `pattern`
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.lines().iter().position(|l| l.contains(pattern))
    }

    /// Commands matching `pattern`
    pub fn find(&self, pattern: &str) -> Vec<CommandSpec> {
        self.lock()
            .calls
            .iter()
            .filter(|c| raw_line(c).contains(pattern))
            .cloned()
            .collect()
    }
}

/// `program args...` without shell quoting
pub fn raw_line(spec: &CommandSpec) -> String {
    std::iter::once(spec.program.as_str())
        .chain(spec.args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

fn longest_match<'a>(rules: impl Iterator<Item = (usize, &'a Rule)>, line: &str) -> Option<usize> {
    let mut best: Option<(usize, usize)> = None;
    for (idx, rule) in rules {
        if line.contains(&rule.pattern)
            && best.map_or(true, |(_, len)| rule.pattern.len() > len)
        {
            best = Some((idx, rule.pattern.len()));
        }
    }
    best.map(|(idx, _)| idx)
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, spec: &CommandSpec) -> devlaunch_provider::Result<CommandOutput> {
        let line = raw_line(spec);
        let mut state = self.lock();
        state.calls.push(spec.clone());

        if state.unavailable.contains(&spec.program) {
            return Err(ProviderError::ToolNotFound(spec.program.clone()));
        }
        if let Some(idx) = longest_match(state.once.iter().enumerate(), &line) {
            if let Some(rule) = state.once.remove(idx) {
                return Ok(rule.output);
            }
        }
        if let Some(idx) = longest_match(state.sticky.iter().enumerate().rev(), &line) {
            return Ok(state.sticky[idx].output.clone());
        }
        Ok(CommandOutput::ok(""))
    }

    fn is_available(&self, program: &str) -> bool {
        !self.lock().unavailable.contains(program)
    }
}

/// Interaction answering from fixed values
#[derive(Default)]
pub struct ScriptedInteraction {
    pub remote_password: Option<String>,
    pub session_password: Option<String>,
    pub decision: Option<CommitDecision>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedInteraction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_remote_password(mut self, password: &str) -> Self {
        self.remote_password = Some(password.to_string());
        self
    }

    pub fn with_session_password(mut self, password: &str) -> Self {
        self.session_password = Some(password.to_string());
        self
    }

    pub fn with_decision(mut self, message: &str, push: bool) -> Self {
        self.decision = Some(CommitDecision {
            message: message.to_string(),
            push,
        });
        self
    }

    /// Which prompts were shown, in order
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, prompt: &str) {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.to_string());
    }
}

impl Interaction for ScriptedInteraction {
    fn remote_password(&self, _user: &str, _host: &str) -> Result<Option<OneTimePassword>> {
        self.record("remote_password");
        Ok(self.remote_password.clone().map(OneTimePassword::new))
    }

    fn session_password(&self, _container: &str) -> Result<Option<String>> {
        self.record("session_password");
        Ok(self.session_password.clone())
    }

    fn decide_commit(&self, _summary: &ChangeSummary) -> Result<Option<CommitDecision>> {
        self.record("decide_commit");
        Ok(self.decision.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_once_rules_take_precedence_and_are_consumed() {
        let runner = MockRunner::new();
        runner.on("docker info", CommandOutput::ok("24.0"));
        runner.once("docker info", CommandOutput::failed(1, "down"));

        let spec = CommandSpec::new("docker").args(["info"]);
        assert!(!runner.run(&spec).await.unwrap().success());
        assert!(runner.run(&spec).await.unwrap().success());
        assert_eq!(runner.count("docker info"), 2);
    }

    #[tokio::test]
    async fn test_longest_pattern_wins() {
        let runner = MockRunner::new();
        runner.on("docker", CommandOutput::failed(1, "generic"));
        runner.on("docker image inspect", CommandOutput::ok("sha"));
        let out = runner
            .run(&CommandSpec::new("docker").args(["image", "inspect", "x"]))
            .await
            .unwrap();
        assert_eq!(out.stdout, "sha");
    }

    #[tokio::test]
    async fn test_unavailable_program() {
        let runner = MockRunner::new();
        runner.set_unavailable("plink");
        assert!(!runner.is_available("plink"));
        assert!(runner.is_available("ssh"));
        let err = runner.run(&CommandSpec::new("plink")).await.unwrap_err();
        assert!(matches!(err, ProviderError::ToolNotFound(_)));
    }
}
