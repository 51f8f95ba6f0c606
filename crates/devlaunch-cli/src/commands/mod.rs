//! CLI command implementations

mod lifecycle;
mod manage;

use crate::prompt::TerminalInteraction;
use anyhow::{anyhow, Result};
use clap::Args;
use devlaunch_config::GlobalConfig;
use devlaunch_core::{Location, Workflow, WorkflowContext};
use devlaunch_provider::TokioRunner;
use std::path::PathBuf;
use std::sync::Arc;

pub use lifecycle::*;
pub use manage::*;

/// Who the session is for and where the engine runs
#[derive(Args, Debug, Clone, Default)]
pub struct SessionArgs {
    /// Session user (defaults to defaults.username, then $USER)
    #[arg(short, long)]
    pub user: Option<String>,

    /// Host running the Docker engine (defaults to remote.host)
    #[arg(long, conflicts_with = "local")]
    pub remote: Option<String>,

    /// Use the local engine even if remote.host is configured
    #[arg(long)]
    pub local: bool,

    /// Account on the remote host (defaults to remote.user, then the session user)
    #[arg(long)]
    pub remote_user: Option<String>,
}

impl SessionArgs {
    fn username(&self, config: &GlobalConfig) -> Result<String> {
        self.user
            .clone()
            .or_else(|| config.defaults.username.clone())
            .or_else(|| std::env::var("USER").ok())
            .or_else(|| std::env::var("USERNAME").ok())
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| anyhow!("No user given (use --user or set defaults.username)"))
    }

    fn location(&self, config: &GlobalConfig) -> Location {
        if self.local {
            return Location::Local;
        }
        match self.remote.clone().or_else(|| config.remote.host.clone()) {
            Some(host) if !host.trim().is_empty() => Location::Remote {
                host: host.trim().to_string(),
            },
            _ => Location::Local,
        }
    }
}

/// Process-wide settings shared by every command
pub struct Settings {
    pub config: GlobalConfig,
    pub data_dir: PathBuf,
    pub debug: bool,
}

impl Settings {
    pub fn new(config: GlobalConfig, debug: bool) -> Result<Self> {
        let data_dir = GlobalConfig::data_dir()?;
        Ok(Self {
            config,
            data_dir,
            debug,
        })
    }

    fn repo(&self, repo: Option<String>) -> Result<String> {
        repo.or_else(|| self.config.defaults.repo.clone())
            .ok_or_else(|| anyhow!("No repository given (use --repo or set defaults.repo)"))
    }
}

/// Create the workflow for `args` and resolve connectivity
async fn connect(settings: &Settings, args: &SessionArgs) -> Result<Workflow> {
    let username = args.username(&settings.config)?;
    let location = args.location(&settings.config);

    let ctx = WorkflowContext::new(
        settings.config.clone(),
        Arc::new(TokioRunner::new()),
        settings.data_dir.clone(),
    )
    .with_debug(settings.debug);
    let mut workflow = Workflow::new(ctx, Arc::new(TerminalInteraction::new()), &username, location)?;

    if let Some(remote_user) = args.remote_user.as_deref().map(str::trim) {
        if !remote_user.is_empty() {
            workflow.state_mut().identity.remote_user = remote_user.to_string();
        }
    }

    workflow.connect().await?;
    Ok(workflow)
}

fn describe(location: &Location) -> String {
    match location {
        Location::Local => "the local engine".to_string(),
        Location::Remote { host } => host.clone(),
    }
}
