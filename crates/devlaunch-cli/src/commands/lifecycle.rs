//! Lifecycle commands: start, stop

use anyhow::Result;
use devlaunch_core::{GitOutcome, Location};

use super::{connect, describe, SessionArgs, Settings};

/// Options of `devlaunch start`
#[derive(Debug, Default)]
pub struct StartOptions {
    pub repo: Option<String>,
    pub port: Option<u16>,
    pub volumes: bool,
    pub rebuild: bool,
    pub high_compute: bool,
    pub password: Option<String>,
}

/// Start a session container
pub async fn start(settings: &Settings, args: &SessionArgs, options: StartOptions) -> Result<()> {
    let repo = settings.repo(options.repo)?;
    let mut workflow = connect(settings, args).await?;
    workflow.select_repo(&repo)?;

    let state = workflow.state_mut();
    state.ports.requested = options.port;
    state.flags.use_volumes = options.volumes;
    state.flags.rebuild = options.rebuild;
    state.flags.high_compute = options.high_compute;
    if options.password.is_some() {
        state.identity.password = options.password;
    }

    let container = workflow.state().container_name()?;
    let location = workflow.state().location.clone();
    println!("Starting '{}' on {}...", container, describe(&location));

    let outcome = workflow.start().await?;
    if outcome.build.built {
        println!("Built image {}", outcome.build.image);
    }
    if let Some(volumes) = &outcome.volumes {
        println!("Using volumes {} and {}", volumes.output, volumes.synthpop);
    }

    let host = match &location {
        Location::Local => "localhost",
        Location::Remote { host } => host.as_str(),
    };
    println!("Started '{}'", container);
    println!(
        "Open http://{}:{} and sign in as {}",
        host, outcome.port, settings.config.docker.service_user
    );

    Ok(())
}

/// Stop a session container, then offer to commit what changed
pub async fn stop(
    settings: &Settings,
    args: &SessionArgs,
    repo: Option<String>,
    detect_changes: bool,
) -> Result<()> {
    let repo = settings.repo(repo)?;
    let mut workflow = connect(settings, args).await?;
    workflow.select_repo(&repo)?;

    let container = workflow.state().container_name()?;
    println!("Stopping '{}'...", container);
    let report = workflow.stop(detect_changes).await?;

    if report.stop.container_stopped {
        println!("Stopped '{}'", report.container);
    } else {
        println!("'{}' was not running", report.container);
    }
    for volume in &report.stop.volumes_synced {
        println!("Copied {} back to the host", volume);
    }

    match report.git {
        None => {}
        Some(GitOutcome::Clean) => println!("No uncommitted changes"),
        Some(GitOutcome::Declined(summary)) => {
            println!(
                "Left {} change(s) uncommitted in {}",
                summary.changes.len(),
                summary.repo_path
            );
        }
        Some(GitOutcome::Committed {
            summary,
            pushed_with,
        }) => {
            println!("Committed changes in {}", summary.repo_path);
            if let Some(method) = pushed_with {
                println!("Pushed {} via {}", summary.branch.as_deref().unwrap_or("HEAD"), method);
            }
        }
    }

    Ok(())
}
