//! devlaunch - per-user development containers on a local or remote Docker engine

mod commands;
mod prompt;

use clap::{Parser, Subcommand};
use commands::{SessionArgs, Settings, StartOptions};
use devlaunch_config::GlobalConfig;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "devlaunch")]
#[command(author, version, about = "Remote Environment Orchestrator", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use this config file instead of the default one
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the image if needed and start a session container
    Start {
        #[command(flatten)]
        session: SessionArgs,
        /// Repository to work on (defaults to defaults.repo)
        #[arg(long)]
        repo: Option<String>,
        /// Host port to publish (remote engines only)
        #[arg(long, value_parser = clap::value_parser!(u16).range(1024..))]
        port: Option<u16>,
        /// Keep output and synthpop data in named volumes
        #[arg(long)]
        volumes: bool,
        /// Rebuild the image even if it exists
        #[arg(long)]
        rebuild: bool,
        /// Apply the high-compute CPU and memory limits
        #[arg(long)]
        high_compute: bool,
        /// Service password (prompted for when omitted)
        #[arg(long, env = "DEVLAUNCH_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Stop a session container and look for uncommitted changes
    Stop {
        #[command(flatten)]
        session: SessionArgs,
        /// Repository of the session (defaults to defaults.repo)
        #[arg(long)]
        repo: Option<String>,
        /// Skip change detection after stopping
        #[arg(long)]
        no_git: bool,
    },

    /// Show containers, used ports and this session's state
    Status {
        #[command(flatten)]
        session: SessionArgs,
        /// Repository of the session to report on
        #[arg(long)]
        repo: Option<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// List repositories available on the engine's host
    Repos {
        #[command(flatten)]
        session: SessionArgs,
    },

    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => GlobalConfig::load_from(path)?,
        None => GlobalConfig::load()?,
    };
    let debug = cli.verbose || config.defaults.debug;

    // Initialize logging
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    // Config command doesn't need an engine
    if let Commands::Config = cli.command {
        return commands::config(&config, cli.config.as_deref());
    }

    let settings = Settings::new(config, debug)?;

    match cli.command {
        Commands::Start {
            session,
            repo,
            port,
            volumes,
            rebuild,
            high_compute,
            password,
        } => {
            let options = StartOptions {
                repo,
                port,
                volumes,
                rebuild,
                high_compute,
                password,
            };
            commands::start(&settings, &session, options).await?;
        }
        Commands::Stop {
            session,
            repo,
            no_git,
        } => {
            commands::stop(&settings, &session, repo, !no_git).await?;
        }
        Commands::Status {
            session,
            repo,
            json,
        } => {
            commands::status(&settings, &session, repo, json).await?;
        }
        Commands::Repos { session } => {
            commands::repos(&settings, &session).await?;
        }
        Commands::Config => unreachable!(), // Handled above
    }

    Ok(())
}
