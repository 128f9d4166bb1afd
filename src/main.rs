use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod cmd;

#[derive(Parser)]
#[command(name = "treq")]
#[command(version, about = "Track request, script and test executions and stream their events")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the flow server
    Serve {
        /// Address to bind (overrides treq.toml and TREQ_HOST)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides treq.toml and TREQ_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Enable dev mode (CORS permissive for local UIs)
        #[arg(long)]
        dev: bool,
    },
    /// Run a script or test file on the server and follow its events
    Run {
        /// File to run
        path: String,

        /// Run as a test file
        #[arg(long)]
        test: bool,

        /// Runner id, skipping detection
        #[arg(long)]
        runner: Option<String>,

        #[command(flatten)]
        remote: RemoteArgs,
    },
    /// Print every event of a flow as it happens
    Watch {
        /// Flow to follow
        #[arg(long)]
        flow: String,

        #[command(flatten)]
        remote: RemoteArgs,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(clap::Args, Clone)]
pub struct RemoteArgs {
    /// Server base URL
    #[arg(long, env = "TREQ_SERVER", default_value = "http://127.0.0.1:4097")]
    pub server: String,

    /// Bearer token sent with every request
    #[arg(long, env = "TREQ_TOKEN")]
    pub token: Option<String>,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default treq.toml file
    Init,
}

fn init_logging(verbose: bool, json: bool) {
    let default = if verbose { "treq=debug" } else { "treq=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Serve { host, port, dev } => {
            cmd::cmd_serve(&project_dir, host.clone(), *port, *dev).await?;
        }
        Commands::Run {
            path,
            test,
            runner,
            remote,
        } => {
            cmd::cmd_run(path, *test, runner.as_deref(), remote).await?;
        }
        Commands::Watch { flow, remote } => cmd::cmd_watch(flow, remote).await?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
