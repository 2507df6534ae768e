use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;
mod config;
mod document;
mod inputs;

use config::{Config, ExecutorKind};

/// Exit code for errors raised before a run starts
const PREFLIGHT_FAILED: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "topograph")]
#[command(about = "Run lifecycle workflows over deployment topologies", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "topograph.toml", global = true)]
    config: PathBuf,

    /// Data directory for storage
    #[arg(short, long, default_value = "./data", env = "TOPOGRAPH_DATA_DIR", global = true)]
    data_dir: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a deployment from a topology document
    Load {
        document: PathBuf,

        /// Deployment id; defaults to the document name
        #[arg(long)]
        deployment_id: Option<String>,
    },

    /// List the workflows of a deployment and their parameters
    Workflows { deployment_id: String },

    /// Run a workflow on a deployment
    Execute {
        deployment_id: String,
        workflow_id: String,

        /// JSON object, path to a JSON file, or `k=v;k2=v2`; repeatable
        #[arg(short, long = "parameters")]
        parameters: Vec<String>,

        /// Override the configured executor
        #[arg(long, value_enum)]
        executor: Option<ExecutorKind>,
    },

    /// Print the recorded events of an execution
    Events { execution_id: String },

    /// Serve operations for the process executor on stdin/stdout
    #[command(hide = true)]
    Worker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logs go to stderr; stdout carries command output and worker frames
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "topograph=info,topograph_core=info,topograph_cli=info".into());
    let logs = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if args.log_json {
        logs.json().init();
    } else {
        logs.init();
    }

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(PREFLIGHT_FAILED)
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    if let Command::Worker = args.command {
        commands::worker().await?;
        return Ok(ExitCode::SUCCESS);
    }

    let mut config = Config::load(&args.config, args.data_dir)?;
    tracing::debug!("Data directory: {}", config.data_dir.display());

    match args.command {
        Command::Load {
            document,
            deployment_id,
        } => commands::load(&config, &document, deployment_id)?,
        Command::Workflows { deployment_id } => commands::workflows(&config, &deployment_id)?,
        Command::Execute {
            deployment_id,
            workflow_id,
            parameters,
            executor,
        } => {
            if let Some(kind) = executor {
                config.executor.kind = kind;
            }
            return commands::execute(&config, &deployment_id, &workflow_id, &parameters).await;
        }
        Command::Events { execution_id } => commands::events(&config, &execution_id)?,
        Command::Worker => {}
    }

    Ok(ExitCode::SUCCESS)
}
