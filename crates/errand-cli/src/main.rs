use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod render;

pub const DEFAULT_TASK: &str =
    "Find the latest report.pdf in my documents and create a GitHub issue about it";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Options shared by every command that talks to tool servers
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// Config file (defaults to ~/.config/errand/config.toml when present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Directory the default filesystem server may access
    #[arg(long)]
    pub root: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent on a task until it finishes
    Run {
        /// What the agent should do
        #[arg(short, long, default_value = DEFAULT_TASK)]
        task: String,

        #[command(flatten)]
        config: ConfigArgs,

        /// Maximum number of model calls before giving up
        #[arg(long)]
        max_steps: Option<usize>,

        /// Write the conversation to this file as JSON lines
        #[arg(long)]
        save_history: Option<PathBuf>,
    },

    /// Connect to the configured tool servers and list their tools
    Tools {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Display the current version
    Version,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("errand=info,errand_cli=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            task,
            config,
            max_steps,
            save_history,
        } => commands::run::execute(task, config, max_steps, save_history).await,
        Command::Tools { config } => commands::tools::execute(config).await,
        Command::Version => commands::version::execute().await,
    }
}
