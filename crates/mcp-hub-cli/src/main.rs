//! mcphub: inspect and drive MCP servers from the command line

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mcphub")]
#[command(about = "Inspect and drive MCP servers", version)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ./mcp.toml or the global config)
    #[arg(short, long, global = true, env = "MCPHUB_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List configured servers
    Servers,

    /// Connect all servers and list their tools
    Tools {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Connect all servers and list their prompts
    Prompts,

    /// Connect all servers and list their resources
    Resources,

    /// Connect all servers and show connection status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Call a tool
    Call {
        /// Tool name, bare or qualified (`server/tool`)
        tool: String,

        /// Arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,
    },

    /// Keep servers connected and apply config changes as they happen
    Watch,
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Servers => commands::servers(config).await,
        Commands::Tools { json } => commands::tools(config, json).await,
        Commands::Prompts => commands::prompts(config).await,
        Commands::Resources => commands::resources(config).await,
        Commands::Status { json } => commands::status(config, json).await,
        Commands::Call { tool, args } => commands::call(config, &tool, &args).await,
        Commands::Watch => commands::watch(config).await,
    }
}
