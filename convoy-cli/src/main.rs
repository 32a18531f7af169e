//! Convoy CLI
//!
//! Command-line interface for submitting and inspecting jobs on a Convoy server.

mod commands;
mod config;
mod id_resolver;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use config::Config;

#[derive(Parser)]
#[command(name = "convoy")]
#[command(about = "Convoy CI job dispatch CLI", long_about = None)]
struct Cli {
    /// Server URL
    #[arg(long, env = "CONVOY_SERVER_URL", default_value = "http://localhost:8080")]
    server_url: String,

    /// Bearer token, when the server requires one
    #[arg(long, env = "CONVOY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config {
        server_url: cli.server_url,
        token: cli.token,
    };

    handle_command(cli.command, &config).await
}
