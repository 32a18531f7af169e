//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod job;
mod queue;

pub use job::JobCommands;
pub use queue::QueueCommands;

use anyhow::Result;
use clap::Subcommand;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Job management
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },
    /// Queue inspection
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
}

/// Routes the command to the appropriate handler module
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Job { command } => job::handle_job_command(command, config).await,
        Commands::Queue { command } => queue::handle_queue_command(command, config).await,
    }
}
