//! Queue command handlers

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use convoy_client::QueueClient;

use crate::config::Config;

#[derive(Subcommand)]
pub enum QueueCommands {
    /// Show how many jobs are pending, assigned and running
    Stats,
}

pub async fn handle_queue_command(command: QueueCommands, config: &Config) -> Result<()> {
    let client = config.client();

    match command {
        QueueCommands::Stats => show_stats(&client).await,
    }
}

async fn show_stats(client: &QueueClient) -> Result<()> {
    let stats = client.queue_stats().await?;

    println!("{}", "Queue:".bold());
    println!("  Pending:  {}", stats.pending.to_string().yellow());
    println!("  Assigned: {}", stats.assigned.to_string().cyan());
    println!("  Running:  {}", stats.running.to_string().cyan());

    Ok(())
}
