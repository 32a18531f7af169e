//! Job command handlers
//!
//! Submitting pipelines, listing and inspecting jobs, reading logs and
//! fetching artifacts.

use anyhow::{Context, Result, anyhow};
use clap::Subcommand;
use colored::*;
use convoy_client::QueueClient;
use convoy_core::domain::job::{Job, JobStatus, Secret};
use convoy_core::domain::log::LogLine;
use convoy_core::domain::pipeline::Pipeline;
use convoy_core::dto::job::CreateJob;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::id_resolver::resolve_job_id;

/// Job subcommands
#[derive(Subcommand)]
pub enum JobCommands {
    /// Submit a pipeline (JSON file) as a new job
    Submit {
        /// Path to the pipeline definition
        file: PathBuf,

        /// Label an agent must carry (key=value, repeatable)
        #[arg(short, long = "label")]
        labels: Vec<String>,

        /// Environment variable for every step (KEY=VALUE, repeatable)
        #[arg(short, long = "env")]
        env: Vec<String>,

        /// Secret (NAME=VALUE, or NAME to read it from the local environment)
        #[arg(short, long = "secret")]
        secrets: Vec<String>,

        /// Wall-clock limit in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Limit in seconds on a step producing no output
        #[arg(long)]
        inactivity: Option<u64>,
    },
    /// List all jobs
    List {
        /// Only show jobs with this status
        #[arg(long)]
        status: Option<JobStatus>,
    },
    /// Get job details
    Get {
        /// Job ID or unambiguous prefix
        id: String,
    },
    /// Get job logs
    Logs {
        /// Job ID or unambiguous prefix
        id: String,

        /// Only show this step
        #[arg(long)]
        step: Option<String>,
    },
    /// Request cancellation of a job
    Cancel {
        /// Job ID or unambiguous prefix
        id: String,
    },
    /// List the artifacts of a job
    Artifacts {
        /// Job ID or unambiguous prefix
        id: String,
    },
    /// Download the artifact of a step
    Download {
        /// Job ID or unambiguous prefix
        id: String,

        step: String,

        /// Destination file; defaults to the artifact name
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

pub async fn handle_job_command(command: JobCommands, config: &Config) -> Result<()> {
    let client = config.client();

    match command {
        JobCommands::Submit {
            file,
            labels,
            env,
            secrets,
            timeout,
            inactivity,
        } => {
            let mut req = CreateJob::new(read_pipeline(&file)?);
            req.labels = parse_pairs(&labels)?;
            req.environment = parse_pairs(&env)?;
            req.secrets = parse_secrets(&secrets)?;
            req.timeout_secs = timeout;
            req.inactivity_secs = inactivity;
            submit_job(&client, req).await
        }
        JobCommands::List { status } => list_jobs(&client, status).await,
        JobCommands::Get { id } => get_job(&client, &id).await,
        JobCommands::Logs { id, step } => get_job_logs(&client, &id, step.as_deref()).await,
        JobCommands::Cancel { id } => cancel_job(&client, &id).await,
        JobCommands::Artifacts { id } => list_artifacts(&client, &id).await,
        JobCommands::Download { id, step, output } => {
            download_artifact(&client, &id, &step, output).await
        }
    }
}

fn read_pipeline(file: &Path) -> Result<Pipeline> {
    let source = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let pipeline: Pipeline = serde_json::from_str(&source)
        .with_context(|| format!("{} is not a valid pipeline", file.display()))?;
    pipeline.validate()?;
    Ok(pipeline)
}

/// Parses repeated `KEY=VALUE` arguments
fn parse_pairs(pairs: &[String]) -> Result<HashMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("'{}' is not KEY=VALUE", pair))?;
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}

fn parse_secrets(args: &[String]) -> Result<Vec<Secret>> {
    args.iter()
        .map(|arg| {
            let (name, value) = match arg.split_once('=') {
                Some((name, value)) => (name.to_string(), value.to_string()),
                None => {
                    let value = std::env::var(arg)
                        .map_err(|_| anyhow!("secret {} is not set in the environment", arg))?;
                    (arg.clone(), value)
                }
            };
            Ok(Secret {
                name,
                value,
                masked: true,
            })
        })
        .collect()
}

async fn submit_job(client: &QueueClient, req: CreateJob) -> Result<()> {
    let job = client.create_job(req).await?;

    println!("{} Job {} submitted", "✓".green(), job.id.to_string().cyan());
    println!("  Pipeline: {}", job.pipeline.name);
    println!("  Status:   {}", colorize_status(&job.status));

    Ok(())
}

async fn list_jobs(client: &QueueClient, status: Option<JobStatus>) -> Result<()> {
    let jobs: Vec<Job> = client
        .list_jobs()
        .await?
        .into_iter()
        .filter(|j| status.is_none_or(|s| j.status == s))
        .collect();

    if jobs.is_empty() {
        println!("{}", "No jobs found.".yellow());
    } else {
        println!("{}", format!("Found {} job(s):", jobs.len()).bold());
        println!();
        for job in jobs {
            print_job_summary(&job);
        }
    }

    Ok(())
}

async fn get_job(client: &QueueClient, id: &str) -> Result<()> {
    let uuid = resolve_job_id(client, id).await?;
    let job = client.get_job(uuid).await?;

    print_job_details(&job);

    Ok(())
}

async fn get_job_logs(client: &QueueClient, id: &str, step: Option<&str>) -> Result<()> {
    let uuid = resolve_job_id(client, id).await?;
    let logs: Vec<LogLine> = client
        .get_job_logs(uuid)
        .await?
        .into_iter()
        .filter(|l| step.is_none_or(|s| l.step == s))
        .collect();

    if logs.is_empty() {
        println!("{}", "No logs found for this job.".yellow());
        return Ok(());
    }

    println!("{}", format!("Logs for job {}:", uuid).bold());
    println!("{}", "─".repeat(80).dimmed());
    let mut current: Option<&str> = None;
    for line in &logs {
        if current != Some(line.step.as_str()) {
            println!("{}", format!("[{}]", line.step).cyan().bold());
            current = Some(line.step.as_str());
        }
        print_log_line(line);
    }
    println!("{}", "─".repeat(80).dimmed());

    Ok(())
}

async fn cancel_job(client: &QueueClient, id: &str) -> Result<()> {
    let uuid = resolve_job_id(client, id).await?;
    let job = client.cancel_job(uuid).await?;

    if job.status == JobStatus::Cancelled {
        println!("{} Job {} cancelled", "✓".green(), uuid);
    } else if job.status.is_terminal() {
        println!(
            "{}",
            format!("Job {} already finished ({})", uuid, job.status).yellow()
        );
    } else {
        println!(
            "{} Cancellation requested for job {}; its agent will stop it",
            "✓".green(),
            uuid
        );
    }

    Ok(())
}

async fn list_artifacts(client: &QueueClient, id: &str) -> Result<()> {
    let uuid = resolve_job_id(client, id).await?;
    let artifacts = client.list_artifacts(uuid).await?;

    if artifacts.is_empty() {
        println!("{}", "No artifacts found for this job.".yellow());
        return Ok(());
    }

    println!("{}", format!("Artifacts of job {}:", uuid).bold());
    for artifact in artifacts {
        println!(
            "  {} {} {} ({}, {} bytes)",
            "▸".cyan(),
            artifact.step.bold(),
            artifact.name,
            artifact.mime.dimmed(),
            artifact.size
        );
    }

    Ok(())
}

async fn download_artifact(
    client: &QueueClient,
    id: &str,
    step: &str,
    output: Option<PathBuf>,
) -> Result<()> {
    let uuid = resolve_job_id(client, id).await?;

    let output = match output {
        Some(path) => path,
        None => {
            let artifacts = client.list_artifacts(uuid).await?;
            let artifact = artifacts
                .iter()
                .find(|a| a.step == step)
                .ok_or_else(|| anyhow!("Step '{}' of job {} has no artifact", step, uuid))?;
            PathBuf::from(&artifact.name)
        }
    };

    let (mime, data) = client.download_artifact(uuid, step).await?;
    std::fs::write(&output, &data)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!(
        "{} Saved {} ({}, {} bytes)",
        "✓".green(),
        output.display(),
        mime,
        data.len()
    );

    Ok(())
}

fn print_job_summary(job: &Job) {
    println!("  {} Job {}", "▸".cyan(), job.id.to_string().dimmed());
    println!("    Pipeline: {}", job.pipeline.name);
    println!("    Status:   {}", colorize_status(&job.status));
    println!(
        "    Created:  {}",
        job.created_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    if let Some(agent) = &job.agent_id {
        println!("    Agent:    {}", agent.dimmed());
    }
    println!();
}

fn print_job_details(job: &Job) {
    println!("{}", "Job Details:".bold());
    println!("  ID:          {}", job.id.to_string().cyan());
    println!("  Build ID:    {}", job.build_id.to_string().dimmed());
    println!("  Pipeline:    {}", job.pipeline.name);
    println!("  Status:      {}", colorize_status(&job.status));
    println!("  Created:     {}", job.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Deliveries:  {}", job.deliveries);
    println!("  Timeout:     {}s", job.timeout_secs);

    if let Some(agent) = &job.agent_id {
        println!("  Agent:       {}", agent);
    }
    if job.cancel_requested && !job.status.is_terminal() {
        println!("  {}", "Cancellation requested".yellow());
    }

    if !job.labels.is_empty() {
        println!("\n{}", "Labels:".bold());
        for (key, value) in &job.labels {
            println!("  {} = {}", key.cyan(), value);
        }
    }

    println!("\n{}", "Steps:".bold());
    for (i, step) in job.pipeline.steps.iter().enumerate() {
        let mut flags = Vec::new();
        if step.always_run {
            flags.push("always");
        }
        if step.ignore_failure {
            flags.push("ignore-failure");
        }
        println!(
            "  {}. {} ({}){}",
            i + 1,
            step.name.bold(),
            step.image.dimmed(),
            if flags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", flags.join(", "))
            }
        );
    }

    if let Some(state) = &job.state {
        println!("\n{}", "Result:".bold());
        if let Some(started) = state.started {
            println!("  Started:    {}", started.format("%Y-%m-%d %H:%M:%S"));
            if let Some(finished) = state.finished {
                let seconds = finished.signed_duration_since(started).num_seconds();
                println!("  Duration:   {}s", seconds);
            }
        }
        if state.exited {
            println!("  Exit Code:  {}", state.exit_code);
        }
        if let Some(error) = &state.error {
            println!("\n{}", "Error:".bold());
            println!("{}", error.red());
        }
    }
}

fn print_log_line(line: &LogLine) {
    println!(
        "{} {}",
        format!("{:>5}s", line.offset_secs).dimmed(),
        line.message
    );
}

fn colorize_status(status: &JobStatus) -> ColoredString {
    let status_str = status.to_string();
    match status {
        JobStatus::Pending => status_str.yellow(),
        JobStatus::Assigned | JobStatus::Running => status_str.cyan(),
        JobStatus::Success => status_str.green(),
        JobStatus::Failure | JobStatus::Error | JobStatus::Killed => status_str.red(),
        JobStatus::Cancelled => status_str.dimmed(),
    }
}
