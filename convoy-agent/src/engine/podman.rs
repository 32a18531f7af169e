//! Podman/Docker engine
//!
//! Every step runs in its own container:
//! - The job workspace is a host directory mounted at `/workspace`
//! - The entrypoint is overridden with `/bin/sh -c <script>`
//! - Containers carry a job label so teardown can find leftovers
//!
//! Both CLIs accept the same arguments, so the binary is configurable.

use async_trait::async_trait;
use convoy_core::domain::job::Job;
use convoy_core::domain::pipeline::Step;
use convoy_core::domain::state::exit_code;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ContainerEngine, EngineError, StepExit};

const JOB_LABEL: &str = "convoy.job";

/// Checks that the container CLI is installed and responding
pub async fn check_available(binary: &str) -> Result<String, EngineError> {
    let output = Command::new(binary)
        .arg("--version")
        .output()
        .await
        .map_err(|source| EngineError::Spawn {
            binary: binary.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(EngineError::Command {
            command: format!("{} --version", binary),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    info!("Container engine is available: {}", version);
    Ok(version)
}

pub struct PodmanEngine {
    binary: String,
    workspace_root: PathBuf,
}

impl PodmanEngine {
    /// # Arguments
    /// * `binary` - `podman` or `docker`
    /// * `workspace_root` - Host directory holding one workspace per job
    pub fn new(binary: impl Into<String>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            workspace_root: workspace_root.into(),
        }
    }

    fn workspace(&self, job: &Job) -> PathBuf {
        self.workspace_root.join(job.id.to_string())
    }

    fn container_name(job: &Job, step: &Step) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        step.name.hash(&mut hasher);
        format!("convoy-{}-{:x}", job.id, hasher.finish())
    }

    /// Runs a short-lived CLI command and captures its output
    async fn command(&self, args: &[&str]) -> Result<Output, EngineError> {
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| EngineError::Spawn {
                binary: self.binary.clone(),
                source,
            })
    }

    /// Force-removes a container, stopping it first if it still runs
    async fn remove(&self, name: &str) {
        match self.command(&["rm", "-f", name]).await {
            Ok(output) if !output.status.success() => debug!(
                "{} rm -f {} failed: {}",
                self.binary,
                name,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Ok(_) => debug!("Removed container {}", name),
            Err(e) => warn!("Failed to remove container {}: {}", name, e),
        }
    }

    async fn oom_killed(&self, name: &str) -> bool {
        match self
            .command(&["inspect", "--format", "{{.State.OOMKilled}}", name])
            .await
        {
            Ok(output) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout).trim() == "true"
            }
            Ok(output) => {
                debug!(
                    "Could not inspect container {}: {}",
                    name,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                false
            }
            Err(e) => {
                warn!("Could not inspect container {}: {}", name, e);
                false
            }
        }
    }
}

/// Shell script echoing and running each command, stopping at the first failure
fn script(step: &Step) -> String {
    let mut script = String::from("set -e\n");
    for command in &step.commands {
        script.push_str(&format!("echo {}\n", shell_quote(&format!("+ {}", command))));
        script.push_str(command);
        script.push('\n');
    }
    script
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Rejects absolute paths and paths escaping the workspace
fn resolve_artifact(workspace: &Path, path: &str) -> Result<PathBuf, EngineError> {
    let relative = Path::new(path);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if path.is_empty() || escapes {
        return Err(EngineError::ArtifactPath(path.to_string()));
    }
    Ok(workspace.join(relative))
}

/// Sends the reader's output line by line, replacing invalid UTF-8
///
/// The reader is drained to EOF even once `output` is closed.
fn forward<R>(reader: Option<R>, output: mpsc::Sender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(reader) = reader else { return };
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut open = true;

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) if open => {
                    let line = buf.strip_suffix(b"\n").unwrap_or(&buf[..]);
                    let line = line.strip_suffix(b"\r").unwrap_or(line);
                    let line = String::from_utf8_lossy(line).into_owned();
                    open = output.send(line).await.is_ok();
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Failed to read step output: {}", e);
                    break;
                }
            }
        }
    })
}

#[async_trait]
impl ContainerEngine for PodmanEngine {
    async fn setup(&self, job: &Job) -> Result<(), EngineError> {
        let workspace = self.workspace(job);
        tokio::fs::create_dir_all(&workspace).await?;
        debug!("Created workspace {} for job {}", workspace.display(), job.id);
        Ok(())
    }

    async fn run_step(
        &self,
        job: &Job,
        step: &Step,
        env: &HashMap<String, String>,
        output: mpsc::Sender<String>,
        kill: CancellationToken,
    ) -> Result<StepExit, EngineError> {
        let name = Self::container_name(job, step);
        let workspace = self.workspace(job);

        info!(
            "Starting container {} for step '{}' with image {}",
            name, step.name, step.image
        );

        let mut command = Command::new(&self.binary);
        command
            .arg("run")
            .arg("--name")
            .arg(&name)
            .arg("--label")
            .arg(format!("{}={}", JOB_LABEL, job.id))
            .arg("--entrypoint")
            .arg("/bin/sh")
            .arg("-v")
            .arg(format!("{}:/workspace", workspace.display()))
            .arg("-w")
            .arg("/workspace");

        // Values travel through the CLI's environment, never its argv
        for (key, value) in env {
            command.arg("-e").arg(key).env(key, value);
        }

        command
            .arg(&step.image)
            .arg("-c")
            .arg(script(step))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| EngineError::Spawn {
            binary: self.binary.clone(),
            source,
        })?;

        let stdout = forward(child.stdout.take(), output.clone());
        let stderr = forward(child.stderr.take(), output);

        let status = tokio::select! {
            status = child.wait() => Some(status?),
            _ = kill.cancelled() => None,
        };

        let exit = match status {
            Some(status) => {
                let _ = tokio::join!(stdout, stderr);
                let oom_killed = self.oom_killed(&name).await;
                StepExit {
                    code: status.code().unwrap_or(exit_code::KILLED),
                    oom_killed,
                }
            }
            None => {
                info!("Killing container {} for step '{}'", name, step.name);
                self.remove(&name).await;
                if let Err(e) = child.kill().await {
                    debug!("{} process already gone: {}", self.binary, e);
                }
                stdout.abort();
                stderr.abort();
                StepExit {
                    code: exit_code::KILLED,
                    oom_killed: false,
                }
            }
        };

        self.remove(&name).await;
        debug!(
            "Step '{}' exited with code {} (oom: {})",
            step.name, exit.code, exit.oom_killed
        );
        Ok(exit)
    }

    async fn read_artifact(&self, job: &Job, path: &str) -> Result<Vec<u8>, EngineError> {
        let file = resolve_artifact(&self.workspace(job), path)?;
        Ok(tokio::fs::read(file).await?)
    }

    async fn teardown(&self, job: &Job) -> Result<(), EngineError> {
        let filter = format!("label={}={}", JOB_LABEL, job.id);
        let output = self.command(&["ps", "-aq", "--filter", &filter]).await?;
        if output.status.success() {
            let ids = String::from_utf8_lossy(&output.stdout).to_string();
            for id in ids.lines().map(str::trim).filter(|id| !id.is_empty()) {
                self.remove(id).await;
            }
        }

        match tokio::fs::remove_dir_all(self.workspace(job)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        info!("Cleaned up containers and workspace for job {}", job.id);
        Ok(())
    }
}
