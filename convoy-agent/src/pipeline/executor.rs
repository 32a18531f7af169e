use convoy_core::domain::job::Job;
use convoy_core::domain::pipeline::{PipelineError, Step};
use convoy_core::domain::state::exit_code;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{ContainerEngine, EngineError, StepExit};
use crate::reporter::{Reporter, StepStream};

const OUTPUT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Waiting,
    Running,
    Success,
    Failed(i32),
    Skipped,
}

impl StepState {
    fn is_done(&self) -> bool {
        !matches!(self, StepState::Waiting | StepState::Running)
    }
}

/// How the pipeline as a whole ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// All steps ran to an end; the code of the first failed step, or 0
    Exited(i32),
    OutOfMemory,
    /// Stopped from outside (cancel, timeout, lease loss)
    Aborted,
}

#[derive(Debug)]
pub struct Execution {
    pub outcome: PipelineOutcome,
    pub steps: Vec<(String, StepState)>,
}

impl Execution {
    pub fn state_of(&self, step: &str) -> Option<StepState> {
        self.steps
            .iter()
            .find(|(name, _)| name == step)
            .map(|(_, state)| *state)
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    InvalidPipeline(#[from] PipelineError),

    #[error("workspace setup failed: {0}")]
    Setup(#[source] EngineError),

    #[error("step '{step}' could not run: {source}")]
    Step {
        step: String,
        #[source]
        source: EngineError,
    },

    #[error("step task failed: {0}")]
    Join(#[from] JoinError),
}

struct StepRun {
    exit: StepExit,
    inactive: bool,
}

pub struct Executor {
    engine: Arc<dyn ContainerEngine>,
    agent_id: String,
}

impl Executor {
    pub fn new(engine: Arc<dyn ContainerEngine>, agent_id: impl Into<String>) -> Self {
        Self {
            engine,
            agent_id: agent_id.into(),
        }
    }

    /// Runs every step of the job's pipeline
    ///
    /// Firing `abort` kills running steps, skips waiting ones and returns
    /// [`PipelineOutcome::Aborted`]. The workspace is torn down in all cases.
    pub async fn run(
        &self,
        job: Arc<Job>,
        reporter: &Reporter,
        abort: &CancellationToken,
    ) -> Result<Execution, ExecutorError> {
        job.pipeline.validate()?;

        let result = match self.engine.setup(&job).await {
            Ok(()) => self.run_steps(&job, reporter, abort).await,
            Err(e) => Err(ExecutorError::Setup(e)),
        };

        if let Err(e) = self.engine.teardown(&job).await {
            warn!(job_id = %job.id, "Failed to tear down job: {}", e);
        }
        result
    }

    async fn run_steps(
        &self,
        job: &Arc<Job>,
        reporter: &Reporter,
        abort: &CancellationToken,
    ) -> Result<Execution, ExecutorError> {
        let steps = &job.pipeline.steps;
        let deps = job.pipeline.dependencies();
        let order = job.pipeline.topological_order()?;

        let mut states = vec![StepState::Waiting; steps.len()];
        // A failure upstream, carried through always-run steps
        let mut tainted = vec![false; steps.len()];
        let mut skip_rest = false;
        let mut oom = false;

        let halt = abort.child_token();
        let mut running: JoinSet<(usize, Result<StepRun, EngineError>)> = JoinSet::new();

        loop {
            if abort.is_cancelled() {
                break;
            }

            for &i in &order {
                if states[i] != StepState::Waiting || !deps[i].iter().all(|&d| states[d].is_done())
                {
                    continue;
                }

                let step = &steps[i];
                tainted[i] = deps[i].iter().any(|&d| {
                    tainted[d]
                        || match states[d] {
                            StepState::Skipped => true,
                            StepState::Failed(_) => !steps[d].ignore_failure,
                            _ => false,
                        }
                });

                if (tainted[i] || skip_rest) && !step.always_run {
                    info!(job_id = %job.id, "Skipping step '{}'", step.name);
                    states[i] = StepState::Skipped;
                    continue;
                }

                info!(job_id = %job.id, "Starting step '{}'", step.name);
                states[i] = StepState::Running;

                let env = self.environment(job, i, job_failed(&states, steps));
                let stream = reporter.stream(&step.name);
                let kill = halt.child_token();
                let engine = self.engine.clone();
                let job = job.clone();
                running.spawn(async move {
                    let result = run_step(engine, job, i, env, stream, kill).await;
                    (i, result)
                });
            }

            if running.is_empty() {
                break;
            }

            let joined = tokio::select! {
                biased;
                _ = abort.cancelled() => break,
                joined = running.join_next() => joined,
            };
            let Some(joined) = joined else { break };

            let (i, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    halt.cancel();
                    while running.join_next().await.is_some() {}
                    return Err(e.into());
                }
            };
            let step = &steps[i];

            let run = match result {
                Ok(run) => run,
                Err(source) => {
                    halt.cancel();
                    while running.join_next().await.is_some() {}
                    return Err(ExecutorError::Step {
                        step: step.name.clone(),
                        source,
                    });
                }
            };

            states[i] = if run.inactive {
                StepState::Failed(exit_code::INACTIVE)
            } else if run.exit.oom_killed {
                if !step.ignore_failure {
                    oom = true;
                }
                StepState::Failed(run.exit.code)
            } else {
                match run.exit.code {
                    exit_code::SUCCESS => StepState::Success,
                    exit_code::SKIP => {
                        info!(job_id = %job.id, "Step '{}' requested skipping the remaining steps", step.name);
                        skip_rest = true;
                        StepState::Success
                    }
                    code => StepState::Failed(code),
                }
            };
            debug!(job_id = %job.id, "Step '{}' finished: {:?}", step.name, states[i]);

            if !run.inactive && !run.exit.oom_killed && !abort.is_cancelled() {
                self.collect_artifact(job, step, reporter).await;
            }
        }

        if abort.is_cancelled() {
            info!(job_id = %job.id, "Pipeline aborted");
            while let Some(joined) = running.join_next().await {
                if let Ok((i, _)) = joined {
                    states[i] = StepState::Failed(exit_code::KILLED);
                }
            }
            for state in states.iter_mut() {
                if *state == StepState::Waiting {
                    *state = StepState::Skipped;
                }
            }
            return Ok(summary(steps, states, PipelineOutcome::Aborted));
        }

        let outcome = if oom {
            PipelineOutcome::OutOfMemory
        } else {
            let code = order
                .iter()
                .find_map(|&i| match states[i] {
                    StepState::Failed(code) if !steps[i].ignore_failure => Some(code),
                    _ => None,
                })
                .unwrap_or(exit_code::SUCCESS);
            PipelineOutcome::Exited(code)
        };
        Ok(summary(steps, states, outcome))
    }

    /// Variables visible to a step; built-ins cannot be overridden
    fn environment(&self, job: &Job, index: usize, failed: bool) -> HashMap<String, String> {
        let step = &job.pipeline.steps[index];

        let mut env = job.environment.clone();
        env.extend(step.environment.clone());
        env.extend(
            job.secrets
                .iter()
                .map(|s| (s.name.clone(), s.value.clone())),
        );

        let status = if failed { "failure" } else { "success" };
        for (key, value) in [
            ("CI", "true".to_string()),
            ("CONVOY_JOB_ID", job.id.to_string()),
            ("CONVOY_BUILD_ID", job.build_id.to_string()),
            ("CONVOY_PIPELINE", job.pipeline.name.clone()),
            ("CONVOY_STEP_NAME", step.name.clone()),
            ("CONVOY_STEP_NUMBER", (index + 1).to_string()),
            ("CONVOY_AGENT", self.agent_id.clone()),
            ("CONVOY_JOB_STATUS", status.to_string()),
        ] {
            env.insert(key.to_string(), value);
        }
        env
    }

    async fn collect_artifact(&self, job: &Job, step: &Step, reporter: &Reporter) {
        let Some(spec) = &step.artifact else { return };

        match self.engine.read_artifact(job, &spec.path).await {
            Ok(data) => {
                let name = Path::new(&spec.path)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| spec.path.clone());
                reporter.upload_artifact(&step.name, &name, &spec.mime, data);
            }
            Err(e) => warn!(
                job_id = %job.id,
                "Step '{}' produced no artifact at '{}': {}",
                step.name,
                spec.path,
                e
            ),
        }
    }
}

/// True once a step that counts has failed
fn job_failed(states: &[StepState], steps: &[Step]) -> bool {
    states
        .iter()
        .zip(steps)
        .any(|(state, step)| matches!(state, StepState::Failed(_)) && !step.ignore_failure)
}

fn summary(steps: &[Step], states: Vec<StepState>, outcome: PipelineOutcome) -> Execution {
    Execution {
        outcome,
        steps: steps.iter().map(|s| s.name.clone()).zip(states).collect(),
    }
}

/// Runs one step, forwarding its output and enforcing the inactivity limit
async fn run_step(
    engine: Arc<dyn ContainerEngine>,
    job: Arc<Job>,
    index: usize,
    env: HashMap<String, String>,
    stream: StepStream,
    kill: CancellationToken,
) -> Result<StepRun, EngineError> {
    let step = &job.pipeline.steps[index];
    let inactivity = job.inactivity();
    let watchdog = !inactivity.is_zero();

    let (tx, mut rx) = mpsc::channel(OUTPUT_BUFFER);
    let run = engine.run_step(&job, step, &env, tx, kill.clone());
    tokio::pin!(run);

    let mut deadline = Instant::now() + inactivity;
    let mut inactive = false;

    let exit = loop {
        tokio::select! {
            exit = &mut run => break exit?,
            Some(line) = rx.recv() => {
                deadline = Instant::now() + inactivity;
                stream.send(line);
            }
            _ = tokio::time::sleep_until(deadline), if watchdog && !inactive => {
                warn!(
                    job_id = %job.id,
                    "Step '{}' produced no output for {:?}, killing it",
                    step.name,
                    inactivity
                );
                inactive = true;
                kill.cancel();
            }
        }
    };

    while let Ok(line) = rx.try_recv() {
        stream.send(line);
    }

    Ok(StepRun { exit, inactive })
}
