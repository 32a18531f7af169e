//! In-process engine for tests: steps follow a script instead of running containers

use async_trait::async_trait;
use convoy_core::domain::job::Job;
use convoy_core::domain::pipeline::Step;
use convoy_core::domain::state::exit_code;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{ContainerEngine, EngineError, StepExit};

/// Behaviour of one step
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub lines: Vec<String>,
    pub exit_code: i32,
    pub oom_killed: bool,
    /// Time spent after printing, before exiting
    pub duration: Duration,
}

impl Script {
    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Default::default()
        }
    }

    pub fn lines(mut self, lines: &[&str]) -> Self {
        self.lines = lines.iter().map(|l| l.to_string()).collect();
        self
    }

    pub fn lasting(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn oom(mut self) -> Self {
        self.oom_killed = true;
        self
    }
}

#[derive(Default)]
pub struct ScriptedEngine {
    scripts: HashMap<String, Script>,
    artifacts: HashMap<String, Vec<u8>>,
    fail_setup: bool,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub started: Mutex<Vec<String>>,
    pub killed: Mutex<Vec<String>>,
    pub envs: Mutex<HashMap<String, HashMap<String, String>>>,
    pub teardowns: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Steps without a script print nothing and exit 0
    pub fn script(mut self, step: &str, script: Script) -> Self {
        self.scripts.insert(step.to_string(), script);
        self
    }

    pub fn artifact(mut self, path: &str, data: &[u8]) -> Self {
        self.artifacts.insert(path.to_string(), data.to_vec());
        self
    }

    pub fn failing_setup(mut self) -> Self {
        self.fail_setup = true;
        self
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.killed.lock().unwrap().clone()
    }

    pub fn env_of(&self, step: &str) -> HashMap<String, String> {
        self.envs.lock().unwrap().get(step).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl ContainerEngine for ScriptedEngine {
    async fn setup(&self, _job: &Job) -> Result<(), EngineError> {
        if self.fail_setup {
            return Err(EngineError::Command {
                command: "setup".to_string(),
                message: "image pull failed".to_string(),
            });
        }
        Ok(())
    }

    async fn run_step(
        &self,
        _job: &Job,
        step: &Step,
        env: &HashMap<String, String>,
        output: mpsc::Sender<String>,
        kill: CancellationToken,
    ) -> Result<StepExit, EngineError> {
        let script = self.scripts.get(&step.name).cloned().unwrap_or_default();
        self.started.lock().unwrap().push(step.name.clone());
        self.envs
            .lock()
            .unwrap()
            .insert(step.name.clone(), env.clone());

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        for line in &script.lines {
            let _ = output.send(line.clone()).await;
        }

        let exit = tokio::select! {
            _ = tokio::time::sleep(script.duration) => StepExit {
                code: script.exit_code,
                oom_killed: script.oom_killed,
            },
            _ = kill.cancelled() => {
                self.killed.lock().unwrap().push(step.name.clone());
                StepExit { code: exit_code::KILLED, oom_killed: false }
            }
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(exit)
    }

    async fn read_artifact(&self, _job: &Job, path: &str) -> Result<Vec<u8>, EngineError> {
        self.artifacts
            .get(path)
            .cloned()
            .ok_or_else(|| EngineError::ArtifactPath(path.to_string()))
    }

    async fn teardown(&self, _job: &Job) -> Result<(), EngineError> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
