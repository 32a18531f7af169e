//! Pipeline domain types
//!
//! A pipeline is the declarative payload of a job: an ordered list of steps,
//! each running a list of shell commands inside a container image.
//!
//! Dependencies follow two modes:
//! - If no step declares `depends_on`, steps run strictly in declaration
//!   order (each step implicitly depends on the previous one).
//! - Otherwise the declared `depends_on` sets form a DAG and steps without
//!   an edge between them may run concurrently.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

/// Pipeline definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    pub steps: Vec<Step>,
}

/// One executable stage of a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Run even when a dependency failed (cleanup, notifications)
    #[serde(default)]
    pub always_run: bool,
    /// A failure of this step never fails the job or its dependents
    #[serde(default)]
    pub ignore_failure: bool,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub artifact: Option<ArtifactSpec>,
}

/// Artifact a step produces once its commands finish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSpec {
    /// Path relative to the job workspace
    pub path: String,
    pub mime: String,
}

/// Pipeline validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("pipeline has no steps")]
    Empty,

    #[error("step {0} has an empty name")]
    EmptyStepName(usize),

    #[error("step '{0}' has an empty image")]
    EmptyImage(String),

    #[error("duplicate step name '{0}'")]
    DuplicateStep(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("dependency cycle involving step '{0}'")]
    Cycle(String),
}

impl Step {
    /// Creates a step running `commands` in `image`
    pub fn new(name: impl Into<String>, image: impl Into<String>, commands: Vec<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            commands,
            depends_on: Vec::new(),
            always_run: false,
            ignore_failure: false,
            environment: HashMap::new(),
            artifact: None,
        }
    }

    pub fn depends_on(mut self, names: &[&str]) -> Self {
        self.depends_on = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn always_run(mut self) -> Self {
        self.always_run = true;
        self
    }

    pub fn ignore_failure(mut self) -> Self {
        self.ignore_failure = true;
        self
    }

    pub fn with_artifact(mut self, path: impl Into<String>, mime: impl Into<String>) -> Self {
        self.artifact = Some(ArtifactSpec {
            path: path.into(),
            mime: mime.into(),
        });
        self
    }
}

impl Pipeline {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    /// Returns true when any step declares explicit dependencies
    pub fn is_graph(&self) -> bool {
        self.steps.iter().any(|s| !s.depends_on.is_empty())
    }

    /// Effective dependencies of every step, as indices into `steps`
    ///
    /// Assumes the pipeline is valid; unknown names are ignored.
    pub fn dependencies(&self) -> Vec<Vec<usize>> {
        if !self.is_graph() {
            return (0..self.steps.len())
                .map(|i| if i == 0 { Vec::new() } else { vec![i - 1] })
                .collect();
        }

        let index: HashMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();

        self.steps
            .iter()
            .map(|s| {
                s.depends_on
                    .iter()
                    .filter_map(|d| index.get(d.as_str()).copied())
                    .collect()
            })
            .collect()
    }

    /// Validates names, dependencies and acyclicity
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.steps.is_empty() {
            return Err(PipelineError::Empty);
        }

        let mut names = HashSet::new();
        for (i, step) in self.steps.iter().enumerate() {
            if step.name.trim().is_empty() {
                return Err(PipelineError::EmptyStepName(i));
            }
            if step.image.trim().is_empty() {
                return Err(PipelineError::EmptyImage(step.name.clone()));
            }
            if !names.insert(step.name.as_str()) {
                return Err(PipelineError::DuplicateStep(step.name.clone()));
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if !names.contains(dep.as_str()) {
                    return Err(PipelineError::UnknownDependency {
                        step: step.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        self.topological_order().map(|_| ())
    }

    /// Kahn's algorithm, ties broken by declaration order
    pub fn topological_order(&self) -> Result<Vec<usize>, PipelineError> {
        let deps = self.dependencies();
        let mut indegree: Vec<usize> = deps.iter().map(|d| d.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.steps.len()];
        for (i, ds) in deps.iter().enumerate() {
            for &d in ds {
                dependents[d].push(i);
            }
        }

        let mut ready: VecDeque<usize> = (0..self.steps.len())
            .filter(|&i| indegree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.steps.len());

        while let Some(i) = ready.pop_front() {
            order.push(i);
            for &n in &dependents[i] {
                indegree[n] -= 1;
                if indegree[n] == 0 {
                    ready.push_back(n);
                }
            }
        }

        if order.len() != self.steps.len() {
            let stuck = (0..self.steps.len())
                .find(|i| !order.contains(i))
                .map(|i| self.steps[i].name.clone())
                .unwrap_or_default();
            return Err(PipelineError::Cycle(stuck));
        }

        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str) -> Step {
        Step::new(name, "alpine", vec!["true".to_string()])
    }

    #[test]
    fn test_sequential_mode_chains_steps() {
        let pipeline = Pipeline::new("p", vec![step("a"), step("b"), step("c")]);
        assert!(!pipeline.is_graph());
        assert_eq!(pipeline.dependencies(), vec![vec![], vec![0], vec![1]]);
        assert_eq!(pipeline.topological_order().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_graph_mode_uses_declared_edges() {
        let pipeline = Pipeline::new(
            "p",
            vec![
                step("deploy").depends_on(&["build"]),
                step("test"),
                step("build").depends_on(&["test"]),
            ],
        );
        assert!(pipeline.validate().is_ok());
        assert_eq!(pipeline.topological_order().unwrap(), vec![1, 2, 0]);
    }

    #[test]
    fn test_independent_roots_have_no_dependencies() {
        let pipeline = Pipeline::new(
            "p",
            vec![step("a"), step("b"), step("c").depends_on(&["a", "b"])],
        );
        assert_eq!(pipeline.dependencies(), vec![vec![], vec![], vec![0, 1]]);
    }

    #[test]
    fn test_validate_rejects_bad_pipelines() {
        assert_eq!(Pipeline::new("p", vec![]).validate(), Err(PipelineError::Empty));

        let dup = Pipeline::new("p", vec![step("a"), step("a")]);
        assert_eq!(dup.validate(), Err(PipelineError::DuplicateStep("a".into())));

        let unknown = Pipeline::new("p", vec![step("a").depends_on(&["zzz"])]);
        assert!(matches!(
            unknown.validate(),
            Err(PipelineError::UnknownDependency { .. })
        ));

        let cycle = Pipeline::new(
            "p",
            vec![step("a").depends_on(&["b"]), step("b").depends_on(&["a"])],
        );
        assert!(matches!(cycle.validate(), Err(PipelineError::Cycle(_))));

        let no_image = Pipeline::new("p", vec![Step::new("a", " ", vec![])]);
        assert_eq!(no_image.validate(), Err(PipelineError::EmptyImage("a".into())));
    }

    #[test]
    fn test_step_defaults_deserialize() {
        let step: Step = serde_json::from_str(r#"{"name":"a","image":"alpine"}"#).unwrap();
        assert!(step.commands.is_empty());
        assert!(!step.always_run);
        assert!(step.artifact.is_none());
    }
}
