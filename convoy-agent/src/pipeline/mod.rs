//! Pipeline execution
//!
//! Steps form a dependency graph (a chain when none declares `depends_on`).
//! A step starts once all its dependencies are done. A step whose upstream
//! failed is skipped unless it is `always_run`; exit code 78 passes and
//! skips everything left that is not `always_run`.

mod executor;

pub use executor::{Execution, Executor, ExecutorError, PipelineOutcome, StepState};
