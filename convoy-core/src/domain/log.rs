//! Log domain types

use serde::{Deserialize, Serialize};

/// One line of step output
///
/// Lines are numbered from zero within their step and are never mutated
/// after being sent. `offset_secs` is measured from the start of the step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub step: String,
    pub number: u64,
    pub offset_secs: u64,
    pub message: String,
}
