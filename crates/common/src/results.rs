//! Tallying of a party's result stream

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ops::AddAssign;

use crate::types::Outcome;

/// Pass/fail counts parsed from result-stream output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultCounts {
    pub passes: usize,
    pub failures: usize,
}

impl ResultCounts {
    pub fn new(passes: usize, failures: usize) -> Self {
        Self { passes, failures }
    }

    /// Count `test_pass` and `test_unexpected_fail` lines.
    ///
    /// Lines that are not JSON objects (diagnostics) are skipped.
    pub fn from_output(output: &str) -> Self {
        let mut counts = Self::default();
        for line in output.lines() {
            let Ok(Value::Object(object)) = serde_json::from_str::<Value>(line) else {
                continue;
            };
            match object.get("action").and_then(Value::as_str) {
                Some(action) if action == Outcome::Fail.as_action() => counts.failures += 1,
                Some(action) if action == Outcome::Pass.as_action() => counts.passes += 1,
                _ => {}
            }
        }
        counts
    }

    /// A run succeeded when something passed and nothing failed
    pub fn is_success(&self) -> bool {
        self.passes > 0 && self.failures == 0
    }
}

impl AddAssign for ResultCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.passes += rhs.passes;
        self.failures += rhs.failures;
    }
}
