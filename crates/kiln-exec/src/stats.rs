//! Counters for a completed run.

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    /// Operations created by the transform.
    pub started: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Largest in-flight count seen at an admission checkpoint. Never exceeds the limit.
    pub peak_in_flight: usize,
}

impl RunStats {
    pub fn settled(&self) -> usize {
        self.succeeded + self.failed
    }
}
