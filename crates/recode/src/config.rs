use crate::buffer::DEFAULT_THRESHOLD;
use crate::queue::{DEFAULT_CONCURRENCY, DEFAULT_TIMEOUT, JobQueue};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables of a [`Recompressor`](crate::Recompressor).
///
/// Missing fields take their defaults, so a partial document such as
/// `{"threshold": 4194304}` is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecodeConfig {
    /// Decoded bytes held in memory before switching to streaming.
    pub threshold: usize,
    /// Whole-buffer compressions allowed to run at once.
    pub queue_concurrency: usize,
    /// Time budget of one whole-buffer compression, `0` for none.
    pub queue_timeout_secs: u64,
}

impl Default for RecodeConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            queue_concurrency: DEFAULT_CONCURRENCY,
            queue_timeout_secs: DEFAULT_TIMEOUT.as_secs(),
        }
    }
}

impl RecodeConfig {
    pub fn queue_timeout(&self) -> Option<Duration> {
        (self.queue_timeout_secs > 0).then(|| Duration::from_secs(self.queue_timeout_secs))
    }

    /// Builds a dedicated queue with these limits.
    pub fn build_queue(&self) -> JobQueue {
        JobQueue::new(self.queue_concurrency, self.queue_timeout())
    }
}
