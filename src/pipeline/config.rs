//! Pipeline configuration

use std::time::Duration;

use super::error::PipelineError;

/// Pipeline configuration options
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Worker states in the pool; also the in-flight limit
    pub max_parallel_items: usize,

    /// How long the merger waits for a result before re-checking for stop
    pub merge_wait: Duration,

    /// How long the dispatcher waits on the source per poll
    pub source_poll: Duration,

    /// Prefix for the dispatcher and merger thread names
    pub name: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_parallel_items: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            merge_wait: Duration::from_millis(50),
            source_poll: Duration::from_millis(50),
            name: "pipeline".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the worker pool size
    pub fn max_parallel_items(mut self, n: usize) -> Self {
        self.max_parallel_items = n;
        self
    }

    /// Set the merger wait timeout
    pub fn merge_wait(mut self, wait: Duration) -> Self {
        self.merge_wait = wait;
        self
    }

    /// Set the source poll timeout
    pub fn source_poll(mut self, poll: Duration) -> Self {
        self.source_poll = poll;
        self
    }

    /// Set the thread name prefix
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.max_parallel_items == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_parallel_items must be at least 1".into(),
            ));
        }
        if self.merge_wait.is_zero() {
            return Err(PipelineError::InvalidConfig("merge_wait must be non-zero".into()));
        }
        Ok(())
    }
}
