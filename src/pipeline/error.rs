//! Pipeline error types

/// Error type for starting and stopping a pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// `start` was called on a running pipeline
    AlreadyRunning,
    /// A configuration value would break the pipeline's invariants
    InvalidConfig(String),
    /// Dispatcher or merger thread could not be spawned
    ThreadSpawn(String),
    /// `start` was called outside a tokio runtime
    NoRuntime,
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::AlreadyRunning => write!(f, "Pipeline is already running"),
            PipelineError::InvalidConfig(msg) => write!(f, "Invalid pipeline config: {}", msg),
            PipelineError::ThreadSpawn(msg) => write!(f, "Failed to spawn pipeline thread: {}", msg),
            PipelineError::NoRuntime => write!(f, "Pipeline must be started inside a tokio runtime"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::ThreadSpawn(e.to_string())
    }
}
