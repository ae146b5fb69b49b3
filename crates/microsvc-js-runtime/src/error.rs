//! Error types for the JavaScript runtime.

use microsvc::CompileError;

/// Errors that can occur in the runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Channel closed")]
    ChannelClosed,

    #[error("{0}")]
    JavaScript(String),

    #[error("Failed to spawn thread: {0}")]
    SpawnFailed(#[from] std::io::Error),
}

impl From<RuntimeError> for CompileError {
    fn from(err: RuntimeError) -> Self {
        CompileError(err.to_string())
    }
}
