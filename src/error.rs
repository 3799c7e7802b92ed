//! Error types for the execution bridge.

use thiserror::Error;

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the bridge.
#[derive(Debug, Error)]
pub enum Error {
    /// The engine's one-time runtime initialization failed.
    ///
    /// Fatal to the engine: every queued or later command is rejected
    /// instead of hanging.
    #[error("runtime initialization failed: {0}")]
    Init(String),

    /// The script itself raised a fault. Terminal for that execution only.
    #[error("script error: {0}")]
    Script(String),

    /// Execution was cancelled through the shared interrupt flag.
    #[error("execution interrupted")]
    Interrupted,

    /// Fetching or unpacking an archive failed. Reported as a diagnostic,
    /// never into an unrelated execution.
    #[error("file installation failed: {0}")]
    Install(String),

    /// The transport between coordinator and engine broke down.
    #[error("bridge error: {0}")]
    Bridge(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error is a cooperative-cancellation fault rather than
    /// a genuine script failure.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Interrupted)
    }
}
