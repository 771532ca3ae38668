//! Error types for analytics workers

use crate::config::ConfigError;
use analytics_amqp::AmqpError;
use thiserror::Error;

/// Result type alias for worker operations
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Errors surfaced by the worker framework
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("AMQP error: {0}")]
    Amqp(#[from] AmqpError),

    /// An output was not given as `name:endpoint`
    #[error("Invalid output specification {0:?}: expected name:endpoint")]
    InvalidOutput(String),

    /// The same output name was given twice
    #[error("Duplicate output: {0}")]
    DuplicateOutput(String),

    #[error("Unknown output: {0}")]
    UnknownOutput(String),

    /// The publisher behind an output has exited
    #[error("Output {0} has stopped unexpectedly")]
    OutputStopped(String),

    /// The queue reader exited while the worker was still running
    #[error("Queue reader quit unexpectedly: {0}")]
    ReaderStopped(String),

    #[error("Logging initialisation failed: {0}")]
    Logging(String),

    /// Returned by event handlers; logged and skipped by the worker loop
    #[error("Handler error: {0}")]
    Handler(String),
}

impl WorkerError {
    pub fn invalid_output(spec: impl Into<String>) -> Self {
        Self::InvalidOutput(spec.into())
    }

    pub fn unknown_output(name: impl Into<String>) -> Self {
        Self::UnknownOutput(name.into())
    }

    pub fn output_stopped(name: impl Into<String>) -> Self {
        Self::OutputStopped(name.into())
    }

    pub fn reader_stopped(msg: impl Into<String>) -> Self {
        Self::ReaderStopped(msg.into())
    }

    pub fn logging(msg: impl Into<String>) -> Self {
        Self::Logging(msg.into())
    }

    /// Create a handler error
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }
}
