// src/error.rs
use std::io;
use thiserror::Error;

/// Central error type for the etude engine.
///
/// Request-level problems never show up here: a malformed request or a
/// missing file becomes an HTTP status on the wire, not an `EtudeError`.
#[derive(Debug, Error)]
pub enum EtudeError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid or inconsistent configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The connection slab has no free slot left.
    #[error("Connection slab is full")]
    SlabFull,

    /// The worker pool's task queue is at its maximum depth.
    #[error("Task queue is full")]
    QueueFull,

    /// Worker threads could not be started or joined.
    #[error("Worker pool error: {0}")]
    Pool(String),

    /// Signal handler registration failed.
    #[error("Signal error: {0}")]
    Signal(String),
}

impl From<ctrlc::Error> for EtudeError {
    fn from(e: ctrlc::Error) -> Self {
        EtudeError::Signal(e.to_string())
    }
}

pub type EtudeResult<T> = Result<T, EtudeError>;
