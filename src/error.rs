//! Host-level runtime errors.
//!
//! Managed exceptions never travel through these types; they live in the
//! per-thread exception slot. These errors cover configuration, program
//! loading and the boundary where an uncaught managed exception leaves the VM.

use std::path::PathBuf;

use thiserror::Error;

use crate::jit::{MemoryError, StackMapError};

/// Runtime result type
pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {what}: {message}")]
    Parse { what: String, message: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid program: {0}")]
    InvalidProgram(String),

    #[error("duplicate class `{0}`")]
    DuplicateClass(String),

    #[error("unknown class `{0}`")]
    UnknownClass(String),

    #[error("unknown method `{0}`")]
    UnknownMethod(String),

    #[error("uncaught exception {class}: {message}")]
    UncaughtException {
        class: String,
        message: String,
        trace: Vec<String>,
    },

    #[error("failed to spawn thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    #[error("thread {0} panicked")]
    ThreadPanicked(u32),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    StackMap(#[from] StackMapError),
}
