//! Error types for Chunkline

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::recording::RecordingState;

/// Result type for Chunkline operations
pub type Result<T> = std::result::Result<T, ChunklineError>;

/// Errors that can occur in Chunkline
#[derive(Debug, Error)]
pub enum ChunklineError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Repository directory cannot be created or used
    #[error("Repository unavailable at {}: {reason}", path.display())]
    RepositoryUnavailable {
        /// Directory that could not be used
        path: PathBuf,
        /// Underlying cause
        reason: String,
    },

    /// Chunk was already finished with another end time
    #[error("Chunk {} already finished at {finished_at}, refusing end time {requested}", path.display())]
    ChunkAlreadyFinished {
        /// Chunk file
        path: PathBuf,
        /// End time it was finished with
        finished_at: u64,
        /// End time of the rejected call
        requested: u64,
    },

    /// Recording state transition not permitted
    #[error("Invalid recording transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state
        from: RecordingState,
        /// Requested state
        to: RecordingState,
    },

    /// Recording id is unknown to the recorder
    #[error("Recording not found: {0}")]
    RecordingNotFound(u64),

    /// Operation requires a recording in another state
    #[error("Recording {id} is {state}: {message}")]
    WrongState {
        /// Recording id
        id: u64,
        /// State it is in
        state: RecordingState,
        /// What was attempted
        message: String,
    },

    /// Setting key or value rejected
    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    /// Invalid chunk file format
    #[error("Invalid chunk format: {0}")]
    InvalidFormat(String),

    /// Chunk record corrupted (CRC mismatch)
    #[error("Chunk corrupted at offset {offset}: expected CRC {expected:#x}, got {actual:#x}")]
    CorruptedData {
        /// Offset of the damaged record
        offset: u64,
        /// CRC stored in the record
        expected: u32,
        /// CRC computed from the payload
        actual: u32,
    },

    /// Stream writer failed
    #[error("Stream writer error: {0}")]
    StreamWriter(String),

    /// Timers need a tokio runtime
    #[error("No tokio runtime available for scheduling")]
    NoRuntime,

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Recorder has been shut down
    #[error("Recorder is shut down")]
    Shutdown,
}

impl ChunklineError {
    /// Whether this error means durable storage is gone
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RepositoryUnavailable { .. })
    }
}

/// Run caller-supplied logic, turning both errors and panics into a message
pub(crate) fn isolate<T, E: std::fmt::Display>(
    f: impl FnOnce() -> std::result::Result<T, E>,
) -> std::result::Result<T, String> {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => Err(panic_message(payload.as_ref())),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}
