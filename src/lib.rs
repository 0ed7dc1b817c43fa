//! Chunkline - continuous chunked telemetry recorder
//!
//! One shared event stream is persisted as immutable, reference-counted chunks.
//! Any number of recordings observe that stream concurrently, each with its own
//! time window, settings and retention limits.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::field_reassign_with_default,
    clippy::multiple_crate_versions
)]

pub mod config;
pub mod error;
pub mod recorder;
pub mod recording;
pub mod request;
pub mod settings;
pub mod storage;
pub mod stream;

pub use error::{ChunklineError, Result};
pub use recorder::{Recorder, Recording};
pub use recording::RecordingState;
