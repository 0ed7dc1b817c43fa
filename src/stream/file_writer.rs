//! File-backed stream writer

use std::path::Path;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{now_nanos, StreamWriter};
use crate::storage::{encode_record, ChunkFileWriter, RECORD_FRAME_SIZE};
use crate::{ChunklineError, Result};

/// Rotation and buffering limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLimits {
    /// Request rotation once an output reaches this many bytes
    pub max_chunk_size: u64,
    /// Request rotation once an output is this old
    pub max_chunk_age: Option<Duration>,
    /// Memory buffer budget while no file output is set; oldest records are dropped
    pub max_memory: usize,
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self {
            max_chunk_size: 12 * 1024 * 1024, // 12 MB
            max_chunk_age: None,
            max_memory: 16 * 1024 * 1024, // 16 MB
        }
    }
}

/// Writes framed event records into chunk files, or into memory between files
pub struct FileStreamWriter {
    state: Mutex<WriterState>,
    limits: StreamLimits,
}

struct WriterState {
    active: bool,
    output: Option<ChunkFileWriter>,
    memory: BytesMut,
    events_written: u64,
    events_dropped: u64,
}

impl FileStreamWriter {
    /// Create an inactive writer
    #[must_use]
    pub fn new(limits: StreamLimits) -> Self {
        Self {
            state: Mutex::new(WriterState {
                active: false,
                output: None,
                memory: BytesMut::new(),
                events_written: 0,
                events_dropped: 0,
            }),
            limits,
        }
    }

    /// Append an event stamped with the current time
    ///
    /// Returns `false` when the stream is not active and the event was discarded.
    ///
    /// # Errors
    ///
    /// Returns error if the record is invalid or the write fails
    pub fn write_event(&self, name: &str, payload: &[u8]) -> Result<bool> {
        self.write_event_at(now_nanos(), name, payload)
    }

    /// Append an event with an explicit timestamp
    ///
    /// # Errors
    ///
    /// Returns error if the record is invalid or the write fails
    pub fn write_event_at(&self, timestamp: u64, name: &str, payload: &[u8]) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.active {
            return Ok(false);
        }

        if let Some(output) = state.output.as_mut() {
            output.append(timestamp, name, payload)?;
        } else {
            encode_record(&mut state.memory, timestamp, name, payload)?;
            let dropped = trim_memory(&mut state.memory, self.limits.max_memory);
            state.events_dropped += dropped;
        }

        state.events_written += 1;
        Ok(true)
    }

    /// Whether the stream is between `begin` and `end`
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Whether events currently go to memory rather than a file
    #[must_use]
    pub fn is_in_memory(&self) -> bool {
        self.state.lock().output.is_none()
    }

    /// Events accepted since creation
    #[must_use]
    pub fn events_written(&self) -> u64 {
        self.state.lock().events_written
    }

    /// Events evicted from the memory buffer
    #[must_use]
    pub fn events_dropped(&self) -> u64 {
        self.state.lock().events_dropped
    }

    /// Bytes waiting in the memory buffer
    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.state.lock().memory.len()
    }

    /// Configured limits
    #[must_use]
    pub fn limits(&self) -> StreamLimits {
        self.limits
    }
}

impl StreamWriter for FileStreamWriter {
    fn begin(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.active {
            return Err(ChunklineError::StreamWriter(
                "Stream already active".to_string(),
            ));
        }
        state.active = true;
        debug!("Stream started");
        Ok(())
    }

    fn end(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(output) = state.output.as_mut() {
            output.flush()?;
        }
        if !state.memory.is_empty() {
            warn!(
                "Stream ended with {} bytes still in memory, discarding",
                state.memory.len()
            );
            state.memory.clear();
        }
        state.active = false;
        debug!("Stream ended");
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(output) = state.output.as_mut() {
            output.flush()?;
        }
        Ok(())
    }

    fn should_rotate(&self) -> bool {
        let state = self.state.lock();
        state.output.as_ref().is_some_and(|output| {
            output.bytes_written() >= self.limits.max_chunk_size
                || self
                    .limits
                    .max_chunk_age
                    .is_some_and(|max_age| output.age() >= max_age)
        })
    }

    fn set_output_path(&self, path: Option<&Path>) -> Result<u64> {
        let mut state = self.state.lock();
        let timestamp = now_nanos();

        if let Some(previous) = state.output.take() {
            let previous_path = previous.path().to_path_buf();
            let size = previous.finish()?;
            debug!(
                "Closed stream output {} ({} bytes)",
                previous_path.display(),
                size
            );
        }

        if let Some(path) = path {
            let mut output = ChunkFileWriter::create(path, timestamp)?;
            if !state.memory.is_empty() {
                output.append_framed(&state.memory)?;
                state.memory.clear();
            }
            debug!("Stream output set to {}", path.display());
            state.output = Some(output);
        } else {
            debug!("Stream output set to memory");
        }

        Ok(timestamp)
    }
}

/// Drop whole records from the front until `memory` fits in `budget`
fn trim_memory(memory: &mut BytesMut, budget: usize) -> u64 {
    let mut dropped = 0;
    while memory.len() > budget && memory.len() >= RECORD_FRAME_SIZE {
        let body_len = u32::from_le_bytes([memory[0], memory[1], memory[2], memory[3]]) as usize;
        let frame = (RECORD_FRAME_SIZE + body_len).min(memory.len());
        memory.advance(frame);
        dropped += 1;
    }
    dropped
}
