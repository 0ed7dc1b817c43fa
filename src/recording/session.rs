//! Per-recording state: attached chunks, retention limits and timers

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::debug;

use super::{RecordingOptions, RecordingState};
use crate::settings::SettingsMap;
use crate::storage::{ChunkInfo, ChunkRef};
use crate::{ChunklineError, Result};

/// Immutable description of a recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingInfo {
    /// Recording id
    pub id: u64,
    /// Display name
    pub name: String,
    /// Current state
    pub state: RecordingState,
    /// When it started running (Unix epoch nanoseconds)
    pub start_time: Option<u64>,
    /// When it stopped
    pub stop_time: Option<u64>,
    /// Total size of attached chunks in bytes
    pub size: u64,
    /// Attached chunks, oldest first
    pub chunks: Vec<ChunkInfo>,
    /// Persisted to disk
    pub to_disk: bool,
    /// Copy target on stop
    pub destination: Option<PathBuf>,
    /// Maximum chunk age
    pub max_age: Option<Duration>,
    /// Maximum total size
    pub max_size: Option<u64>,
    /// Automatic stop delay
    pub duration: Option<Duration>,
}

/// State of one recording, owned by the recorder and mutated under its lock
pub struct RecordingSession {
    id: u64,
    state: RecordingState,
    options: RecordingOptions,
    chunks: VecDeque<ChunkRef>,
    start_time: Option<u64>,
    stop_time: Option<u64>,
    start_timer: Option<AbortHandle>,
    stop_timer: Option<AbortHandle>,
}

impl RecordingSession {
    /// Create a recording in state `New`
    #[must_use]
    pub fn new(id: u64, options: RecordingOptions) -> Self {
        Self {
            id,
            state: RecordingState::New,
            options,
            chunks: VecDeque::new(),
            start_time: None,
            stop_time: None,
            start_timer: None,
            stop_timer: None,
        }
    }

    /// Recording id
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> RecordingState {
        self.state
    }

    /// Creation options, updated by the setters
    #[must_use]
    pub fn options(&self) -> &RecordingOptions {
        &self.options
    }

    /// Requested settings
    #[must_use]
    pub fn settings(&self) -> &SettingsMap {
        &self.options.settings
    }

    /// Whether running chunks are persisted
    #[must_use]
    pub fn to_disk(&self) -> bool {
        self.options.to_disk
    }

    /// Start timestamp
    #[must_use]
    pub fn start_time(&self) -> Option<u64> {
        self.start_time
    }

    /// Stop timestamp
    #[must_use]
    pub fn stop_time(&self) -> Option<u64> {
        self.stop_time
    }

    /// Check that `to` may follow the current state
    ///
    /// # Errors
    ///
    /// Returns [`ChunklineError::InvalidTransition`] otherwise
    pub fn check_transition(&self, to: RecordingState) -> Result<()> {
        if self.state.can_transition(to) {
            Ok(())
        } else {
            Err(ChunklineError::InvalidTransition {
                from: self.state,
                to,
            })
        }
    }

    /// Move to `to`
    ///
    /// # Errors
    ///
    /// Returns [`ChunklineError::InvalidTransition`] for a backward or skipped step
    pub fn transition(&mut self, to: RecordingState) -> Result<()> {
        self.check_transition(to)?;
        debug!("Recording {} {} -> {}", self.id, self.state, to);
        self.state = to;
        Ok(())
    }

    /// Mark running from `timestamp`
    ///
    /// # Errors
    ///
    /// Returns error if the recording cannot start
    pub fn mark_running(&mut self, timestamp: u64) -> Result<()> {
        self.transition(RecordingState::Running)?;
        self.start_time = Some(timestamp);
        Ok(())
    }

    /// Mark stopped at `timestamp`
    ///
    /// # Errors
    ///
    /// Returns error if the recording is not running
    pub fn mark_stopped(&mut self, timestamp: u64) -> Result<()> {
        self.transition(RecordingState::Stopped)?;
        self.stop_time = Some(timestamp);
        Ok(())
    }

    /// Close and release every chunk; a second call does nothing
    ///
    /// Returns whether this call closed the recording.
    pub fn close(&mut self) -> bool {
        if self.state == RecordingState::Closed {
            return false;
        }
        self.state = RecordingState::Closed;
        self.cancel_start_timer();
        self.cancel_stop_timer();
        self.chunks.clear();
        true
    }

    /// Attach a finished chunk, applying age then size retention
    ///
    /// The new chunk itself is subject to the age limit, so an already expired
    /// chunk is released at once.
    pub fn append_chunk(&mut self, chunk: ChunkRef, now: u64) {
        self.chunks.push_back(chunk);
        self.trim_by_age(now);
        self.trim_by_size();
    }

    /// Reapply both retention limits to the attached chunks
    pub fn trim(&mut self, now: u64) {
        self.trim_by_age(now);
        self.trim_by_size();
    }

    fn trim_by_age(&mut self, now: u64) {
        let Some(max_age) = self.options.max_age else {
            return;
        };
        let oldest_allowed = now.saturating_sub(max_age.as_nanos() as u64);

        while let Some(front) = self.chunks.front() {
            if front.end_time().unwrap_or(u64::MAX) >= oldest_allowed {
                break;
            }
            debug!(
                "Recording {} dropping expired chunk {}",
                self.id,
                front.path().display()
            );
            self.chunks.pop_front();
        }
    }

    fn trim_by_size(&mut self) {
        let Some(max_size) = self.options.max_size else {
            return;
        };

        let mut total = self.size();
        while total > max_size && self.chunks.len() > 1 {
            if let Some(dropped) = self.chunks.pop_front() {
                total -= dropped.size();
                debug!(
                    "Recording {} dropping chunk {} over size budget",
                    self.id,
                    dropped.path().display()
                );
            }
        }
    }

    /// Trim by time window and optionally by size
    ///
    /// Chunks ending before `begin` or starting after `end` are dropped. The size
    /// bound keeps the oldest chunks when only `begin` is given and the newest
    /// otherwise. At least one chunk survives the size bound.
    pub fn filter(&mut self, begin: Option<u64>, end: Option<u64>, max_size: Option<u64>) {
        if let Some(begin) = begin {
            self.chunks
                .retain(|chunk| chunk.end_time().unwrap_or(u64::MAX) >= begin);
        }
        if let Some(end) = end {
            self.chunks.retain(|chunk| chunk.start_time() <= end);
        }

        let Some(max_size) = max_size else {
            return;
        };
        let keep_oldest = begin.is_some() && end.is_none();
        let mut total = self.size();

        while total > max_size && self.chunks.len() > 1 {
            let dropped = if keep_oldest {
                self.chunks.pop_back()
            } else {
                self.chunks.pop_front()
            };
            if let Some(dropped) = dropped {
                total -= dropped.size();
            }
        }
    }

    /// Attached chunks, oldest first
    pub fn chunks(&self) -> impl Iterator<Item = &ChunkRef> {
        self.chunks.iter()
    }

    /// Number of attached chunks
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// New references to the chunks overlapping `[start, end]`
    #[must_use]
    pub fn chunks_between(&self, start: u64, end: u64) -> Vec<ChunkRef> {
        self.chunks
            .iter()
            .filter(|chunk| {
                chunk.end_time().unwrap_or(u64::MAX) >= start && chunk.start_time() <= end
            })
            .cloned()
            .collect()
    }

    /// Total size of attached chunks in bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.chunks.iter().map(|chunk| chunk.size()).sum()
    }

    /// Immutable description
    #[must_use]
    pub fn info(&self) -> RecordingInfo {
        RecordingInfo {
            id: self.id,
            name: self.options.name.clone(),
            state: self.state,
            start_time: self.start_time,
            stop_time: self.stop_time,
            size: self.size(),
            chunks: self.chunks.iter().map(|chunk| chunk.info()).collect(),
            to_disk: self.options.to_disk,
            destination: self.options.destination.clone(),
            max_age: self.options.max_age,
            max_size: self.options.max_size,
            duration: self.options.duration,
        }
    }

    /// Copy for a snapshot: same options and chunks, state `Stopped`
    #[must_use]
    pub fn snapshot(&self, id: u64, stop_time: u64) -> Self {
        let mut options = self.options.clone();
        options.destination = None;
        options.dump_on_exit = false;
        options.duration = None;

        Self {
            id,
            state: RecordingState::Stopped,
            options,
            chunks: self.chunks.clone(),
            start_time: self.start_time,
            stop_time: Some(stop_time),
            start_timer: None,
            stop_timer: None,
        }
    }

    /// Concatenate the attached chunk files into `path`
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns error if a chunk cannot be read or the target cannot be written
    pub fn write_to(&self, path: &Path) -> Result<u64> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut out = BufWriter::new(File::create(path)?);
        let mut written = 0u64;
        for chunk in &self.chunks {
            let mut input = File::open(chunk.path())?;
            written += io::copy(&mut input, &mut out)?;
        }
        out.flush()?;

        debug!(
            "Recording {} wrote {} chunks ({} bytes) to {}",
            self.id,
            self.chunks.len(),
            written,
            path.display()
        );
        Ok(written)
    }

    /// Change the display name
    pub fn set_name(&mut self, name: &str) {
        self.options.name = name.to_string();
    }

    /// Replace the requested settings
    pub fn set_settings(&mut self, settings: SettingsMap) {
        self.options.settings = settings;
    }

    /// Change the maximum chunk age; callers reapply retention with [`RecordingSession::trim`]
    pub fn set_max_age(&mut self, max_age: Option<Duration>) {
        self.options.max_age = max_age;
    }

    /// Change the maximum size; callers reapply retention with [`RecordingSession::trim`]
    pub fn set_max_size(&mut self, max_size: Option<u64>) {
        self.options.max_size = max_size;
    }

    /// Change the copy target
    ///
    /// # Errors
    ///
    /// Returns error once the recording has stopped
    pub fn set_destination(&mut self, destination: Option<PathBuf>) -> Result<()> {
        self.require_not_stopped("change destination")?;
        self.options.destination = destination;
        Ok(())
    }

    /// Change whether chunks are persisted
    ///
    /// # Errors
    ///
    /// Returns error once the recording has stopped
    pub fn set_to_disk(&mut self, to_disk: bool) -> Result<()> {
        self.require_not_stopped("change to_disk")?;
        self.options.to_disk = to_disk;
        Ok(())
    }

    /// Change whether the recording is written out at shutdown
    pub fn set_dump_on_exit(&mut self, dump_on_exit: bool) {
        self.options.dump_on_exit = dump_on_exit;
    }

    /// Change the requested flush interval
    pub fn set_flush_interval(&mut self, interval: Option<Duration>) {
        self.options.flush_interval = interval;
    }

    /// Change the automatic stop delay
    pub fn set_duration(&mut self, duration: Option<Duration>) {
        self.options.duration = duration;
    }

    fn require_not_stopped(&self, action: &str) -> Result<()> {
        if self.state >= RecordingState::Stopped {
            return Err(ChunklineError::WrongState {
                id: self.id,
                state: self.state,
                message: format!("cannot {action}"),
            });
        }
        Ok(())
    }

    /// Replace the pending start timer, aborting the previous one
    pub fn set_start_timer(&mut self, timer: AbortHandle) {
        self.cancel_start_timer();
        self.start_timer = Some(timer);
    }

    /// Abort the pending start timer
    pub fn cancel_start_timer(&mut self) {
        if let Some(timer) = self.start_timer.take() {
            timer.abort();
        }
    }

    /// Replace the pending stop timer, aborting the previous one
    pub fn set_stop_timer(&mut self, timer: AbortHandle) {
        self.cancel_stop_timer();
        self.stop_timer = Some(timer);
    }

    /// Abort the pending stop timer
    pub fn cancel_stop_timer(&mut self) {
        if let Some(timer) = self.stop_timer.take() {
            timer.abort();
        }
    }

    /// Whether a start timer is pending
    #[must_use]
    pub fn has_start_timer(&self) -> bool {
        self.start_timer.is_some()
    }

    /// Whether a stop timer is pending
    #[must_use]
    pub fn has_stop_timer(&self) -> bool {
        self.stop_timer.is_some()
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        self.cancel_start_timer();
        self.cancel_stop_timer();
    }
}
