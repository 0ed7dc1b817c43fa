//! Public handle to one recording

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::engine::Recorder;
use crate::recording::{ChunkStream, RecordingInfo, RecordingState};
use crate::settings::SettingsMap;
use crate::Result;

/// Handle to a recording owned by a [`Recorder`]
///
/// Cheap to clone; every call goes through the recorder lock. Dropping the
/// handle does not close the recording.
#[derive(Clone)]
pub struct Recording {
    id: u64,
    recorder: Arc<Recorder>,
}

impl Recording {
    pub(crate) fn new(id: u64, recorder: Arc<Recorder>) -> Self {
        Self { id, recorder }
    }

    /// Recording id
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Owning recorder
    #[must_use]
    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }

    /// Current state
    ///
    /// # Errors
    ///
    /// Returns error if the id is unknown to the recorder
    pub fn state(&self) -> Result<RecordingState> {
        self.recorder.state_of(self.id)
    }

    /// Immutable description
    ///
    /// # Errors
    ///
    /// Returns error once the recording is closed
    pub fn info(&self) -> Result<RecordingInfo> {
        self.recorder.info(self.id)
    }

    /// Start now
    ///
    /// # Errors
    ///
    /// See [`Recorder::start`]
    pub fn start(&self) -> Result<()> {
        self.recorder.start(self.id)
    }

    /// Start after `delay`
    ///
    /// # Errors
    ///
    /// See [`Recorder::schedule_start`]
    pub fn schedule_start(&self, delay: Duration) -> Result<()> {
        self.recorder.schedule_start(self.id, delay)
    }

    /// Stop
    ///
    /// # Errors
    ///
    /// See [`Recorder::stop`]
    pub fn stop(&self) -> Result<()> {
        self.recorder.stop(self.id)
    }

    /// Close and release all chunks
    ///
    /// # Errors
    ///
    /// See [`Recorder::close`]
    pub fn close(&self) -> Result<()> {
        self.recorder.close(self.id)
    }

    /// Replace all requested settings
    ///
    /// # Errors
    ///
    /// See [`Recorder::set_settings`]
    pub fn set_settings(&self, settings: SettingsMap) -> Result<()> {
        self.recorder.set_settings(self.id, settings)
    }

    /// Add or replace one requested setting
    ///
    /// # Errors
    ///
    /// See [`Recorder::set_settings`]
    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let mut settings = self.recorder.settings_of(self.id)?;
        settings.insert(key.to_string(), value.to_string());
        self.set_settings(settings)
    }

    /// Change the maximum chunk age
    ///
    /// # Errors
    ///
    /// Returns error if the recording is closed
    pub fn set_max_age(&self, max_age: Option<Duration>) -> Result<()> {
        self.recorder.set_max_age(self.id, max_age)
    }

    /// Change the maximum total size
    ///
    /// # Errors
    ///
    /// Returns error if the recording is closed
    pub fn set_max_size(&self, max_size: Option<u64>) -> Result<()> {
        self.recorder.set_max_size(self.id, max_size)
    }

    /// Change the copy target
    ///
    /// # Errors
    ///
    /// Returns error once stopped
    pub fn set_destination(&self, destination: Option<PathBuf>) -> Result<()> {
        self.recorder.set_destination(self.id, destination)
    }

    /// Change whether chunks are persisted
    ///
    /// # Errors
    ///
    /// Returns error once stopped
    pub fn set_to_disk(&self, to_disk: bool) -> Result<()> {
        self.recorder.set_to_disk(self.id, to_disk)
    }

    /// Change whether the recording is written out at shutdown
    ///
    /// # Errors
    ///
    /// Returns error if the recording is closed
    pub fn set_dump_on_exit(&self, dump_on_exit: bool) -> Result<()> {
        self.recorder.set_dump_on_exit(self.id, dump_on_exit)
    }

    /// Change the requested flush interval
    ///
    /// # Errors
    ///
    /// Returns error if the recording is closed
    pub fn set_flush_interval(&self, interval: Option<Duration>) -> Result<()> {
        self.recorder.set_flush_interval(self.id, interval)
    }

    /// Change the automatic stop delay
    ///
    /// # Errors
    ///
    /// See [`Recorder::set_duration`]
    pub fn set_duration(&self, duration: Option<Duration>) -> Result<()> {
        self.recorder.set_duration(self.id, duration)
    }

    /// Change the display name
    ///
    /// # Errors
    ///
    /// Returns error if the recording is closed
    pub fn set_name(&self, name: &str) -> Result<()> {
        self.recorder.set_name(self.id, name)
    }

    /// New stopped recording sharing this one's chunks
    ///
    /// # Errors
    ///
    /// See [`Recorder::snapshot`]
    pub fn snapshot(&self) -> Result<Recording> {
        self.recorder.snapshot(self.id)
    }

    /// Write the chunks to `path`
    ///
    /// # Errors
    ///
    /// See [`Recorder::dump`]
    pub fn dump(&self, path: &Path) -> Result<u64> {
        self.recorder.dump(self.id, path)
    }

    /// Reader over chunks overlapping `[start, end]`
    ///
    /// # Errors
    ///
    /// See [`Recorder::open_stream`]
    pub fn open_stream(&self, start: u64, end: u64) -> Result<ChunkStream> {
        self.recorder.open_stream(self.id, start, end)
    }

    /// Trim by time window and size
    ///
    /// # Errors
    ///
    /// See [`Recorder::filter`]
    pub fn filter(&self, begin: Option<u64>, end: Option<u64>, max_size: Option<u64>) -> Result<()> {
        self.recorder.filter(self.id, begin, end, max_size)
    }
}

impl fmt::Debug for Recording {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recording")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
