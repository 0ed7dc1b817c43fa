//! Recorder: rotation, chunk attribution and recording lifecycle

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use super::handle::Recording;
use super::periodic::{spawn_periodic, spawn_start_timer, spawn_stop_timer};
use crate::config::Config;
use crate::recording::{
    ChunkStream, RecordingInfo, RecordingOptions, RecordingSession, RecordingState,
    DUMP_EXTENSION,
};
use crate::request::{Hook, HookSchedule, RequestEngine};
use crate::settings::{
    EffectiveSettings, EventHandle, PeriodControl, SettingKey, SettingsManager, SettingsMap,
    SettingsRegistry, PERIOD,
};
use crate::storage::{ChunkRef, Repository};
use crate::stream::StreamWriter;
use crate::{ChunklineError, Result};

/// Owner of the live recording set and the chunk currently being written
///
/// Every state change happens under one lock, in the order recorder state,
/// settings manager, request engine. Boundary hooks run while that lock is
/// held and must not call back into the recorder.
pub struct Recorder {
    state: Mutex<RecorderState>,
    writer: Arc<dyn StreamWriter>,
    repository: Repository,
    settings: SettingsManager,
    requests: Arc<RequestEngine>,
    runtime: Option<Handle>,
    periodic: Mutex<Option<AbortHandle>>,
    last_flush: Mutex<Instant>,
    abort_on_fatal: bool,
    min_wait: Duration,
    disk_monitor_interval: Duration,
}

struct RecorderState {
    recordings: BTreeMap<u64, RecordingSession>,
    /// Chunk the stream writes to, `None` while idle or in memory
    current: Option<ChunkRef>,
    /// Stream time at which the current segment began
    segment_start: u64,
    next_id: u64,
    shut_down: bool,
}

impl RecorderState {
    fn running(&self) -> impl Iterator<Item = &RecordingSession> {
        self.recordings
            .values()
            .filter(|session| session.state() == RecordingState::Running)
    }

    fn running_count(&self) -> usize {
        self.running().count()
    }

    fn any_running_to_disk(&self, exclude: Option<u64>) -> bool {
        self.running()
            .any(|session| session.to_disk() && Some(session.id()) != exclude)
    }

    fn session(&self, id: u64) -> Result<&RecordingSession> {
        self.recordings
            .get(&id)
            .ok_or(ChunklineError::RecordingNotFound(id))
    }

    fn session_mut(&mut self, id: u64) -> Result<&mut RecordingSession> {
        self.recordings
            .get_mut(&id)
            .ok_or(ChunklineError::RecordingNotFound(id))
    }

    fn check_open(&self) -> Result<()> {
        if self.shut_down {
            Err(ChunklineError::Shutdown)
        } else {
            Ok(())
        }
    }
}

impl Recorder {
    /// Create a recorder writing through `writer`
    ///
    /// The repository directory is created immediately. When called inside a
    /// tokio runtime the periodic task is spawned on it; without a runtime,
    /// scheduled starts and durations are unavailable and
    /// [`Recorder::periodic_step`] must be driven by the caller.
    ///
    /// # Errors
    ///
    /// Returns [`ChunklineError::RepositoryUnavailable`] if the repository
    /// cannot be created
    pub fn new(config: &Config, writer: Arc<dyn StreamWriter>) -> Result<Arc<Self>> {
        let repository = Repository::ensure(&config.repository)?;
        let runtime = Handle::try_current().ok();
        let requests = Arc::new(RequestEngine::new(config.scheduler.min_wait()));

        let recorder = Arc::new(Self {
            state: Mutex::new(RecorderState {
                recordings: BTreeMap::new(),
                current: None,
                segment_start: 0,
                next_id: 1,
                shut_down: false,
            }),
            writer,
            repository,
            settings: SettingsManager::new(Arc::new(SettingsRegistry::new())),
            requests: Arc::clone(&requests),
            runtime,
            periodic: Mutex::new(None),
            last_flush: Mutex::new(Instant::now()),
            abort_on_fatal: config.abort_on_fatal,
            min_wait: config.scheduler.min_wait(),
            disk_monitor_interval: config.scheduler.disk_monitor_interval(),
        });

        if let Some(runtime) = &recorder.runtime {
            let task = spawn_periodic(runtime, &recorder, requests);
            *recorder.periodic.lock() = Some(task);
        } else {
            debug!("No tokio runtime, periodic task not started");
        }

        info!(
            "Recorder initialized at {}",
            recorder.repository.path().display()
        );
        Ok(recorder)
    }

    /// Registered events and controls
    #[must_use]
    pub fn registry(&self) -> &Arc<SettingsRegistry> {
        self.settings.registry()
    }

    /// Periodic hook scheduler
    #[must_use]
    pub fn request_engine(&self) -> &Arc<RequestEngine> {
        &self.requests
    }

    /// Chunk repository
    #[must_use]
    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    /// Register an event and its standard controls
    pub fn register_event(&self, selector: &str) -> EventHandle {
        self.registry().register_event(selector)
    }

    /// Register an event emitted by `hook`, with a `period` setting
    ///
    /// The hook fires at every chunk boundary until a running recording
    /// requests another period, and only while the event is enabled.
    pub fn register_periodic_event(&self, selector: &str, hook: Hook) -> EventHandle {
        let handle = self.register_event(selector);
        self.requests.add_hook(
            selector,
            handle.enabled_flag(),
            HookSchedule::EveryChunk,
            hook,
        );
        self.registry().register_control(
            SettingKey::new(selector, PERIOD),
            Arc::new(PeriodControl::new(selector, Arc::clone(&self.requests))),
        );
        handle
    }

    /// Create a recording in state `New`
    ///
    /// # Errors
    ///
    /// Returns [`ChunklineError::Shutdown`] after [`Recorder::shutdown`]
    pub fn create_recording(self: &Arc<Self>, options: RecordingOptions) -> Result<Recording> {
        let mut st = self.state.lock();
        st.check_open()?;

        let id = st.next_id;
        st.next_id += 1;
        info!("Created recording {} ({})", id, options.name);
        st.recordings.insert(id, RecordingSession::new(id, options));

        Ok(Recording::new(id, Arc::clone(self)))
    }

    /// Handle to an existing recording
    #[must_use]
    pub fn recording(self: &Arc<Self>, id: u64) -> Option<Recording> {
        self.state
            .lock()
            .recordings
            .contains_key(&id)
            .then(|| Recording::new(id, Arc::clone(self)))
    }

    /// Descriptions of every recording not yet closed
    #[must_use]
    pub fn recordings(&self) -> Vec<RecordingInfo> {
        self.state
            .lock()
            .recordings
            .values()
            .map(RecordingSession::info)
            .collect()
    }

    /// Description of one recording
    ///
    /// # Errors
    ///
    /// Returns error if the recording is unknown or closed
    pub fn info(&self, id: u64) -> Result<RecordingInfo> {
        Ok(self.state.lock().session(id)?.info())
    }

    /// Current state of a recording; closed recordings report `Closed`
    ///
    /// # Errors
    ///
    /// Returns error if the id was never issued
    pub fn state_of(&self, id: u64) -> Result<RecordingState> {
        let st = self.state.lock();
        match st.recordings.get(&id) {
            Some(session) => Ok(session.state()),
            None if id > 0 && id < st.next_id => Ok(RecordingState::Closed),
            None => Err(ChunklineError::RecordingNotFound(id)),
        }
    }

    /// Settings requested by one recording
    ///
    /// # Errors
    ///
    /// Returns error if the recording is unknown or closed
    pub fn settings_of(&self, id: u64) -> Result<SettingsMap> {
        Ok(self.state.lock().session(id)?.settings().clone())
    }

    /// Effective settings of the last reconciliation
    #[must_use]
    pub fn effective_settings(&self) -> EffectiveSettings {
        self.settings.effective()
    }

    /// Start a recording now
    ///
    /// The first running recording begins the stream; later ones rotate it so
    /// each chunk covers one fixed set of recordings and settings.
    ///
    /// # Errors
    ///
    /// Returns error for an invalid transition, a duration without a runtime,
    /// or a stream or repository failure
    pub fn start(self: &Arc<Self>, id: u64) -> Result<()> {
        let mut st = self.state.lock();
        st.check_open()?;

        let session = st.session(id)?;
        session.check_transition(RecordingState::Running)?;
        let to_disk = session.to_disk();
        let duration = session.options().duration;
        if duration.is_some() && self.runtime.is_none() {
            return Err(ChunklineError::NoRuntime);
        }

        if st.running_count() == 0 {
            self.begin_physical(&mut st, id, to_disk)?;
        } else {
            self.begin_logical(&mut st, id, to_disk)?;
        }

        let stop_timer = match (duration, &self.runtime) {
            (Some(duration), Some(runtime)) => Some(spawn_stop_timer(runtime, self, id, duration)),
            _ => None,
        };

        let session = st.session_mut(id)?;
        session.cancel_start_timer();
        if let Some(timer) = stop_timer {
            session.set_stop_timer(timer);
        }
        let name = session.options().name.clone();

        self.update_flush_interval(&st);
        info!("Started recording {} ({})", id, name);
        Ok(())
    }

    fn begin_physical(&self, st: &mut RecorderState, id: u64, to_disk: bool) -> Result<()> {
        let chunk = if to_disk {
            Some(self.new_chunk()?)
        } else {
            None
        };

        let timestamp = self
            .writer
            .set_output_path(chunk.as_ref().map(|chunk| chunk.path()))?;
        self.writer.begin()?;

        if let Some(chunk) = &chunk {
            chunk.set_start_time(timestamp);
        }
        st.current = chunk;
        st.segment_start = timestamp;

        st.session_mut(id)?.mark_running(timestamp)?;
        self.apply_settings(st, None);
        self.requests.do_chunk_begin();

        debug!(
            "Stream began at {} ({})",
            timestamp,
            if to_disk { "disk" } else { "memory" }
        );
        Ok(())
    }

    fn begin_logical(&self, st: &mut RecorderState, id: u64, to_disk: bool) -> Result<()> {
        self.apply_settings(st, None);
        self.requests.do_chunk_end();

        let to_disk_next = to_disk || st.any_running_to_disk(None);
        self.rotate_locked(st, to_disk_next)?;

        let timestamp = st.segment_start;
        st.session_mut(id)?.mark_running(timestamp)?;
        self.apply_settings(st, None);
        self.requests.do_chunk_begin();
        Ok(())
    }

    /// Start a recording after `delay`
    ///
    /// # Errors
    ///
    /// Returns error for an invalid transition or without a tokio runtime
    pub fn schedule_start(self: &Arc<Self>, id: u64, delay: Duration) -> Result<()> {
        let runtime = self.runtime.as_ref().ok_or(ChunklineError::NoRuntime)?;

        let mut st = self.state.lock();
        st.check_open()?;
        let session = st.session_mut(id)?;
        session.transition(RecordingState::Delayed)?;
        session.set_start_timer(spawn_start_timer(runtime, self, id, delay));

        info!("Recording {} scheduled to start in {:?}", id, delay);
        Ok(())
    }

    /// Stop a running recording
    ///
    /// The chunk being written is finished and attached to every running
    /// recording, including this one. With a destination, the retained chunks
    /// are copied there and the recording is closed.
    ///
    /// # Errors
    ///
    /// Returns error if the recording is not running, or a stream, repository
    /// or copy failure
    pub fn stop(&self, id: u64) -> Result<()> {
        let mut st = self.state.lock();
        st.check_open()?;
        self.stop_locked(&mut st, id)?;

        let session = st.session(id)?;
        if let Some(destination) = session.options().destination.clone() {
            session.write_to(&destination)?;
            info!(
                "Recording {} written to {}",
                id,
                destination.display()
            );
            Self::close_locked(&mut st, id);
        }
        Ok(())
    }

    fn stop_locked(&self, st: &mut RecorderState, id: u64) -> Result<()> {
        st.session(id)?.check_transition(RecordingState::Stopped)?;

        if st.running_count() == 1 {
            self.end_physical(st, id)?;
        } else {
            self.end_logical(st, id)?;
        }

        let session = st.session_mut(id)?;
        session.cancel_stop_timer();
        let name = session.options().name.clone();

        self.update_flush_interval(st);
        info!("Stopped recording {} ({})", id, name);
        Ok(())
    }

    fn end_physical(&self, st: &mut RecorderState, id: u64) -> Result<()> {
        self.requests.do_chunk_end();
        self.rotate_locked(st, false)?;
        self.writer.end()?;
        self.settings.disable_all();

        let timestamp = st.segment_start;
        st.session_mut(id)?.mark_stopped(timestamp)?;
        debug!("Stream ended at {}", timestamp);
        Ok(())
    }

    fn end_logical(&self, st: &mut RecorderState, id: u64) -> Result<()> {
        self.requests.do_chunk_end();
        self.apply_settings(st, Some(id));

        let to_disk_next = st.any_running_to_disk(Some(id));
        self.rotate_locked(st, to_disk_next)?;

        let timestamp = st.segment_start;
        st.session_mut(id)?.mark_stopped(timestamp)?;
        self.requests.do_chunk_begin();
        Ok(())
    }

    /// Close a recording and release its chunks
    ///
    /// A running recording is stopped first, without copying to its
    /// destination. Closing twice is not an error.
    ///
    /// # Errors
    ///
    /// Returns error if the id was never issued, or stopping fails
    pub fn close(&self, id: u64) -> Result<()> {
        let mut st = self.state.lock();

        match st.recordings.get(&id).map(RecordingSession::state) {
            None if id > 0 && id < st.next_id => return Ok(()),
            None => return Err(ChunklineError::RecordingNotFound(id)),
            Some(RecordingState::Running) => self.stop_locked(&mut st, id)?,
            Some(_) => {}
        }

        Self::close_locked(&mut st, id);
        Ok(())
    }

    fn close_locked(st: &mut RecorderState, id: u64) {
        if let Some(mut session) = st.recordings.remove(&id) {
            if session.close() {
                info!("Closed recording {} ({})", id, session.options().name);
            }
        }
    }

    /// Finish the current chunk and continue in a new one
    ///
    /// Used by the disk monitor; no settings change. Returns `false` when no
    /// recording is running.
    ///
    /// # Errors
    ///
    /// Returns error on a stream or repository failure
    pub fn rotate_chunk(&self) -> Result<bool> {
        let mut st = self.state.lock();
        st.check_open()?;
        if st.running_count() == 0 {
            return Ok(false);
        }

        self.requests.do_chunk_end();
        let to_disk_next = st.any_running_to_disk(None);
        self.rotate_locked(&mut st, to_disk_next)?;
        self.requests.do_chunk_begin();
        Ok(true)
    }

    /// Finish the current segment and attach it to every running recording
    ///
    /// In memory mode the buffered data is first dumped into a fresh chunk.
    /// On failure the current chunk is left in place.
    fn rotate_locked(&self, st: &mut RecorderState, to_disk_next: bool) -> Result<()> {
        let next = if to_disk_next {
            Some(self.new_chunk()?)
        } else {
            None
        };
        let next_path = next.as_ref().map(|chunk| chunk.path().to_path_buf());

        let (finished, timestamp) = match st.current.take() {
            Some(current) => match self.writer.set_output_path(next_path.as_deref()) {
                Ok(timestamp) => (current, timestamp),
                Err(e) => {
                    st.current = Some(current);
                    return Err(e);
                }
            },
            None => {
                let dump = self.new_chunk()?;
                self.writer.set_output_path(Some(dump.path()))?;
                dump.set_start_time(st.segment_start);
                let timestamp = self.writer.set_output_path(next_path.as_deref())?;
                (dump, timestamp)
            }
        };

        if let Some(next) = &next {
            next.set_start_time(timestamp);
        }
        st.current = next;
        st.segment_start = timestamp;

        self.finish_chunk(st, finished, timestamp)
    }

    fn finish_chunk(&self, st: &mut RecorderState, chunk: ChunkRef, end: u64) -> Result<()> {
        chunk.finish(end)?;

        let mut attached = 0usize;
        for session in st.recordings.values_mut() {
            if session.state() == RecordingState::Running {
                session.append_chunk(chunk.clone(), end);
                attached += 1;
            }
        }

        debug!(
            "Rotated chunk {} ({} bytes) into {} recordings",
            chunk.path().display(),
            chunk.size(),
            attached
        );
        drop(chunk);

        let purged = self.repository.purge();
        if purged > 0 {
            debug!("Purged {} deferred chunk files", purged);
        }
        Ok(())
    }

    fn new_chunk(&self) -> Result<ChunkRef> {
        self.repository.new_chunk().map_err(|e| self.fatal(e))
    }

    /// Abort on a fatal error when configured to, otherwise hand it back
    fn fatal(&self, err: ChunklineError) -> ChunklineError {
        if err.is_fatal() && self.abort_on_fatal {
            error!("Fatal recorder error, aborting: {}", err);
            std::process::abort();
        }
        err
    }

    fn apply_settings(&self, st: &RecorderState, exclude: Option<u64>) {
        let requests: Vec<&SettingsMap> = st
            .running()
            .filter(|session| Some(session.id()) != exclude)
            .map(RecordingSession::settings)
            .collect();
        self.settings.apply(&requests);
    }

    fn update_flush_interval(&self, st: &RecorderState) {
        let interval = st
            .running()
            .filter(|session| session.to_disk())
            .filter_map(|session| session.options().flush_interval)
            .min();
        self.requests.set_flush_interval(interval);
    }

    /// Replace the requested settings
    ///
    /// On a running recording, a change of the effective configuration
    /// rotates first so the finished chunk keeps the old settings.
    ///
    /// # Errors
    ///
    /// Returns error if the recording is unknown or rotation fails
    pub fn set_settings(&self, id: u64, settings: SettingsMap) -> Result<()> {
        let mut st = self.state.lock();
        st.check_open()?;

        if st.session(id)?.state() != RecordingState::Running {
            st.session_mut(id)?.set_settings(settings);
            return Ok(());
        }

        let resolved = {
            let requests: Vec<&SettingsMap> = st
                .running()
                .map(|session| {
                    if session.id() == id {
                        &settings
                    } else {
                        session.settings()
                    }
                })
                .collect();
            self.settings.resolve(&requests)
        };

        if resolved == self.settings.effective() {
            st.session_mut(id)?.set_settings(settings);
            return Ok(());
        }

        self.requests.do_chunk_end();
        let to_disk_next = st.any_running_to_disk(None);
        self.rotate_locked(&mut st, to_disk_next)?;
        st.session_mut(id)?.set_settings(settings);
        self.apply_settings(&st, None);
        self.requests.do_chunk_begin();

        debug!("Recording {} settings changed, chunk rotated", id);
        Ok(())
    }

    /// Change the maximum chunk age and reapply retention
    ///
    /// # Errors
    ///
    /// Returns error if the recording is unknown or the recorder shut down
    pub fn set_max_age(&self, id: u64, max_age: Option<Duration>) -> Result<()> {
        let mut st = self.state.lock();
        st.check_open()?;
        let now = self.writer.now();
        let session = st.session_mut(id)?;
        session.set_max_age(max_age);
        session.trim(now);
        Ok(())
    }

    /// Change the maximum total size and reapply retention
    ///
    /// # Errors
    ///
    /// Returns error if the recording is unknown or the recorder shut down
    pub fn set_max_size(&self, id: u64, max_size: Option<u64>) -> Result<()> {
        let mut st = self.state.lock();
        st.check_open()?;
        let now = self.writer.now();
        let session = st.session_mut(id)?;
        session.set_max_size(max_size);
        session.trim(now);
        Ok(())
    }

    /// Change the copy target
    ///
    /// # Errors
    ///
    /// Returns error if the recording is unknown or already stopped
    pub fn set_destination(&self, id: u64, destination: Option<PathBuf>) -> Result<()> {
        let mut st = self.state.lock();
        st.check_open()?;
        st.session_mut(id)?.set_destination(destination)
    }

    /// Change whether chunks are persisted
    ///
    /// A running recording switching to disk while the stream is in memory
    /// rotates so the following data lands in a chunk file.
    ///
    /// # Errors
    ///
    /// Returns error if the recording is unknown or already stopped, or the
    /// rotation fails
    pub fn set_to_disk(&self, id: u64, to_disk: bool) -> Result<()> {
        let mut st = self.state.lock();
        st.check_open()?;
        let session = st.session_mut(id)?;
        session.set_to_disk(to_disk)?;
        let running = session.state() == RecordingState::Running;

        if running && to_disk && st.current.is_none() {
            self.requests.do_chunk_end();
            self.rotate_locked(&mut st, true)?;
            self.requests.do_chunk_begin();
        }
        self.update_flush_interval(&st);
        Ok(())
    }

    /// Change whether the recording is written out at shutdown
    ///
    /// # Errors
    ///
    /// Returns error if the recording is unknown or the recorder shut down
    pub fn set_dump_on_exit(&self, id: u64, dump_on_exit: bool) -> Result<()> {
        let mut st = self.state.lock();
        st.check_open()?;
        st.session_mut(id)?.set_dump_on_exit(dump_on_exit);
        Ok(())
    }

    /// Change the requested stream flush interval
    ///
    /// # Errors
    ///
    /// Returns error if the recording is unknown or the recorder shut down
    pub fn set_flush_interval(&self, id: u64, interval: Option<Duration>) -> Result<()> {
        let mut st = self.state.lock();
        st.check_open()?;
        st.session_mut(id)?.set_flush_interval(interval);
        self.update_flush_interval(&st);
        Ok(())
    }

    /// Change the display name
    ///
    /// # Errors
    ///
    /// Returns error if the recording is unknown or the recorder shut down
    pub fn set_name(&self, id: u64, name: &str) -> Result<()> {
        let mut st = self.state.lock();
        st.check_open()?;
        st.session_mut(id)?.set_name(name);
        Ok(())
    }

    /// Change the automatic stop delay
    ///
    /// On a running recording the stop timer is rescheduled relative to its
    /// start time; an elapsed duration stops it at once.
    ///
    /// # Errors
    ///
    /// Returns error if the recording is unknown, or a duration is set on a
    /// running recording without a tokio runtime
    pub fn set_duration(self: &Arc<Self>, id: u64, duration: Option<Duration>) -> Result<()> {
        let mut st = self.state.lock();
        st.check_open()?;
        let now = self.writer.now();
        let session = st.session_mut(id)?;
        let running = session.state() == RecordingState::Running;
        if running && duration.is_some() && self.runtime.is_none() {
            return Err(ChunklineError::NoRuntime);
        }
        session.set_duration(duration);

        let (true, Some(duration), Some(runtime)) = (running, duration, self.runtime.as_ref())
        else {
            session.cancel_stop_timer();
            return Ok(());
        };

        let elapsed = Duration::from_nanos(now.saturating_sub(session.start_time().unwrap_or(now)));
        let remaining = duration.saturating_sub(elapsed);
        session.set_stop_timer(spawn_stop_timer(runtime, self, id, remaining));
        debug!("Recording {} stops in {:?}", id, remaining);
        Ok(())
    }

    /// Copy a recording into a new stopped recording sharing its chunks
    ///
    /// A running source is rotated first so its data so far is in finished
    /// chunks; the source itself is not otherwise affected.
    ///
    /// # Errors
    ///
    /// Returns error if the recording is unknown or rotation fails
    pub fn snapshot(self: &Arc<Self>, id: u64) -> Result<Recording> {
        let mut st = self.state.lock();
        st.check_open()?;

        if st.session(id)?.state() == RecordingState::Running {
            self.requests.do_chunk_end();
            let to_disk_next = st.any_running_to_disk(None);
            self.rotate_locked(&mut st, to_disk_next)?;
            self.requests.do_chunk_begin();
        }

        let snapshot_id = st.next_id;
        st.next_id += 1;
        let now = self.writer.now();
        let snapshot = st.session(id)?.snapshot(snapshot_id, now);
        info!(
            "Snapshot {} of recording {} holds {} chunks",
            snapshot_id,
            id,
            snapshot.chunk_count()
        );
        st.recordings.insert(snapshot_id, snapshot);

        Ok(Recording::new(snapshot_id, Arc::clone(self)))
    }

    /// Write the recording's chunks to `path`
    ///
    /// A running recording is rotated first. Returns the bytes written.
    ///
    /// # Errors
    ///
    /// Returns error if the recording is unknown, or rotation or the copy fails
    pub fn dump(&self, id: u64, path: &Path) -> Result<u64> {
        let mut st = self.state.lock();
        st.check_open()?;

        if st.session(id)?.state() == RecordingState::Running {
            self.requests.do_chunk_end();
            let to_disk_next = st.any_running_to_disk(None);
            self.rotate_locked(&mut st, to_disk_next)?;
            self.requests.do_chunk_begin();
        }

        st.session(id)?.write_to(path)
    }

    /// Reader over the chunks of a stopped recording overlapping `[start, end]`
    ///
    /// # Errors
    ///
    /// Returns [`ChunklineError::WrongState`] unless the recording is stopped
    pub fn open_stream(&self, id: u64, start: u64, end: u64) -> Result<ChunkStream> {
        let st = self.state.lock();
        let session = st.session(id)?;
        if session.state() != RecordingState::Stopped {
            return Err(ChunklineError::WrongState {
                id,
                state: session.state(),
                message: "stream requires a stopped recording".to_string(),
            });
        }
        Ok(ChunkStream::new(session.chunks_between(start, end)))
    }

    /// Trim a stopped recording by time window and size
    ///
    /// # Errors
    ///
    /// Returns [`ChunklineError::WrongState`] unless the recording is stopped
    pub fn filter(
        &self,
        id: u64,
        begin: Option<u64>,
        end: Option<u64>,
        max_size: Option<u64>,
    ) -> Result<()> {
        let mut st = self.state.lock();
        let session = st.session_mut(id)?;
        if session.state() != RecordingState::Stopped {
            return Err(ChunklineError::WrongState {
                id,
                state: session.state(),
                message: "filter requires a stopped recording".to_string(),
            });
        }
        session.filter(begin, end, max_size);
        Ok(())
    }

    /// One iteration of the background loop
    ///
    /// Advances periodic hooks, flushes the stream when the flush interval
    /// elapsed and rotates when the writer asks for it. Returns how long to
    /// wait before the next iteration.
    pub fn periodic_step(&self, elapsed: Duration) -> Duration {
        let mut wait = self.disk_monitor_interval;

        if let Some(next) = self.requests.tick(elapsed) {
            wait = wait.min(next);
        }

        if let Some(interval) = self.requests.flush_interval() {
            let mut last_flush = self.last_flush.lock();
            let since = last_flush.elapsed();
            if since >= interval {
                if let Err(e) = self.writer.flush() {
                    warn!("Stream flush failed: {}", e);
                }
                *last_flush = Instant::now();
                wait = wait.min(interval);
            } else {
                wait = wait.min(interval - since);
            }
        }

        if self.writer.should_rotate() {
            match self.rotate_chunk() {
                Ok(true) => debug!("Disk monitor rotated chunk"),
                Ok(false) | Err(ChunklineError::Shutdown) => {}
                Err(e) => warn!("Disk monitor rotation failed: {}", e),
            }
        }

        wait.max(self.min_wait)
    }

    /// Tear down: stop the background task and timers, write `dump_on_exit`
    /// recordings, stop and close everything and remove the repository
    ///
    /// Recordings flagged `dump_on_exit` without a destination are written to
    /// `<repository>/<name>-<id>.dump`. Calling it again does nothing.
    ///
    /// # Errors
    ///
    /// Returns the first failure; teardown continues past it
    pub fn shutdown(&self) -> Result<()> {
        if let Some(task) = self.periodic.lock().take() {
            task.abort();
        }

        let mut st = self.state.lock();
        if st.shut_down {
            return Ok(());
        }
        st.shut_down = true;
        info!("Recorder shutting down");

        let mut first_error: Option<ChunklineError> = None;
        let mut keep = |result: Result<()>| {
            if let Err(e) = result {
                warn!("Shutdown step failed: {}", e);
                first_error.get_or_insert(e);
            }
        };

        let running: Vec<u64> = st.running().map(RecordingSession::id).collect();
        let dumps: Vec<(u64, PathBuf)> = st
            .running()
            .filter(|session| session.options().dump_on_exit)
            .map(|session| (session.id(), self.dump_path(session)))
            .collect();

        for id in running {
            keep(self.stop_locked(&mut st, id));
        }

        for (id, path) in dumps {
            keep(st.session(id).and_then(|session| session.write_to(&path)).map(|bytes| {
                info!("Recording {} dumped to {} ({} bytes)", id, path.display(), bytes);
            }));
        }

        let ids: Vec<u64> = st.recordings.keys().copied().collect();
        for id in ids {
            Self::close_locked(&mut st, id);
        }
        st.current = None;
        drop(st);

        keep(self.repository.destroy());
        info!("Recorder shut down");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn dump_path(&self, session: &RecordingSession) -> PathBuf {
        session.options().destination.clone().unwrap_or_else(|| {
            self.repository.base().join(format!(
                "{}-{}.{DUMP_EXTENSION}",
                session.options().name,
                session.id()
            ))
        })
    }

    /// Whether [`Recorder::shutdown`] has run
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Some(task) = self.periodic.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{FileStreamWriter, StreamLimits};
    use tempfile::TempDir;

    fn recorder(dir: &TempDir) -> (Arc<Recorder>, Arc<FileStreamWriter>) {
        let writer = Arc::new(FileStreamWriter::new(StreamLimits::default()));
        let config = Config {
            repository: dir.path().to_path_buf(),
            abort_on_fatal: false,
            ..Config::default()
        };
        let recorder = Recorder::new(&config, Arc::clone(&writer) as Arc<dyn StreamWriter>).unwrap();
        (recorder, writer)
    }

    #[test]
    fn test_physical_begin_and_end() {
        let dir = TempDir::new().unwrap();
        let (recorder, writer) = recorder(&dir);
        let rec = recorder.create_recording(RecordingOptions::named("a")).unwrap();

        rec.start().unwrap();
        assert!(writer.is_active());
        assert!(!writer.is_in_memory());
        writer.write_event("ev", b"payload").unwrap();

        rec.stop().unwrap();
        assert!(!writer.is_active());

        let info = rec.info().unwrap();
        assert_eq!(info.state, RecordingState::Stopped);
        assert_eq!(info.chunks.len(), 1);
        assert!(info.chunks[0].end_nanos.is_some());
        assert!(info.start_time.is_some());
        assert!(info.stop_time >= info.start_time);
    }

    #[test]
    fn test_memory_mode_dumps_on_stop() {
        let dir = TempDir::new().unwrap();
        let (recorder, writer) = recorder(&dir);
        let rec = recorder
            .create_recording(RecordingOptions {
                to_disk: false,
                ..RecordingOptions::named("mem")
            })
            .unwrap();

        rec.start().unwrap();
        assert!(writer.is_in_memory());
        writer.write_event("ev", b"in memory").unwrap();
        rec.stop().unwrap();

        let info = rec.info().unwrap();
        assert_eq!(info.chunks.len(), 1);
        let records = crate::storage::ChunkFileReader::open(&info.chunks[0].path)
            .unwrap()
            .records()
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, b"in memory");
    }

    #[test]
    fn test_start_twice_is_invalid() {
        let dir = TempDir::new().unwrap();
        let (recorder, _writer) = recorder(&dir);
        let rec = recorder.create_recording(RecordingOptions::named("a")).unwrap();

        rec.start().unwrap();
        assert!(matches!(
            rec.start(),
            Err(ChunklineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_duration_needs_runtime() {
        let dir = TempDir::new().unwrap();
        let (recorder, writer) = recorder(&dir);
        let rec = recorder
            .create_recording(RecordingOptions {
                duration: Some(Duration::from_secs(1)),
                ..RecordingOptions::named("timed")
            })
            .unwrap();

        assert!(matches!(rec.start(), Err(ChunklineError::NoRuntime)));
        assert_eq!(rec.state().unwrap(), RecordingState::New);
        assert!(!writer.is_active());
    }

    #[test]
    fn test_rotate_chunk_without_running() {
        let dir = TempDir::new().unwrap();
        let (recorder, _writer) = recorder(&dir);
        assert!(!recorder.rotate_chunk().unwrap());
    }

    #[test]
    fn test_flush_interval_is_minimum_of_disk_recordings() {
        let dir = TempDir::new().unwrap();
        let (recorder, _writer) = recorder(&dir);
        let slow = recorder
            .create_recording(RecordingOptions {
                flush_interval: Some(Duration::from_secs(5)),
                ..RecordingOptions::named("slow")
            })
            .unwrap();
        let fast_memory = recorder
            .create_recording(RecordingOptions {
                to_disk: false,
                flush_interval: Some(Duration::from_millis(100)),
                ..RecordingOptions::named("memory")
            })
            .unwrap();

        slow.start().unwrap();
        fast_memory.start().unwrap();
        assert_eq!(
            recorder.request_engine().flush_interval(),
            Some(Duration::from_secs(5))
        );

        slow.stop().unwrap();
        assert_eq!(recorder.request_engine().flush_interval(), None);
    }

    #[test]
    fn test_periodic_step_rotates_when_writer_asks() {
        let dir = TempDir::new().unwrap();
        let writer = Arc::new(FileStreamWriter::new(StreamLimits {
            max_chunk_size: 128,
            ..StreamLimits::default()
        }));
        let config = Config {
            repository: dir.path().to_path_buf(),
            abort_on_fatal: false,
            ..Config::default()
        };
        let recorder =
            Recorder::new(&config, Arc::clone(&writer) as Arc<dyn StreamWriter>).unwrap();
        let rec = recorder.create_recording(RecordingOptions::named("a")).unwrap();
        rec.start().unwrap();

        writer.write_event("ev", &[0u8; 256]).unwrap();
        recorder.periodic_step(Duration::from_millis(10));

        assert_eq!(rec.info().unwrap().chunks.len(), 1);
        assert!(!writer.should_rotate());
    }

    #[test]
    fn test_fatal_error_returned_without_abort() {
        let dir = TempDir::new().unwrap();
        let (recorder, _writer) = recorder(&dir);
        let rec = recorder.create_recording(RecordingOptions::named("a")).unwrap();

        // Replace the instance directory with a file so it cannot be recreated
        std::fs::remove_dir_all(recorder.repository().path()).unwrap();
        std::fs::write(recorder.repository().path(), b"blocked").unwrap();

        let err = rec.start().unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(rec.state().unwrap(), RecordingState::New);
    }

    #[test]
    fn test_shutdown_rejects_further_use() {
        let dir = TempDir::new().unwrap();
        let (recorder, _writer) = recorder(&dir);
        let rec = recorder.create_recording(RecordingOptions::named("a")).unwrap();
        rec.start().unwrap();

        recorder.shutdown().unwrap();

        assert!(recorder.is_shut_down());
        assert!(!recorder.repository().path().exists());
        assert_eq!(rec.state().unwrap(), RecordingState::Closed);
        assert!(matches!(
            recorder.create_recording(RecordingOptions::named("late")),
            Err(ChunklineError::Shutdown)
        ));
        assert!(matches!(rec.set_name("late"), Err(ChunklineError::Shutdown)));
        assert!(matches!(
            rec.set_max_age(Some(Duration::from_secs(1))),
            Err(ChunklineError::Shutdown)
        ));
        assert!(matches!(rec.set_max_size(Some(1)), Err(ChunklineError::Shutdown)));
        assert!(matches!(rec.set_dump_on_exit(true), Err(ChunklineError::Shutdown)));
        assert!(matches!(
            rec.set_flush_interval(Some(Duration::from_secs(1))),
            Err(ChunklineError::Shutdown)
        ));
        assert!(matches!(rec.set_to_disk(false), Err(ChunklineError::Shutdown)));
        assert!(matches!(rec.set_destination(None), Err(ChunklineError::Shutdown)));
        assert!(matches!(rec.set_duration(None), Err(ChunklineError::Shutdown)));
        recorder.shutdown().unwrap();
    }
}
