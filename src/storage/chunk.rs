//! Reference-counted chunk files

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::purge::{try_delete, PurgeList};
use crate::{ChunklineError, Result};

/// One persisted segment of the event stream
///
/// Size and end time are fixed by [`Chunk::finish`]. The backing file is deleted
/// when the last [`ChunkRef`] is dropped.
pub struct Chunk {
    path: PathBuf,
    state: Mutex<ChunkState>,
    ref_count: Mutex<usize>,
    purge_list: Arc<PurgeList>,
}

struct ChunkState {
    start_nanos: u64,
    end_nanos: Option<u64>,
    size: u64,
    handle: Option<File>,
}

/// Counted reference to a [`Chunk`]
///
/// Cloning uses the chunk, dropping releases it.
pub struct ChunkRef {
    chunk: Arc<Chunk>,
}

/// Immutable description of a chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Backing file
    pub path: PathBuf,
    /// Start timestamp (Unix epoch nanoseconds)
    pub start_nanos: u64,
    /// End timestamp, `None` while unfinished
    pub end_nanos: Option<u64>,
    /// Size in bytes (0 while unfinished)
    pub size: u64,
}

impl Chunk {
    /// Create the backing file and return the first reference to it
    ///
    /// The file must not exist yet, so an existing name surfaces as
    /// [`io::ErrorKind::AlreadyExists`].
    ///
    /// # Errors
    ///
    /// Returns the raw I/O error so callers can distinguish collisions
    pub fn create(path: &Path, purge_list: Arc<PurgeList>) -> io::Result<ChunkRef> {
        let handle = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;

        debug!("Created chunk {}", path.display());

        Ok(ChunkRef {
            chunk: Arc::new(Self {
                path: path.to_path_buf(),
                state: Mutex::new(ChunkState {
                    start_nanos: 0,
                    end_nanos: None,
                    size: 0,
                    handle: Some(handle),
                }),
                ref_count: Mutex::new(1),
                purge_list,
            }),
        })
    }

    /// Backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start timestamp
    #[must_use]
    pub fn start_time(&self) -> u64 {
        self.state.lock().start_nanos
    }

    /// Record the start timestamp reported by the stream writer
    pub fn set_start_time(&self, start_nanos: u64) {
        self.state.lock().start_nanos = start_nanos;
    }

    /// End timestamp, `None` while unfinished
    #[must_use]
    pub fn end_time(&self) -> Option<u64> {
        self.state.lock().end_nanos
    }

    /// Size in bytes, fixed once finished
    #[must_use]
    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    /// Whether [`Chunk::finish`] has been called
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.lock().end_nanos.is_some()
    }

    /// Current number of references
    #[must_use]
    pub fn ref_count(&self) -> usize {
        *self.ref_count.lock()
    }

    /// Snapshot of the chunk attributes
    #[must_use]
    pub fn info(&self) -> ChunkInfo {
        let state = self.state.lock();
        ChunkInfo {
            path: self.path.clone(),
            start_nanos: state.start_nanos,
            end_nanos: state.end_nanos,
            size: state.size,
        }
    }

    /// Close the write handle and fix the size and end time
    ///
    /// Finishing again with the same end time is a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if already finished with another end time or the file
    /// size cannot be read
    pub fn finish(&self, end_nanos: u64) -> Result<()> {
        let mut state = self.state.lock();

        if let Some(finished_at) = state.end_nanos {
            if finished_at == end_nanos {
                return Ok(());
            }
            return Err(ChunklineError::ChunkAlreadyFinished {
                path: self.path.clone(),
                finished_at,
                requested: end_nanos,
            });
        }

        if let Some(handle) = state.handle.take() {
            if let Err(e) = handle.sync_all() {
                warn!("Failed to sync chunk {}: {}", self.path.display(), e);
            }
        }

        state.size = std::fs::metadata(&self.path)?.len();
        state.end_nanos = Some(end_nanos);

        debug!(
            "Finished chunk {} ({} bytes)",
            self.path.display(),
            state.size
        );

        Ok(())
    }

    fn acquire(&self) {
        *self.ref_count.lock() += 1;
    }

    fn release(&self) {
        let remaining = {
            let mut count = self.ref_count.lock();
            *count = count.saturating_sub(1);
            *count
        };

        if remaining == 0 {
            self.destroy();
        }
    }

    fn destroy(&self) {
        // Drop an unfinished handle before deleting
        self.state.lock().handle.take();

        if try_delete(&self.path) {
            debug!("Deleted chunk {}", self.path.display());
        } else {
            warn!(
                "Chunk {} could not be deleted, queued for purge",
                self.path.display()
            );
            self.purge_list.add(self.path.clone());
        }
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Chunk")
            .field("path", &self.path)
            .field("start_nanos", &state.start_nanos)
            .field("end_nanos", &state.end_nanos)
            .field("size", &state.size)
            .finish_non_exhaustive()
    }
}

impl ChunkRef {
    /// Whether two references point at the same chunk
    #[must_use]
    pub fn same_chunk(&self, other: &ChunkRef) -> bool {
        Arc::ptr_eq(&self.chunk, &other.chunk)
    }
}

impl Deref for ChunkRef {
    type Target = Chunk;

    fn deref(&self) -> &Chunk {
        &self.chunk
    }
}

impl Clone for ChunkRef {
    fn clone(&self) -> Self {
        self.chunk.acquire();
        Self {
            chunk: Arc::clone(&self.chunk),
        }
    }
}

impl Drop for ChunkRef {
    fn drop(&mut self) {
        self.chunk.release();
    }
}

impl fmt::Debug for ChunkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.chunk, f)
    }
}
