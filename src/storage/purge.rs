//! Deferred deletion of chunk files

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Bounded list of files whose deletion failed and must be retried
pub struct PurgeList {
    paths: Mutex<VecDeque<PathBuf>>,
    capacity: usize,
}

impl PurgeList {
    /// Create a purge list holding at most `capacity` paths
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "purge list capacity must be > 0");

        Self {
            paths: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
        }
    }

    /// Queue a path for a later deletion attempt, evicting the oldest entry when full
    pub fn add(&self, path: PathBuf) {
        let mut paths = self.paths.lock();
        if paths.len() >= self.capacity {
            if let Some(evicted) = paths.pop_front() {
                warn!(
                    "Purge list full, giving up on {}",
                    evicted.display()
                );
            }
        }
        paths.push_back(path);
    }

    /// Retry every queued deletion, returning how many files are gone now
    pub fn purge(&self) -> usize {
        let mut paths = self.paths.lock();
        let before = paths.len();
        paths.retain(|path| !try_delete(path));
        let purged = before - paths.len();

        if purged > 0 {
            debug!("Purged {} deferred chunk files", purged);
        }

        purged
    }

    /// Number of queued paths
    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.lock().len()
    }

    /// Whether nothing is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.lock().is_empty()
    }

    /// Whether `path` is queued
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        self.paths.lock().iter().any(|queued| queued == path)
    }
}

/// Delete a file, treating an already-missing file as success
pub(crate) fn try_delete(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => true,
        Err(e) => {
            debug!("Could not delete {}: {}", path.display(), e);
            false
        }
    }
}
