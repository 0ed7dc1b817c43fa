//! Repository of chunk files for one recorder instance

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use tracing::{debug, info, warn};

use super::chunk::{Chunk, ChunkRef};
use super::purge::PurgeList;
use super::{CHUNK_EXTENSION, MAX_CHUNK_NAME_RETRIES, PURGE_LIST_CAPACITY};
use crate::{ChunklineError, Result};

/// Directory holding the chunk files of one process
///
/// Several processes may share the same base directory; each gets its own
/// `<timestamp>_<pid>` subdirectory.
pub struct Repository {
    base: PathBuf,
    dir: PathBuf,
    purge_list: Arc<PurgeList>,
}

impl Repository {
    /// Verify or create `base` and a fresh instance directory below it
    ///
    /// # Errors
    ///
    /// Returns [`ChunklineError::RepositoryUnavailable`] if either directory
    /// cannot be created. Callers treat this as fatal.
    pub fn ensure(base: &Path) -> Result<Self> {
        std::fs::create_dir_all(base).map_err(|e| unavailable(base, &e))?;

        let stamp = Local::now().format("%Y_%m_%d_%H_%M_%S");
        let pid = std::process::id();
        let mut last_error = None;

        for attempt in 0..MAX_CHUNK_NAME_RETRIES {
            let dir = base.join(suffixed(&format!("{stamp}_{pid}"), attempt));

            match std::fs::create_dir(&dir) {
                Ok(()) => {
                    info!("Repository created at {}", dir.display());
                    return Ok(Self {
                        base: base.to_path_buf(),
                        dir,
                        purge_list: Arc::new(PurgeList::new(PURGE_LIST_CAPACITY)),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => last_error = Some(e),
            }
        }

        Err(ChunklineError::RepositoryUnavailable {
            path: base.to_path_buf(),
            reason: last_error.map_or_else(
                || format!("no free instance directory after {MAX_CHUNK_NAME_RETRIES} attempts"),
                |e| e.to_string(),
            ),
        })
    }

    /// Allocate a new, uniquely named chunk file
    ///
    /// Collisions bump a numeric suffix. A vanished instance directory is
    /// recreated. The loop gives up after [`MAX_CHUNK_NAME_RETRIES`] attempts.
    ///
    /// # Errors
    ///
    /// Returns [`ChunklineError::RepositoryUnavailable`] when no chunk could be
    /// created. Callers treat this as fatal.
    pub fn new_chunk(&self) -> Result<ChunkRef> {
        let stamp = Local::now().format("%Y_%m_%d_%H_%M_%S_%3f").to_string();
        let pid = std::process::id();
        let mut last_error: Option<io::Error> = None;

        for attempt in 0..MAX_CHUNK_NAME_RETRIES {
            let name = suffixed(&format!("{stamp}_{pid}"), attempt);
            let path = self.dir.join(format!("{name}.{CHUNK_EXTENSION}"));

            match Chunk::create(&path, Arc::clone(&self.purge_list)) {
                Ok(chunk) => return Ok(chunk),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!("Chunk name {} taken, retrying", path.display());
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(
                        "Repository directory {} disappeared, recreating",
                        self.dir.display()
                    );
                    if let Err(create) = std::fs::create_dir_all(&self.dir) {
                        last_error = Some(create);
                    }
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(ChunklineError::RepositoryUnavailable {
            path: self.dir.clone(),
            reason: last_error.map_or_else(
                || format!("no free chunk name after {MAX_CHUNK_NAME_RETRIES} attempts"),
                |e| e.to_string(),
            ),
        })
    }

    /// Retry deferred deletions
    pub fn purge(&self) -> usize {
        self.purge_list.purge()
    }

    /// Remove the instance directory and everything in it
    ///
    /// # Errors
    ///
    /// Returns error if the directory exists but cannot be removed
    pub fn destroy(&self) -> Result<()> {
        self.purge();
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => {
                info!("Repository {} removed", self.dir.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Instance directory
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Base directory shared with other instances
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Deferred deletion queue
    #[must_use]
    pub fn purge_list(&self) -> &Arc<PurgeList> {
        &self.purge_list
    }
}

/// `stem` for the first attempt, then `stem_0001`, `stem_0002`, ...
///
/// The padding keeps collision names sorting in creation order.
fn suffixed(stem: &str, attempt: u32) -> String {
    if attempt == 0 {
        stem.to_string()
    } else {
        format!("{stem}_{attempt:04}")
    }
}

fn unavailable(path: &Path, error: &io::Error) -> ChunklineError {
    ChunklineError::RepositoryUnavailable {
        path: path.to_path_buf(),
        reason: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ensure_creates_instance_dir() {
        let base = TempDir::new().unwrap();
        let repo = Repository::ensure(&base.path().join("nested/repo")).unwrap();

        assert!(repo.path().is_dir());
        assert_eq!(repo.path().parent().unwrap(), repo.base());
        let name = repo.path().file_name().unwrap().to_str().unwrap();
        assert!(name.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_two_instances_share_base() {
        let base = TempDir::new().unwrap();
        let a = Repository::ensure(base.path()).unwrap();
        let b = Repository::ensure(base.path()).unwrap();

        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn test_ensure_fails_on_file() {
        let base = TempDir::new().unwrap();
        let file = base.path().join("plain-file");
        std::fs::write(&file, b"x").unwrap();

        let result = Repository::ensure(&file);
        assert!(matches!(result, Err(ChunklineError::RepositoryUnavailable { .. })));
    }

    #[test]
    fn test_new_chunk_names_are_unique_and_ordered() {
        let base = TempDir::new().unwrap();
        let repo = Repository::ensure(base.path()).unwrap();

        let chunks: Vec<ChunkRef> = (0..5).map(|_| repo.new_chunk().unwrap()).collect();
        let names: Vec<PathBuf> = chunks.iter().map(|c| c.path().to_path_buf()).collect();

        let mut sorted = names.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 5);
        assert_eq!(sorted, names);
        assert!(names
            .iter()
            .all(|p| p.extension().and_then(|e| e.to_str()) == Some(CHUNK_EXTENSION)));
    }

    #[test]
    fn test_collision_suffixes_sort_in_attempt_order() {
        let names: Vec<String> = (0..MAX_CHUNK_NAME_RETRIES)
            .map(|attempt| format!("{}.{CHUNK_EXTENSION}", suffixed("stamp_42", attempt)))
            .collect();

        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(sorted, names);
        assert_eq!(names[2], "stamp_42_0002.chunk");
    }

    #[test]
    fn test_new_chunk_recreates_missing_dir() {
        let base = TempDir::new().unwrap();
        let repo = Repository::ensure(base.path()).unwrap();

        std::fs::remove_dir_all(repo.path()).unwrap();
        let chunk = repo.new_chunk().unwrap();

        assert!(chunk.path().exists());
    }

    #[test]
    fn test_destroy_removes_dir() {
        let base = TempDir::new().unwrap();
        let repo = Repository::ensure(base.path()).unwrap();
        let chunk = repo.new_chunk().unwrap();
        drop(chunk);

        repo.destroy().unwrap();
        assert!(!repo.path().exists());
        assert!(repo.destroy().is_ok());
    }
}
