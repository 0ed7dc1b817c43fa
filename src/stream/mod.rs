//! Stream writer interface and the bundled file-backed implementation

mod file_writer;

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

pub use file_writer::{FileStreamWriter, StreamLimits};

use crate::Result;

/// The event encoder that appends records to whatever output is current
///
/// The recorder only starts, stops, flushes and redirects it; it never sees
/// individual records.
pub trait StreamWriter: Send + Sync {
    /// Start accepting events
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot start
    fn begin(&self) -> Result<()>;

    /// Stop accepting events
    ///
    /// # Errors
    ///
    /// Returns error if pending data cannot be written
    fn end(&self) -> Result<()>;

    /// Push buffered data to the current output
    ///
    /// # Errors
    ///
    /// Returns error if the flush fails
    fn flush(&self) -> Result<()>;

    /// Whether the current output exceeded its size or age threshold
    fn should_rotate(&self) -> bool;

    /// Close the current output and continue in `path`, or in memory for `None`
    ///
    /// Data buffered in memory is written to `path` when switching from memory
    /// to a file. Returns the timestamp at which the new output starts.
    ///
    /// # Errors
    ///
    /// Returns error if the old output cannot be closed or the new one opened
    fn set_output_path(&self, path: Option<&Path>) -> Result<u64>;

    /// Current time on the stream clock (Unix epoch nanoseconds)
    fn now(&self) -> u64 {
        now_nanos()
    }
}

/// Wall clock in Unix epoch nanoseconds
#[must_use]
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}
