//! Recordings: state machine, chunk retention and stream access

mod session;
mod stream;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub use session::{RecordingInfo, RecordingSession};
pub use stream::ChunkStream;

use crate::settings::SettingsMap;

/// Default recording name
pub const DEFAULT_NAME: &str = "recording";

/// Extension of files written by dump and snapshot
pub const DUMP_EXTENSION: &str = "dump";

/// Lifecycle of a recording
///
/// States only move forward: `New -> Delayed -> Running -> Stopped -> Closed`.
/// `Delayed` is reached only through a scheduled start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordingState {
    /// Created, not started
    New,
    /// Start scheduled
    Delayed,
    /// Receiving chunks
    Running,
    /// No longer receiving chunks; data still readable
    Stopped,
    /// Chunks released
    Closed,
}

impl RecordingState {
    /// Whether moving from `self` to `to` is permitted
    #[must_use]
    pub fn can_transition(self, to: RecordingState) -> bool {
        use RecordingState::{Closed, Delayed, New, Running, Stopped};

        matches!(
            (self, to),
            (New, Delayed | Running)
                | (Delayed, Running)
                | (Running, Stopped)
                | (New | Delayed | Running | Stopped, Closed)
        )
    }

    /// Whether the recording can still be started
    #[must_use]
    pub fn is_startable(self) -> bool {
        matches!(self, Self::New | Self::Delayed)
    }
}

impl fmt::Display for RecordingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "NEW",
            Self::Delayed => "DELAYED",
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Attributes of a recording at creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingOptions {
    /// Display name
    pub name: String,
    /// Persist chunks to disk; when no running recording does, the stream stays in memory
    pub to_disk: bool,
    /// Drop chunks that ended longer ago than this
    pub max_age: Option<Duration>,
    /// Drop oldest chunks while the total exceeds this many bytes
    pub max_size: Option<u64>,
    /// Where chunks are copied on stop
    pub destination: Option<PathBuf>,
    /// Write to the destination at shutdown if still running
    pub dump_on_exit: bool,
    /// Stop automatically this long after starting
    pub duration: Option<Duration>,
    /// Stream flush interval requested while running
    pub flush_interval: Option<Duration>,
    /// Requested settings, keyed `event#setting`
    pub settings: SettingsMap,
}

impl Default for RecordingOptions {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            to_disk: true,
            max_age: None,
            max_size: None,
            destination: None,
            dump_on_exit: false,
            duration: None,
            flush_interval: None,
            settings: SettingsMap::new(),
        }
    }
}

impl RecordingOptions {
    /// Options with the given name and defaults otherwise
    #[must_use]
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}
