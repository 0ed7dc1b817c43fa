//! Configuration types for Chunkline

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::recording::RecordingOptions;
use crate::request::DEFAULT_MIN_WAIT;
use crate::settings::{parse_duration, SettingKey};
use crate::stream::StreamLimits;
use crate::{ChunklineError, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base directory for chunk files
    #[serde(default = "default_repository")]
    pub repository: PathBuf,
    /// Abort the process when the repository becomes unusable
    #[serde(default = "default_true")]
    pub abort_on_fatal: bool,
    /// Stream writer limits
    #[serde(default)]
    pub stream: StreamConfig,
    /// Background scheduler tuning
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Recordings started by the binary
    #[serde(default)]
    pub recordings: Vec<RecordingConfig>,
}

fn default_repository() -> PathBuf {
    std::env::temp_dir().join("chunkline")
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repository: default_repository(),
            abort_on_fatal: true,
            stream: StreamConfig::default(),
            scheduler: SchedulerConfig::default(),
            recordings: Vec::new(),
        }
    }
}

/// Stream writer limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Rotate once the current chunk reaches this many bytes
    pub max_chunk_size: u64,
    /// Rotate once the current chunk is this old
    pub max_chunk_age_secs: Option<u64>,
    /// Memory buffer budget while no recording persists to disk
    pub max_memory: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        let limits = StreamLimits::default();
        Self {
            max_chunk_size: limits.max_chunk_size,
            max_chunk_age_secs: None,
            max_memory: limits.max_memory,
        }
    }
}

impl StreamConfig {
    /// Limits for [`crate::stream::FileStreamWriter`]
    #[must_use]
    pub fn limits(&self) -> StreamLimits {
        StreamLimits {
            max_chunk_size: self.max_chunk_size,
            max_chunk_age: self.max_chunk_age_secs.map(Duration::from_secs),
            max_memory: self.max_memory,
        }
    }
}

/// Background scheduler tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Shortest wait between periodic steps
    pub min_wait_ms: u64,
    /// Longest wait between disk monitor checks
    pub disk_monitor_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_wait_ms: DEFAULT_MIN_WAIT.as_millis() as u64,
            disk_monitor_interval_ms: 1000,
        }
    }
}

impl SchedulerConfig {
    /// Shortest wait between periodic steps
    #[must_use]
    pub fn min_wait(&self) -> Duration {
        Duration::from_millis(self.min_wait_ms)
    }

    /// Longest wait between disk monitor checks
    #[must_use]
    pub fn disk_monitor_interval(&self) -> Duration {
        Duration::from_millis(self.disk_monitor_interval_ms)
    }
}

/// One recording to create at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Display name
    pub name: String,
    /// Persist chunks to disk
    #[serde(default = "default_true")]
    pub to_disk: bool,
    /// Drop chunks older than this
    #[serde(default)]
    pub max_age_secs: Option<u64>,
    /// Keep at most this many bytes
    #[serde(default)]
    pub max_size: Option<u64>,
    /// Copy target on stop
    #[serde(default)]
    pub destination: Option<PathBuf>,
    /// Write to the destination at shutdown
    #[serde(default)]
    pub dump_on_exit: bool,
    /// Start after this delay instead of immediately
    #[serde(default)]
    pub delay_secs: Option<u64>,
    /// Stop automatically after running this long
    #[serde(default)]
    pub duration_secs: Option<u64>,
    /// Stream flush interval while running
    #[serde(default)]
    pub flush_interval_ms: Option<u64>,
    /// Requested settings, keyed `event#setting`
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

impl RecordingConfig {
    /// Options for [`crate::Recorder::create_recording`]
    #[must_use]
    pub fn options(&self) -> RecordingOptions {
        RecordingOptions {
            name: self.name.clone(),
            to_disk: self.to_disk,
            max_age: self.max_age_secs.map(Duration::from_secs),
            max_size: self.max_size,
            destination: self.destination.clone(),
            dump_on_exit: self.dump_on_exit,
            duration: self.duration_secs.map(Duration::from_secs),
            flush_interval: self.flush_interval_ms.map(Duration::from_millis),
            settings: self.settings.clone(),
        }
    }

    /// Start delay
    #[must_use]
    pub fn delay(&self) -> Option<Duration> {
        self.delay_secs.map(Duration::from_secs)
    }
}

impl Config {
    /// Load configuration from TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ChunklineError::ConfigError(format!("Failed to read config file: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| ChunklineError::ConfigError(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<()> {
        if self.repository.as_os_str().is_empty() {
            return Err(ChunklineError::ConfigError(
                "repository cannot be empty".to_string(),
            ));
        }

        if self.stream.max_chunk_size == 0 {
            return Err(ChunklineError::ConfigError(
                "stream.max_chunk_size must be > 0".to_string(),
            ));
        }

        if self.stream.max_chunk_age_secs == Some(0) {
            return Err(ChunklineError::ConfigError(
                "stream.max_chunk_age_secs must be > 0".to_string(),
            ));
        }

        if self.scheduler.min_wait_ms == 0 || self.scheduler.disk_monitor_interval_ms == 0 {
            return Err(ChunklineError::ConfigError(
                "scheduler intervals must be > 0".to_string(),
            ));
        }

        for (i, recording) in self.recordings.iter().enumerate() {
            if recording.name.trim().is_empty() {
                return Err(ChunklineError::ConfigError(format!(
                    "Recording {i}: name cannot be empty"
                )));
            }

            if recording.max_size == Some(0) {
                return Err(ChunklineError::ConfigError(format!(
                    "Recording {}: max_size must be > 0",
                    recording.name
                )));
            }

            if recording.flush_interval_ms == Some(0) {
                return Err(ChunklineError::ConfigError(format!(
                    "Recording {}: flush_interval_ms must be > 0",
                    recording.name
                )));
            }

            for (key, value) in &recording.settings {
                let parsed = SettingKey::parse(key).map_err(|e| {
                    ChunklineError::ConfigError(format!("Recording {}: {e}", recording.name))
                })?;

                if parsed.setting == crate::settings::THRESHOLD
                    || parsed.setting == crate::settings::CUTOFF
                {
                    parse_duration(value).map_err(|e| {
                        ChunklineError::ConfigError(format!(
                            "Recording {}: {key}: {e}",
                            recording.name
                        ))
                    })?;
                }
            }
        }

        Ok(())
    }
}
