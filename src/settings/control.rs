//! Setting controls: the live knobs behind each (event, setting) pair

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;

use super::value::{
    parse_bool, parse_duration, parse_period, PeriodValue, BEGIN_CHUNK, END_CHUNK, EVERY_CHUNK,
};
use crate::request::{HookSchedule, RequestEngine};

/// Failure reported by a setting control
#[derive(Debug, Error)]
pub enum SettingError {
    /// Value could not be interpreted
    #[error("invalid value '{value}': {reason}")]
    InvalidValue {
        /// Offending value
        value: String,
        /// Why it was rejected
        reason: String,
    },

    /// Control-specific failure
    #[error("{0}")]
    Failed(String),
}

/// Capability interface of a single setting
///
/// Implementations may fail or even panic; the settings manager isolates every
/// call and falls back to the default value.
pub trait SettingControl: Send + Sync {
    /// Current live value
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be read
    fn get(&self) -> Result<String, SettingError>;

    /// Apply a resolved value
    ///
    /// # Errors
    ///
    /// Returns error if the value is rejected
    fn set(&self, value: &str) -> Result<(), SettingError>;

    /// Merge the distinct values requested by all running recordings
    ///
    /// # Errors
    ///
    /// Returns error if no value can be derived
    fn combine(&self, values: &BTreeSet<String>) -> Result<String, SettingError>;

    /// Value used when nothing is requested or combining fails
    fn default_value(&self) -> String;
}

/// Boolean setting combined with logical OR (`enabled`, `stackTrace`)
pub struct BooleanControl {
    value: Arc<AtomicBool>,
    default: bool,
}

impl BooleanControl {
    /// Create a control starting at `default`
    #[must_use]
    pub fn new(default: bool) -> Self {
        Self {
            value: Arc::new(AtomicBool::new(default)),
            default,
        }
    }

    /// Current value
    #[must_use]
    pub fn value(&self) -> bool {
        self.value.load(Ordering::Acquire)
    }

    /// Shared flag mirroring the value
    #[must_use]
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.value)
    }
}

impl SettingControl for BooleanControl {
    fn get(&self) -> Result<String, SettingError> {
        Ok(self.value().to_string())
    }

    fn set(&self, value: &str) -> Result<(), SettingError> {
        self.value.store(parse_bool(value)?, Ordering::Release);
        Ok(())
    }

    fn combine(&self, values: &BTreeSet<String>) -> Result<String, SettingError> {
        let any = values.iter().any(|v| matches!(parse_bool(v), Ok(true)));
        Ok(any.to_string())
    }

    fn default_value(&self) -> String {
        self.default.to_string()
    }
}

/// How a [`DurationControl`] merges requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationRule {
    /// Smallest duration wins (`threshold`)
    Min,
    /// Largest duration wins (`cutoff`)
    Max,
}

/// Duration setting such as `threshold` or `cutoff`
pub struct DurationControl {
    nanos: AtomicU64,
    text: Mutex<String>,
    rule: DurationRule,
    default: String,
}

impl DurationControl {
    /// Create a control starting at `default`
    ///
    /// # Panics
    ///
    /// Panics if `default` is not a valid duration (programming error)
    #[must_use]
    pub fn new(rule: DurationRule, default: &str) -> Self {
        let nanos = parse_duration(default).expect("default duration must parse");
        Self {
            nanos: AtomicU64::new(nanos),
            text: Mutex::new(default.to_string()),
            rule,
            default: default.to_string(),
        }
    }

    /// Current value in nanoseconds, `u64::MAX` for infinity
    #[must_use]
    pub fn nanos(&self) -> u64 {
        self.nanos.load(Ordering::Acquire)
    }

    /// Current value as a [`Duration`]
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_nanos(self.nanos())
    }
}

impl SettingControl for DurationControl {
    fn get(&self) -> Result<String, SettingError> {
        Ok(self.text.lock().clone())
    }

    fn set(&self, value: &str) -> Result<(), SettingError> {
        let nanos = parse_duration(value)?;
        *self.text.lock() = value.to_string();
        self.nanos.store(nanos, Ordering::Release);
        Ok(())
    }

    fn combine(&self, values: &BTreeSet<String>) -> Result<String, SettingError> {
        let parsed = values
            .iter()
            .filter_map(|text| parse_duration(text).ok().map(|nanos| (nanos, text)));

        let winner = match self.rule {
            DurationRule::Min => parsed.min_by_key(|(nanos, _)| *nanos),
            DurationRule::Max => parsed.max_by_key(|(nanos, _)| *nanos),
        };

        winner
            .map(|(_, text)| text.clone())
            .ok_or_else(|| SettingError::InvalidValue {
                value: values.iter().cloned().collect::<Vec<_>>().join(", "),
                reason: "no valid duration".to_string(),
            })
    }

    fn default_value(&self) -> String {
        self.default.clone()
    }
}

/// `period` setting of a periodic event; applying it reschedules the event's hook
pub struct PeriodControl {
    selector: String,
    engine: Arc<RequestEngine>,
    text: Mutex<String>,
}

impl PeriodControl {
    /// Default period of periodic events
    pub const DEFAULT: &'static str = EVERY_CHUNK;

    /// Create a control driving the hook registered for `selector`
    #[must_use]
    pub fn new(selector: &str, engine: Arc<RequestEngine>) -> Self {
        Self {
            selector: selector.to_string(),
            engine,
            text: Mutex::new(Self::DEFAULT.to_string()),
        }
    }
}

impl SettingControl for PeriodControl {
    fn get(&self) -> Result<String, SettingError> {
        Ok(self.text.lock().clone())
    }

    fn set(&self, value: &str) -> Result<(), SettingError> {
        let schedule = match parse_period(value)? {
            PeriodValue::EveryChunk => HookSchedule::EveryChunk,
            PeriodValue::BeginChunk => HookSchedule::BeginChunk,
            PeriodValue::EndChunk => HookSchedule::EndChunk,
            PeriodValue::Every(nanos) => HookSchedule::Periodic(Duration::from_nanos(nanos)),
        };

        if !self.engine.set_schedule(&self.selector, schedule) {
            return Err(SettingError::Failed(format!(
                "no hook registered for {}",
                self.selector
            )));
        }

        *self.text.lock() = value.to_string();
        Ok(())
    }

    fn combine(&self, values: &BTreeSet<String>) -> Result<String, SettingError> {
        let mut begin_chunk = false;
        let mut end_chunk = false;
        let mut shortest: Option<(u64, &String)> = None;

        for text in values {
            match parse_period(text) {
                Ok(PeriodValue::EveryChunk) => {
                    begin_chunk = true;
                    end_chunk = true;
                }
                Ok(PeriodValue::BeginChunk) => begin_chunk = true,
                Ok(PeriodValue::EndChunk) => end_chunk = true,
                Ok(PeriodValue::Every(nanos)) => {
                    if shortest.map_or(true, |(current, _)| nanos < current) {
                        shortest = Some((nanos, text));
                    }
                }
                Err(_) => {}
            }
        }

        match (begin_chunk, end_chunk, shortest) {
            (true, true, _) => Ok(EVERY_CHUNK.to_string()),
            (true, false, _) => Ok(BEGIN_CHUNK.to_string()),
            (false, true, _) => Ok(END_CHUNK.to_string()),
            (false, false, Some((_, text))) => Ok(text.clone()),
            (false, false, None) => Err(SettingError::InvalidValue {
                value: values.iter().cloned().collect::<Vec<_>>().join(", "),
                reason: "no valid period".to_string(),
            }),
        }
    }

    fn default_value(&self) -> String {
        Self::DEFAULT.to_string()
    }
}
