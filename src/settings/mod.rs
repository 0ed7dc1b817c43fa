//! Event settings: controls, registry and reconciliation

mod control;
mod manager;
mod registry;
mod value;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub use control::{
    BooleanControl, DurationControl, DurationRule, PeriodControl, SettingControl, SettingError,
};
pub use manager::SettingsManager;
pub use registry::{ControlEntry, EventHandle, SettingsRegistry};
pub use value::{
    parse_bool, parse_duration, parse_period, parse_std_duration, PeriodValue, BEGIN_CHUNK,
    END_CHUNK, EVERY_CHUNK, INFINITY,
};

use crate::error::{ChunklineError, Result};

/// Whether the event is recorded
pub const ENABLED: &str = "enabled";

/// Minimum duration for an event to be recorded
pub const THRESHOLD: &str = "threshold";

/// Emission interval of a periodic event
pub const PERIOD: &str = "period";

/// Whether stack traces are captured
pub const STACK_TRACE: &str = "stackTrace";

/// Maximum time an event may take before it is cut off
pub const CUTOFF: &str = "cutoff";

/// Separator between event selector and setting name
pub const KEY_SEPARATOR: char = '#';

/// Number of combine results memoized per control
pub const COMBINE_CACHE_SIZE: usize = 5;

/// Flat settings requested by one recording, keyed `event#setting`
pub type SettingsMap = BTreeMap<String, String>;

/// Resolved value per setting
pub type EffectiveSettings = BTreeMap<SettingKey, String>;

/// An `(event selector, setting name)` pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SettingKey {
    /// Event selector
    pub event: String,
    /// Setting name
    pub setting: String,
}

impl SettingKey {
    /// Build a key from its parts
    #[must_use]
    pub fn new(event: &str, setting: &str) -> Self {
        Self {
            event: event.to_string(),
            setting: setting.to_string(),
        }
    }

    /// Split an `event#setting` key
    ///
    /// The split happens at the last separator so selectors may contain `#`.
    ///
    /// # Errors
    ///
    /// Returns error if the separator is missing or either side is empty
    pub fn parse(key: &str) -> Result<Self> {
        let (event, setting) = key
            .rsplit_once(KEY_SEPARATOR)
            .ok_or_else(|| ChunklineError::InvalidSetting(format!("missing '#' in '{key}'")))?;

        if event.is_empty() || setting.is_empty() {
            return Err(ChunklineError::InvalidSetting(format!(
                "empty event or setting in '{key}'"
            )));
        }

        Ok(Self::new(event, setting))
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.event, KEY_SEPARATOR, self.setting)
    }
}

impl FromStr for SettingKey {
    type Err = ChunklineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
