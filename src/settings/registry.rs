//! Catalog of registered events and their setting controls

use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::control::{BooleanControl, DurationControl, DurationRule, SettingControl};
use super::{SettingKey, COMBINE_CACHE_SIZE, CUTOFF, ENABLED, STACK_TRACE, THRESHOLD};
use crate::error::isolate;

/// A registered control plus its memoized combine results and last applied value
pub struct ControlEntry {
    key: SettingKey,
    control: Arc<dyn SettingControl>,
    cache: Mutex<LruCache<BTreeSet<String>, String>>,
    applied: Mutex<Option<String>>,
    rejected: Mutex<Option<String>>,
}

impl ControlEntry {
    fn new(key: SettingKey, control: Arc<dyn SettingControl>) -> Self {
        let capacity = NonZeroUsize::new(COMBINE_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            key,
            control,
            cache: Mutex::new(LruCache::new(capacity)),
            applied: Mutex::new(None),
            rejected: Mutex::new(None),
        }
    }

    /// Key of this control
    #[must_use]
    pub fn key(&self) -> &SettingKey {
        &self.key
    }

    /// Combine requested values, falling back to the default on failure
    pub fn combine(&self, values: &BTreeSet<String>) -> String {
        if let Some(hit) = self.cache.lock().get(values) {
            return hit.clone();
        }

        match isolate(|| self.control.combine(values)) {
            Ok(value) => {
                self.cache.lock().put(values.clone(), value.clone());
                value
            }
            Err(message) => {
                warn!("Setting {} combine failed: {}", self.key, message);
                self.default_value()
            }
        }
    }

    /// Apply `value` unless it is already the applied value
    ///
    /// A rejected value is replaced by the control's default and is not retried
    /// until another value was accepted. Returns whether the control was called;
    /// [`ControlEntry::in_effect_for`] reports what is in effect afterwards.
    pub fn apply(&self, value: &str) -> bool {
        let mut applied = self.applied.lock();
        let mut rejected = self.rejected.lock();
        if applied.as_deref() == Some(value) || rejected.as_deref() == Some(value) {
            return false;
        }

        match isolate(|| self.control.set(value)) {
            Ok(()) => {
                debug!("Setting {} = {}", self.key, value);
                *applied = Some(value.to_string());
                *rejected = None;
            }
            Err(message) => {
                warn!("Setting {} rejected '{}': {}", self.key, value, message);
                *rejected = Some(value.to_string());
                let fallback = self.default_value();
                *applied = match isolate(|| self.control.set(&fallback)) {
                    Ok(()) => Some(fallback),
                    Err(message) => {
                        warn!("Setting {} default rejected: {}", self.key, message);
                        None
                    }
                };
            }
        }
        true
    }

    /// Value actually in effect when `value` is requested
    ///
    /// A value the control rejected maps to the fallback applied in its place.
    #[must_use]
    pub fn in_effect_for(&self, value: String) -> String {
        if self.rejected.lock().as_deref() != Some(value.as_str()) {
            return value;
        }
        self.applied
            .lock()
            .clone()
            .unwrap_or_else(|| self.default_value())
    }

    /// Live value reported by the control
    #[must_use]
    pub fn current(&self) -> Option<String> {
        match isolate(|| self.control.get()) {
            Ok(value) => Some(value),
            Err(message) => {
                warn!("Setting {} get failed: {}", self.key, message);
                None
            }
        }
    }

    /// Default value of the control, isolated like every other call
    #[must_use]
    pub fn default_value(&self) -> String {
        isolate(|| Ok::<_, String>(self.control.default_value())).unwrap_or_else(|message| {
            warn!("Setting {} default failed: {}", self.key, message);
            String::new()
        })
    }

    /// Number of memoized combine results
    #[must_use]
    pub fn cached_combinations(&self) -> usize {
        self.cache.lock().len()
    }
}

/// Handle given to event producers to check the effective configuration
#[derive(Clone)]
pub struct EventHandle {
    selector: String,
    enabled: Arc<BooleanControl>,
    threshold: Arc<DurationControl>,
    stack_trace: Arc<BooleanControl>,
}

impl EventHandle {
    /// Event selector
    #[must_use]
    pub fn selector(&self) -> &str {
        &self.selector
    }

    /// Whether any running recording enables this event
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.value()
    }

    /// Effective minimum duration for the event to be recorded
    #[must_use]
    pub fn threshold(&self) -> Duration {
        self.threshold.duration()
    }

    /// Whether stack traces are requested
    #[must_use]
    pub fn stack_trace(&self) -> bool {
        self.stack_trace.value()
    }

    /// Whether an event that took `elapsed` should be written
    #[must_use]
    pub fn should_commit(&self, elapsed: Duration) -> bool {
        self.is_enabled() && elapsed >= self.threshold()
    }

    pub(crate) fn enabled_flag(&self) -> Arc<std::sync::atomic::AtomicBool> {
        self.enabled.flag()
    }
}

/// Registered events and controls
///
/// Kept separate from the recorder state; access never requires the recorder lock.
#[derive(Default)]
pub struct SettingsRegistry {
    controls: DashMap<SettingKey, Arc<ControlEntry>>,
    events: DashMap<String, EventHandle>,
}

impl SettingsRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an event with its standard `enabled`, `threshold`, `stackTrace`
    /// and `cutoff` controls
    ///
    /// Registering the same selector again returns the existing handle.
    pub fn register_event(&self, selector: &str) -> EventHandle {
        if let Some(existing) = self.events.get(selector) {
            return existing.clone();
        }

        let handle = EventHandle {
            selector: selector.to_string(),
            enabled: Arc::new(BooleanControl::new(false)),
            threshold: Arc::new(DurationControl::new(DurationRule::Min, "0 ns")),
            stack_trace: Arc::new(BooleanControl::new(false)),
        };

        self.register_control(
            SettingKey::new(selector, ENABLED),
            Arc::clone(&handle.enabled) as Arc<dyn SettingControl>,
        );
        self.register_control(
            SettingKey::new(selector, THRESHOLD),
            Arc::clone(&handle.threshold) as Arc<dyn SettingControl>,
        );
        self.register_control(
            SettingKey::new(selector, STACK_TRACE),
            Arc::clone(&handle.stack_trace) as Arc<dyn SettingControl>,
        );
        self.register_control(
            SettingKey::new(selector, CUTOFF),
            Arc::new(DurationControl::new(DurationRule::Max, "infinity")),
        );

        self.events.insert(selector.to_string(), handle.clone());
        debug!("Registered event {}", selector);
        handle
    }

    /// Register or replace a control
    ///
    /// The event must be registered for the control to take part in
    /// reconciliation.
    pub fn register_control(&self, key: SettingKey, control: Arc<dyn SettingControl>) {
        let entry = Arc::new(ControlEntry::new(key.clone(), control));
        self.controls.insert(key, entry);
    }

    /// Look up a control
    #[must_use]
    pub fn control(&self, key: &SettingKey) -> Option<Arc<ControlEntry>> {
        self.controls.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Handle of a registered event
    #[must_use]
    pub fn event(&self, selector: &str) -> Option<EventHandle> {
        self.events.get(selector).map(|handle| handle.clone())
    }

    /// Registered event selectors in sorted order
    #[must_use]
    pub fn events(&self) -> BTreeSet<String> {
        self.events.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Controls of one event, sorted by setting name
    #[must_use]
    pub fn controls_for(&self, selector: &str) -> Vec<Arc<ControlEntry>> {
        let mut controls: Vec<Arc<ControlEntry>> = self
            .controls
            .iter()
            .filter(|entry| entry.key().event == selector)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        controls.sort_by(|a, b| a.key().setting.cmp(&b.key().setting));
        controls
    }

    /// Whether `key` has a registered control
    #[must_use]
    pub fn contains(&self, key: &SettingKey) -> bool {
        self.controls.contains_key(key)
    }
}
