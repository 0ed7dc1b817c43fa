//! Reconciliation of requested settings into one effective configuration

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::registry::SettingsRegistry;
use super::value::parse_bool;
use super::{EffectiveSettings, SettingKey, SettingsMap, ENABLED};

type Requests = BTreeMap<String, BTreeMap<String, BTreeSet<String>>>;

/// Computes and applies the union of settings requested by running recordings
pub struct SettingsManager {
    registry: Arc<SettingsRegistry>,
    effective: Mutex<EffectiveSettings>,
}

impl SettingsManager {
    /// Create a manager over `registry`
    #[must_use]
    pub fn new(registry: Arc<SettingsRegistry>) -> Self {
        Self {
            registry,
            effective: Mutex::new(EffectiveSettings::new()),
        }
    }

    /// Registry this manager reconciles
    #[must_use]
    pub fn registry(&self) -> &Arc<SettingsRegistry> {
        &self.registry
    }

    /// Compute the effective settings for `requests` without applying them
    #[must_use]
    pub fn resolve(&self, requests: &[&SettingsMap]) -> EffectiveSettings {
        let grouped = self.group(requests);
        let mut effective = EffectiveSettings::new();

        for event in self.registry.events() {
            let Some(settings) = grouped.get(&event) else {
                effective.insert(SettingKey::new(&event, ENABLED), false.to_string());
                continue;
            };

            let enabled = settings
                .get(ENABLED)
                .is_some_and(|values| values.iter().any(|v| matches!(parse_bool(v), Ok(true))));
            effective.insert(SettingKey::new(&event, ENABLED), enabled.to_string());
            if !enabled {
                continue;
            }

            for entry in self.registry.controls_for(&event) {
                let setting = &entry.key().setting;
                if setting == ENABLED {
                    continue;
                }

                let value = match settings.get(setting) {
                    Some(values) => entry.combine(values),
                    None => entry.default_value(),
                };
                effective.insert(entry.key().clone(), entry.in_effect_for(value));
            }
        }

        effective
    }

    /// Resolve `requests` and push the result into the live controls
    ///
    /// Disabled events only get `enabled=false`; their other controls keep
    /// whatever they last held. Returns the new effective settings.
    pub fn apply(&self, requests: &[&SettingsMap]) -> EffectiveSettings {
        let mut current = self.effective.lock();
        let mut resolved = self.resolve(requests);

        let mut changed = 0usize;
        for (key, value) in &mut resolved {
            let Some(entry) = self.registry.control(key) else {
                continue;
            };
            if entry.apply(value) {
                changed += 1;
            }
            *value = entry.in_effect_for(std::mem::take(value));
        }

        debug!(
            "Applied settings: {} values, {} changed",
            resolved.len(),
            changed
        );
        *current = resolved.clone();
        resolved
    }

    /// Disable every registered event
    pub fn disable_all(&self) {
        self.apply(&[]);
    }

    /// Effective settings of the last [`SettingsManager::apply`]
    #[must_use]
    pub fn effective(&self) -> EffectiveSettings {
        self.effective.lock().clone()
    }

    fn group(&self, requests: &[&SettingsMap]) -> Requests {
        let mut grouped = Requests::new();

        for map in requests {
            for (raw_key, value) in map.iter() {
                let key = match SettingKey::parse(raw_key) {
                    Ok(key) => key,
                    Err(e) => {
                        debug!("Ignoring setting {}: {}", raw_key, e);
                        continue;
                    }
                };

                if !self.registry.contains(&key) {
                    debug!("Ignoring unknown setting {}", key);
                    continue;
                }

                grouped
                    .entry(key.event)
                    .or_default()
                    .entry(key.setting)
                    .or_default()
                    .insert(value.clone());
            }
        }

        grouped
    }
}
