//! Periodic and chunk-boundary hook scheduling

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::isolate;

/// Result returned by a hook
pub type HookResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Callback emitting a periodic event
pub type Hook = Arc<dyn Fn() -> HookResult + Send + Sync>;

/// Lower bound on the wait returned by [`RequestEngine::tick`]
pub const DEFAULT_MIN_WAIT: Duration = Duration::from_millis(10);

/// When a hook fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookSchedule {
    /// Every time the period elapses
    Periodic(Duration),
    /// At the start and end of every chunk
    EveryChunk,
    /// At the start of every chunk
    BeginChunk,
    /// At the end of every chunk
    EndChunk,
}

struct HookEntry {
    selector: String,
    hook: Hook,
    enabled: Arc<AtomicBool>,
    accumulated_ms: u64,
    period_ms: u64,
    begin_chunk: bool,
    end_chunk: bool,
}

impl HookEntry {
    fn reschedule(&mut self, schedule: HookSchedule) {
        let (period_ms, begin_chunk, end_chunk) = match schedule {
            HookSchedule::Periodic(period) => ((period.as_millis() as u64).max(1), false, false),
            HookSchedule::EveryChunk => (0, true, true),
            HookSchedule::BeginChunk => (0, true, false),
            HookSchedule::EndChunk => (0, false, true),
        };
        self.period_ms = period_ms;
        self.begin_chunk = begin_chunk;
        self.end_chunk = end_chunk;
        self.accumulated_ms = 0;
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

/// Scheduler for periodic events and chunk-boundary hooks
///
/// Also holds the stream flush interval; shortening it wakes the background
/// loop through [`RequestEngine::wakeup`].
pub struct RequestEngine {
    entries: Mutex<Vec<HookEntry>>,
    flush_interval: Mutex<Option<Duration>>,
    wakeup: Notify,
    min_wait: Duration,
}

impl RequestEngine {
    /// Create an engine whose tick never asks for a shorter wait than `min_wait`
    #[must_use]
    pub fn new(min_wait: Duration) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            flush_interval: Mutex::new(None),
            wakeup: Notify::new(),
            min_wait,
        }
    }

    /// Register a hook for `selector`, replacing any previous one
    ///
    /// The hook only fires while `enabled` is set.
    pub fn add_hook(
        &self,
        selector: &str,
        enabled: Arc<AtomicBool>,
        schedule: HookSchedule,
        hook: Hook,
    ) {
        let mut entry = HookEntry {
            selector: selector.to_string(),
            hook,
            enabled,
            accumulated_ms: 0,
            period_ms: 0,
            begin_chunk: false,
            end_chunk: false,
        };
        entry.reschedule(schedule);

        let mut entries = self.entries.lock();
        entries.retain(|existing| existing.selector != selector);
        entries.push(entry);
        drop(entries);

        debug!("Registered hook for {} ({:?})", selector, schedule);
        // A new periodic entry may be due sooner than the loop's current wait
        self.wakeup.notify_one();
    }

    /// Remove the hook for `selector`
    pub fn remove_hook(&self, selector: &str) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|entry| entry.selector != selector);
        before != entries.len()
    }

    /// Change when the hook for `selector` fires
    pub fn set_schedule(&self, selector: &str, schedule: HookSchedule) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.iter_mut().find(|entry| entry.selector == selector) else {
            return false;
        };
        entry.reschedule(schedule);
        drop(entries);

        debug!("Rescheduled hook for {} ({:?})", selector, schedule);
        self.wakeup.notify_one();
        true
    }

    /// Advance periodic entries by `elapsed`, firing the ones that are due
    ///
    /// A due entry fires once and restarts from zero, so a long pause does not
    /// cause a burst. Returns how long the caller may sleep before the next entry
    /// is due, or `None` when nothing is periodic.
    pub fn tick(&self, elapsed: Duration) -> Option<Duration> {
        let elapsed_ms = elapsed.as_millis() as u64;
        let mut due = Vec::new();
        let mut next_ms: Option<u64> = None;

        {
            let mut entries = self.entries.lock();
            for entry in entries.iter_mut() {
                if entry.period_ms == 0 || !entry.is_enabled() {
                    continue;
                }

                entry.accumulated_ms = entry.accumulated_ms.saturating_add(elapsed_ms);
                if entry.accumulated_ms >= entry.period_ms {
                    due.push((entry.selector.clone(), Arc::clone(&entry.hook)));
                    entry.accumulated_ms = 0;
                }

                let remaining = entry.period_ms - entry.accumulated_ms;
                next_ms = Some(next_ms.map_or(remaining, |current| current.min(remaining)));
            }
        }

        for (selector, hook) in due {
            fire(&selector, &hook);
        }

        next_ms.map(|ms| Duration::from_millis(ms).max(self.min_wait))
    }

    /// Fire every enabled hook flagged for chunk begin
    pub fn do_chunk_begin(&self) -> usize {
        self.fire_boundary(|entry| entry.begin_chunk)
    }

    /// Fire every enabled hook flagged for chunk end
    pub fn do_chunk_end(&self) -> usize {
        self.fire_boundary(|entry| entry.end_chunk)
    }

    fn fire_boundary(&self, flagged: impl Fn(&HookEntry) -> bool) -> usize {
        let hooks: Vec<(String, Hook)> = self
            .entries
            .lock()
            .iter()
            .filter(|entry| flagged(entry) && entry.is_enabled())
            .map(|entry| (entry.selector.clone(), Arc::clone(&entry.hook)))
            .collect();

        for (selector, hook) in &hooks {
            fire(selector, hook);
        }

        hooks.len()
    }

    /// Set the stream flush interval, waking the loop if it got shorter
    pub fn set_flush_interval(&self, interval: Option<Duration>) {
        let mut current = self.flush_interval.lock();
        let shortened = match (*current, interval) {
            (None, Some(_)) => true,
            (Some(old), Some(new)) => new < old,
            _ => false,
        };
        *current = interval;
        drop(current);

        if shortened {
            debug!("Flush interval shortened to {:?}", interval);
            self.wakeup.notify_one();
        }
    }

    /// Current stream flush interval
    #[must_use]
    pub fn flush_interval(&self) -> Option<Duration> {
        *self.flush_interval.lock()
    }

    /// Notified whenever the background loop should recompute its wait
    #[must_use]
    pub fn wakeup(&self) -> &Notify {
        &self.wakeup
    }

    /// Number of registered hooks
    #[must_use]
    pub fn hook_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Current schedule of the hook for `selector`
    #[must_use]
    pub fn schedule(&self, selector: &str) -> Option<HookSchedule> {
        self.entries
            .lock()
            .iter()
            .find(|entry| entry.selector == selector)
            .map(|entry| match (entry.period_ms, entry.begin_chunk, entry.end_chunk) {
                (0, true, true) => HookSchedule::EveryChunk,
                (0, true, false) => HookSchedule::BeginChunk,
                (0, _, _) => HookSchedule::EndChunk,
                (ms, _, _) => HookSchedule::Periodic(Duration::from_millis(ms)),
            })
    }
}

impl Default for RequestEngine {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_WAIT)
    }
}

fn fire(selector: &str, hook: &Hook) {
    if let Err(message) = isolate(|| hook()) {
        warn!("Hook for {} failed: {}", selector, message);
    }
}
