//! Auto-repeat for held keys.
//!
//! Every held key gets an entry with the time of its next synthetic event.
//! A periodic checker fires due entries as copies flagged `is_repeat`, first
//! after `first_repeat_timeout` and then every `repeat_timeout`. Which keys
//! repeat, and how value changes are treated, is decided by a [`RepeatPolicy`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::device::{Key, KeyType};
use crate::error::InputError;
use crate::util::{lock, read, write, PeriodicWorker};

/// Receives synthesized repeat events.
pub type RepeatSink = Arc<dyn Fn(Key) + Send + Sync>;

/// Derives the entry key a held control is tracked under.
pub type KeyHashFn = Arc<dyn Fn(&Key) -> String + Send + Sync>;

/// What to do with an existing entry when a new reading for it arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Leave the timing untouched.
    Keep,
    /// Drop the entry and start over from the first delay.
    Restart,
    Stop,
}

/// Which keys repeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatPolicy {
    /// Any key with a non-zero value.
    Any,
    Button,
    /// Hats, re-timed whenever the direction changes.
    Hat,
    #[default]
    ButtonHat,
}

impl RepeatPolicy {
    pub fn handles(self, keytype: KeyType) -> bool {
        match self {
            RepeatPolicy::Any => true,
            RepeatPolicy::Button => keytype == KeyType::Button,
            RepeatPolicy::Hat => keytype == KeyType::Hat,
            RepeatPolicy::ButtonHat => matches!(keytype, KeyType::Button | KeyType::Hat),
        }
    }

    pub fn should_repeat(self, key: &Key) -> bool {
        self.handles(key.keytype) && key.is_active()
    }

    /// Decision for a reading of a key that already has an entry holding `stored`.
    pub fn on_value_changed(self, key: &Key, stored: &Key) -> RestartDecision {
        if !self.should_repeat(key) {
            return RestartDecision::Stop;
        }
        if key.value() == stored.value() {
            return RestartDecision::Keep;
        }
        match self {
            RepeatPolicy::Any => RestartDecision::Keep,
            _ => RestartDecision::Restart,
        }
    }
}

#[derive(Debug, Clone)]
struct RepeatEntry {
    next_fire: Instant,
    key: Key,
}

/// Timing configuration for a [`Repeater`].
#[derive(Debug, Clone)]
pub struct RepeaterSettings {
    pub policy: RepeatPolicy,
    pub first_repeat_timeout: Duration,
    pub repeat_timeout: Duration,
    /// Defaults to half of `repeat_timeout` when not set.
    pub check_timeout: Option<Duration>,
    pub name: String,
}

impl Default for RepeaterSettings {
    fn default() -> Self {
        Self {
            policy: RepeatPolicy::ButtonHat,
            first_repeat_timeout: Duration::from_millis(1000),
            repeat_timeout: Duration::from_millis(500),
            check_timeout: None,
            name: "padstream-repeater".to_string(),
        }
    }
}

impl RepeaterSettings {
    pub fn effective_check_timeout(&self) -> Duration {
        self.check_timeout
            .unwrap_or(self.repeat_timeout / 2)
            .max(Duration::from_millis(1))
    }
}

pub struct Repeater {
    settings: RepeaterSettings,
    key_hash: KeyHashFn,
    sink: RwLock<Option<RepeatSink>>,
    entries: Mutex<HashMap<String, RepeatEntry>>,
    worker: Mutex<Option<PeriodicWorker>>,
}

impl Repeater {
    pub fn new(settings: RepeaterSettings) -> Self {
        Self {
            settings,
            key_hash: Arc::new(Key::repeat_hash),
            sink: RwLock::new(None),
            entries: Mutex::new(HashMap::new()),
            worker: Mutex::new(None),
        }
    }

    pub fn with_policy(policy: RepeatPolicy) -> Self {
        Self::new(RepeaterSettings {
            policy,
            ..RepeaterSettings::default()
        })
    }

    pub fn with_key_hash(mut self, key_hash: KeyHashFn) -> Self {
        self.key_hash = key_hash;
        self
    }

    pub fn settings(&self) -> &RepeaterSettings {
        &self.settings
    }

    pub fn policy(&self) -> RepeatPolicy {
        self.settings.policy
    }

    /// Installs the receiver of repeat events.
    ///
    /// The sink runs while the entry table is locked, so it must not call
    /// back into this repeater.
    pub fn set_sink(&self, sink: RepeatSink) {
        *write(&self.sink) = Some(sink);
    }

    pub fn is_running(&self) -> bool {
        lock(&self.worker).is_some()
    }

    /// Starts the periodic check. Restarts the checker if it was already running.
    pub fn start(self: &Arc<Self>) -> Result<(), InputError> {
        self.stop();

        let this: Weak<Self> = Arc::downgrade(self);
        let check_timeout = self.settings.effective_check_timeout();
        let worker = PeriodicWorker::spawn(self.settings.name.clone(), check_timeout, move || {
            if let Some(repeater) = this.upgrade() {
                repeater.fire_due();
            }
        })?;

        info!(
            "Repeater '{}' started (first {:?}, then every {:?}, checking every {:?})",
            self.settings.name,
            self.settings.first_repeat_timeout,
            self.settings.repeat_timeout,
            check_timeout
        );
        *lock(&self.worker) = Some(worker);
        Ok(())
    }

    /// Stops the checker and forgets every held key.
    pub fn stop(&self) {
        let worker = lock(&self.worker).take();
        if let Some(mut worker) = worker {
            if let Err(e) = worker.stop(self.settings.effective_check_timeout()) {
                debug!("Repeater checker detached: {}", e);
            }
            info!("Repeater '{}' stopped", self.settings.name);
        }
        lock(&self.entries).clear();
    }

    /// Starts, refreshes, or stops repeating based on the key's value.
    pub fn set(&self, key: &Key) {
        let hash = (self.key_hash)(key);
        let mut entries = lock(&self.entries);

        let decision = entries
            .get(&hash)
            .map(|entry| self.settings.policy.on_value_changed(key, &entry.key));

        match decision {
            None => {
                if self.settings.policy.should_repeat(key) {
                    trace!("Repeat armed for {}", hash);
                    entries.insert(hash, self.pending(key));
                }
            }
            Some(RestartDecision::Keep) => {
                // Timing stays, but repeats carry the latest reading.
                if let Some(entry) = entries.get_mut(&hash) {
                    entry.key = key.clone();
                }
            }
            Some(RestartDecision::Restart) => {
                trace!("Repeat re-armed for {}", hash);
                entries.insert(hash, self.pending(key));
            }
            Some(RestartDecision::Stop) => {
                trace!("Repeat stopped for {}", hash);
                entries.remove(&hash);
            }
        }
    }

    /// Starts repeating `key` unless it already repeats or the policy excludes it.
    pub fn start_repeat(&self, key: &Key) {
        if !self.settings.policy.handles(key.keytype) {
            return;
        }
        let hash = (self.key_hash)(key);
        lock(&self.entries)
            .entry(hash)
            .or_insert_with(|| self.pending(key));
    }

    pub fn stop_repeat(&self, key: &Key) {
        lock(&self.entries).remove(&(self.key_hash)(key));
    }

    pub fn is_repeating(&self, key: &Key) -> bool {
        lock(&self.entries).contains_key(&(self.key_hash)(key))
    }

    pub fn held_count(&self) -> usize {
        lock(&self.entries).len()
    }

    fn pending(&self, key: &Key) -> RepeatEntry {
        RepeatEntry {
            next_fire: Instant::now() + self.settings.first_repeat_timeout,
            key: key.clone(),
        }
    }

    /// Emits every due entry and schedules its next firing.
    pub fn fire_due(&self) {
        let sink = read(&self.sink).clone();
        let mut entries = lock(&self.entries);
        let now = Instant::now();

        for (hash, entry) in entries.iter_mut() {
            if now < entry.next_fire {
                continue;
            }
            let mut repeat = entry.key.copy();
            repeat.is_repeat = true;
            trace!("Repeating {}", hash);
            if let Some(sink) = &sink {
                sink(repeat);
            }
            entry.next_fire = now + self.settings.repeat_timeout;
        }
    }
}

impl fmt::Debug for Repeater {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repeater")
            .field("settings", &self.settings)
            .field("held", &self.held_count())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for Repeater {
    fn drop(&mut self) {
        let worker = lock(&self.worker).take();
        if let Some(mut worker) = worker {
            worker.stop(Duration::ZERO).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{HatValue, KeyValue};
    use std::thread;

    fn collecting(settings: RepeaterSettings) -> (Arc<Repeater>, Arc<Mutex<Vec<(Instant, Key)>>>) {
        let repeater = Arc::new(Repeater::new(settings));
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink_fired = fired.clone();
        repeater.set_sink(Arc::new(move |key| {
            sink_fired.lock().unwrap().push((Instant::now(), key));
        }));
        (repeater, fired)
    }

    fn fast(policy: RepeatPolicy) -> RepeaterSettings {
        RepeaterSettings {
            policy,
            first_repeat_timeout: Duration::from_millis(100),
            repeat_timeout: Duration::from_millis(50),
            check_timeout: Some(Duration::from_millis(5)),
            name: "test-repeater".to_string(),
        }
    }

    #[test]
    fn test_policy_decisions() {
        let held = Key::button(0, true);
        assert!(RepeatPolicy::Button.should_repeat(&held));
        assert!(!RepeatPolicy::Hat.should_repeat(&held));
        assert!(!RepeatPolicy::Button.should_repeat(&Key::button(0, false)));
        assert!(RepeatPolicy::Any.should_repeat(&Key::axis(0, 0.3)));

        let up = Key::hat(0, HatValue::Up);
        let up_right = Key::hat(0, HatValue::UpRight);
        let centered = Key::hat(0, HatValue::Centered);
        assert_eq!(RepeatPolicy::Hat.on_value_changed(&up, &up), RestartDecision::Keep);
        assert_eq!(RepeatPolicy::Hat.on_value_changed(&up_right, &up), RestartDecision::Restart);
        assert_eq!(RepeatPolicy::Hat.on_value_changed(&centered, &up), RestartDecision::Stop);
        assert_eq!(RepeatPolicy::Any.on_value_changed(&up_right, &up), RestartDecision::Keep);
    }

    #[test]
    fn test_set_tracks_entries() {
        let repeater = Repeater::with_policy(RepeatPolicy::ButtonHat);
        repeater.set(&Key::button(1, true));
        repeater.set(&Key::axis(0, 0.9));
        assert!(repeater.is_repeating(&Key::button(1, false)));
        assert_eq!(repeater.held_count(), 1);

        repeater.set(&Key::button(1, false));
        assert_eq!(repeater.held_count(), 0);

        repeater.start_repeat(&Key::axis(0, 0.9));
        assert_eq!(repeater.held_count(), 0);
    }

    #[test]
    fn test_button_repeat_timing() {
        let (repeater, fired) = collecting(fast(RepeatPolicy::Button));
        repeater.start().unwrap();

        let pressed_at = Instant::now();
        repeater.set(&Key::button(3, true));
        thread::sleep(Duration::from_millis(290));
        repeater.set(&Key::button(3, false));
        let released_at = Instant::now();

        let events = fired.lock().unwrap().clone();
        assert!(events.len() >= 2, "only {} repeats fired", events.len());
        assert!(events[0].0.duration_since(pressed_at) >= Duration::from_millis(100));
        for pair in events.windows(2) {
            let gap = pair[1].0.duration_since(pair[0].0);
            assert!(gap >= Duration::from_millis(45), "gap too short: {:?}", gap);
        }
        assert!(events.iter().all(|(_, key)| key.is_repeat && key.number == 3));

        thread::sleep(Duration::from_millis(120));
        let after = fired.lock().unwrap();
        assert!(after.iter().all(|(at, _)| *at <= released_at));
        drop(after);
        repeater.stop();
    }

    #[test]
    fn test_identical_press_does_not_restart() {
        let (repeater, fired) = collecting(fast(RepeatPolicy::Button));
        repeater.start().unwrap();

        let pressed_at = Instant::now();
        repeater.set(&Key::button(0, true));
        thread::sleep(Duration::from_millis(60));
        repeater.set(&Key::button(0, true));
        thread::sleep(Duration::from_millis(80));
        repeater.stop();

        let events = fired.lock().unwrap();
        assert!(!events.is_empty());
        assert!(events[0].0.duration_since(pressed_at) < Duration::from_millis(160));
    }

    #[test]
    fn test_hat_direction_change_retimes() {
        let (repeater, fired) = collecting(fast(RepeatPolicy::Hat));
        repeater.start().unwrap();

        repeater.set(&Key::hat(0, HatValue::Up));
        thread::sleep(Duration::from_millis(70));
        let changed_at = Instant::now();
        repeater.set(&Key::hat(0, HatValue::UpRight));
        thread::sleep(Duration::from_millis(60));
        assert!(fired.lock().unwrap().is_empty(), "fired before the re-timed delay");

        thread::sleep(Duration::from_millis(80));
        {
            let events = fired.lock().unwrap();
            assert!(!events.is_empty());
            assert!(events[0].0.duration_since(changed_at) >= Duration::from_millis(100));
            assert_eq!(events[0].1.hat_value().unwrap(), Some(HatValue::UpRight));
        }

        repeater.set(&Key::hat(0, HatValue::Centered));
        let centered_at = Instant::now();
        thread::sleep(Duration::from_millis(120));
        assert!(fired.lock().unwrap().iter().all(|(at, _)| *at <= centered_at));
        repeater.stop();
    }

    #[test]
    fn test_stop_clears_entries() {
        let (repeater, _fired) = collecting(fast(RepeatPolicy::ButtonHat));
        repeater.start().unwrap();
        repeater.set(&Key::button(0, true));
        repeater.set(&Key::hat(0, HatValue::Left));
        assert_eq!(repeater.held_count(), 2);
        repeater.stop();
        assert_eq!(repeater.held_count(), 0);
        assert!(!repeater.is_running());
    }

    #[test]
    fn test_effective_check_timeout_defaults_to_half() {
        let settings = RepeaterSettings::default();
        assert_eq!(settings.effective_check_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_changed_button_value_rearms() {
        let repeater = Repeater::new(fast(RepeatPolicy::Button));
        let pressed = Key::button(4, true);
        let harder = Key::new(KeyType::Button, 4, Some(KeyValue::Scalar(0.5)));
        assert_eq!(
            RepeatPolicy::Button.on_value_changed(&harder, &pressed),
            RestartDecision::Restart
        );

        repeater.set(&pressed);
        let first_fire = lock(&repeater.entries)[&pressed.repeat_hash()].next_fire;
        thread::sleep(Duration::from_millis(20));
        repeater.set(&harder);

        let entries = lock(&repeater.entries);
        let entry = &entries[&pressed.repeat_hash()];
        assert!(entry.next_fire >= first_fire + Duration::from_millis(20));
        assert_eq!(entry.key.scalar(), 0.5);
    }

    #[test]
    fn test_kept_entry_repeats_latest_value() {
        let (repeater, fired) = collecting(fast(RepeatPolicy::Any));
        repeater.start().unwrap();
        repeater.set(&Key::axis(1, 0.3));
        let first_fire = lock(&repeater.entries)["Axis 1"].next_fire;
        thread::sleep(Duration::from_millis(10));
        repeater.set(&Key::axis(1, 0.9));
        {
            let entries = lock(&repeater.entries);
            assert_eq!(entries["Axis 1"].next_fire, first_fire);
            assert_eq!(entries["Axis 1"].key.scalar(), 0.9);
        }

        thread::sleep(Duration::from_millis(160));
        repeater.stop();

        let events = fired.lock().unwrap();
        assert!(!events.is_empty());
        assert!(events.iter().all(|(_, key)| key.scalar() == 0.9 && key.is_repeat));
    }
}
