use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Local};
use statum::{machine, state};
use tracing::{debug, error, info, trace};

use crate::device::{Key, KeyType};
use crate::error::InputError;
use crate::manager::EventCore;
use crate::util::{panic_message, PeriodicWorker};

// Keys drained from the pending buffer in one cycle
#[derive(Debug, Clone, Default)]
pub struct EventBatch {
    pub keys: Vec<Key>,
}

#[state]
#[derive(Debug, Clone)]
pub enum DispatchState {
    Waiting,
    Delivering(EventBatch),
}

#[derive(Debug, Clone)]
pub struct DispatchStats {
    cycles: u64,
    events: u64,
    last_report: DateTime<Local>,
}

impl Default for DispatchStats {
    fn default() -> Self {
        Self {
            cycles: 0,
            events: 0,
            last_report: Local::now(),
        }
    }
}

/// Drains the pending batch and hands every key to the user callback.
#[machine]
#[derive(Debug)]
pub struct Dispatcher<S: DispatchState> {
    core: Arc<EventCore>,
    stats: DispatchStats,
}

impl<S: DispatchState> Dispatcher<S> {
    pub fn core(&self) -> &Arc<EventCore> {
        &self.core
    }
}

impl Dispatcher<Waiting> {
    pub fn create(core: Arc<EventCore>) -> Self {
        Self::new(core, DispatchStats::default())
    }

    // Swap out the pending buffer under the event lock
    pub fn collect(self) -> Dispatcher<Delivering> {
        let batch = EventBatch {
            keys: self.core.take_pending().into_vec(),
        };
        if !batch.keys.is_empty() {
            debug!("Collected batch of {} key events", batch.keys.len());
        }
        self.transition_with(batch)
    }

    /// One full cycle: collect, then deliver.
    pub fn run_cycle(self) -> Dispatcher<Waiting> {
        self.collect().deliver()
    }
}

impl Dispatcher<Delivering> {
    pub fn batch_len(&self) -> usize {
        self.get_state_data().map_or(0, |batch| batch.keys.len())
    }

    /// Delivers the batch in queue order, outside the event lock.
    ///
    /// Non-button keys are refreshed from their device first so a value
    /// written after the swap is not lost. Buttons keep the edge they carried.
    pub fn deliver(mut self) -> Dispatcher<Waiting> {
        let keys = self
            .get_state_data()
            .map(|batch| batch.keys.clone())
            .unwrap_or_default();

        if !keys.is_empty() {
            let handler = self.core.key_handler();
            for mut key in keys.iter().cloned() {
                if key.keytype != KeyType::Button {
                    key.update_value(None);
                }
                trace!("Dispatching {} ({:?})", key, key.value());
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(&key))) {
                    error!(
                        "Key handler panicked on {}: {}",
                        key,
                        panic_message(payload.as_ref())
                    );
                }
            }
        }

        self.record(keys.len());
        self.transition()
    }

    fn record(&mut self, events: usize) {
        self.stats.cycles += 1;
        self.stats.events += events as u64;

        let now = Local::now();
        let elapsed = now - self.stats.last_report;
        if elapsed > chrono::Duration::seconds(30) {
            let seconds = elapsed.num_milliseconds() as f64 / 1000.0;
            info!(
                "Dispatcher stats: {} cycles, {} events in {:.0} seconds",
                self.stats.cycles, self.stats.events, seconds
            );
            info!(
                "Average: {:.2} events/cycle, {:.2} cycles/sec, {:.2} events/sec",
                self.stats.events as f64 / self.stats.cycles as f64,
                self.stats.cycles as f64 / seconds,
                self.stats.events as f64 / seconds
            );
            self.stats = DispatchStats {
                last_report: now,
                ..DispatchStats::default()
            };
        }
    }
}

/// Runs a single cycle on the calling thread.
pub fn dispatch_once(core: &Arc<EventCore>) {
    Dispatcher::create(core.clone()).run_cycle();
}

/// Spawns the periodic dispatcher for `core`.
pub(crate) fn spawn(core: Arc<EventCore>) -> Result<PeriodicWorker, InputError> {
    let interval = core.settings().activity_timeout;
    let name = format!("{}-dispatch", core.settings().name);
    info!("Starting dispatcher with {:?} interval", interval);

    let mut dispatcher = Some(Dispatcher::create(core.clone()));
    PeriodicWorker::spawn(name, interval, move || {
        // A panic mid-cycle loses the machine; start over with fresh stats.
        let current = dispatcher
            .take()
            .unwrap_or_else(|| Dispatcher::create(core.clone()));
        dispatcher = Some(current.run_cycle());
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceInfo, Joystick, KeyCounts};
    use crate::manager::{ManagerHooks, ManagerSettings};
    use std::sync::Mutex;

    fn core_with_log() -> (Arc<EventCore>, Arc<Mutex<Vec<Key>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let hooks = ManagerHooks {
            handle_key_event: Arc::new(move |key: &Key| sink.lock().unwrap().push(key.clone())),
            ..ManagerHooks::default()
        };
        (EventCore::new(ManagerSettings::default(), hooks, None), seen)
    }

    #[test]
    fn test_cycle_delivers_in_order() {
        let (core, seen) = core_with_log();
        core.save_key_event(Key::button(0, true));
        core.save_key_event(Key::axis(1, 0.5));
        core.save_key_event(Key::button(0, false));

        let waiting = Dispatcher::create(core.clone());
        let delivering = waiting.collect();
        assert_eq!(delivering.batch_len(), 3);
        assert_eq!(core.pending_count(), 0);
        delivering.deliver();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen[0].is_active());
        assert_eq!(seen[1].keytype, KeyType::Axis);
        assert!(!seen[2].is_active());
    }

    #[test]
    fn test_refresh_uses_latest_device_value() {
        let (core, seen) = core_with_log();
        let joystick = Joystick::new(DeviceInfo::new(0, "Pad", KeyCounts::new(1, 1, 0, 0)), None);
        core.save_device(joystick.clone());

        core.save_key_event(Key::axis(0, 0.2).on(&joystick));
        let delivering = Dispatcher::create(core.clone()).collect();
        joystick.update_key(&Key::axis(0, 0.8)).unwrap();
        delivering.deliver();

        assert_eq!(seen.lock().unwrap()[0].scalar(), 0.8);
    }

    #[test]
    fn test_panicking_handler_does_not_drop_batch() {
        let (core, seen) = core_with_log();
        let sink = seen.clone();
        core.set_key_handler(Arc::new(move |key: &Key| {
            if key.number == 0 {
                panic!("bad handler");
            }
            sink.lock().unwrap().push(key.clone());
        }));

        core.save_key_event(Key::button(0, true));
        core.save_key_event(Key::button(1, true));
        dispatch_once(&core);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
