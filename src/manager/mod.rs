//! Event manager: device registry, coalescing buffer and dispatch.
//!
//! ```text
//! backend loop ──► save_device / delete_device / save_key_event
//!                         │                 │
//!                         │                 └──► Repeater::set
//!                         ▼
//!                  EventCore { devices, pending }  ◄── repeat events
//!                         │
//!          Dispatcher (every activity_timeout) ──► handle_key_event
//! ```
//!
//! Two managers share [`EventCore`]: [`ThreadEventManager`] drives the backend
//! on a thread of this process, [`ProcessEventManager`] reads the same events
//! from a relay child process.

pub mod dispatcher;
pub mod isolated;
pub mod threaded;

use std::fmt;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::backend::Backend;
use crate::config::Config;
use crate::device::{DeviceSelector, Joystick, Key, KeyType};
use crate::error::InputError;
use crate::repeater::Repeater;
use crate::stash::{Stash, StashKey};
use crate::util::{join_within, lock, read, write, PeriodicWorker};

pub use dispatcher::{DispatchState, Dispatcher, EventBatch};
pub use isolated::{ProcessEventManager, RelayCommand};
pub use threaded::ThreadEventManager;

/// Callback for dispatched key events.
pub type KeyHandler = Arc<dyn Fn(&Key) + Send + Sync>;

/// Callback for attached or removed devices.
pub type DeviceHandler = Arc<dyn Fn(&Arc<Joystick>) + Send + Sync>;

/// Extra liveness condition checked by the backend loop.
pub type AlivePredicate = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Period of the dispatcher.
    pub activity_timeout: Duration,
    /// How long `stop()` waits for the backend and dispatcher threads.
    /// Zero only checks once.
    pub shutdown_grace: Duration,
    /// Sleep between checks in [`EventManager::wait`] and [`EventManager::find_key`].
    pub poll_interval: Duration,
    /// Deadband applied to every device as it attaches.
    pub deadband: Option<f64>,
    /// Prefix for the names of spawned threads.
    pub name: String,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            activity_timeout: Duration::from_millis(10),
            shutdown_grace: Duration::ZERO,
            poll_interval: Duration::from_millis(10),
            deadband: None,
            name: "padstream".to_string(),
        }
    }
}

/// User callbacks invoked by the manager.
#[derive(Clone)]
pub struct ManagerHooks {
    pub add_device: DeviceHandler,
    pub remove_device: DeviceHandler,
    pub handle_key_event: KeyHandler,
}

impl Default for ManagerHooks {
    fn default() -> Self {
        Self {
            add_device: Arc::new(|_| {}),
            remove_device: Arc::new(|_| {}),
            handle_key_event: Arc::new(|_| {}),
        }
    }
}

impl fmt::Debug for ManagerHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerHooks").finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct EventState {
    devices: Stash<Arc<Joystick>>,
    pending: Stash<Key>,
}

/// State shared by the backend loop, the repeater and the dispatcher.
///
/// Devices and pending keys live behind one lock. It is only held while the
/// registry or the batch is mutated, never while user code runs, and never
/// while calling into the repeater.
pub struct EventCore {
    state: Mutex<EventState>,
    hooks: RwLock<ManagerHooks>,
    repeater: Option<Arc<Repeater>>,
    settings: ManagerSettings,
}

impl EventCore {
    pub fn new(
        settings: ManagerSettings,
        hooks: ManagerHooks,
        repeater: Option<Arc<Repeater>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|core: &Weak<EventCore>| {
            if let Some(repeater) = &repeater {
                let core = core.clone();
                repeater.set_sink(Arc::new(move |key: Key| {
                    if let Some(core) = core.upgrade() {
                        core.update_key_event(key);
                    }
                }));
            }
            EventCore {
                state: Mutex::new(EventState::default()),
                hooks: RwLock::new(hooks),
                repeater,
                settings,
            }
        })
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn repeater(&self) -> Option<&Arc<Repeater>> {
        self.repeater.as_ref()
    }

    pub fn hooks(&self) -> ManagerHooks {
        read(&self.hooks).clone()
    }

    pub fn set_hooks(&self, hooks: ManagerHooks) {
        *write(&self.hooks) = hooks;
    }

    pub fn key_handler(&self) -> KeyHandler {
        read(&self.hooks).handle_key_event.clone()
    }

    /// Swaps the key handler, returning the one it replaced.
    pub fn set_key_handler(&self, handler: KeyHandler) -> KeyHandler {
        std::mem::replace(&mut write(&self.hooks).handle_key_event, handler)
    }

    /// Snapshot of the registered devices in attach order.
    pub fn devices(&self) -> Vec<Arc<Joystick>> {
        lock(&self.state).devices.iter().cloned().collect()
    }

    /// Looks a device up by position, id, name, or another device.
    pub fn device<Q>(&self, key: &Q) -> Result<Arc<Joystick>, InputError>
    where
        Q: StashKey<Arc<Joystick>> + ?Sized,
    {
        lock(&self.state).devices.get(key).cloned()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Registers an attached device, replacing an equal one already known.
    pub fn save_device(&self, device: Arc<Joystick>) {
        if let Some(deadband) = self.settings.deadband {
            device.set_deadband(deadband);
        }
        {
            let mut state = lock(&self.state);
            if state.devices.contains(&device) {
                debug!("Device '{}' re-attached, replacing registry entry", device);
                state.devices.set(&device, device.clone()).ok();
            } else {
                state.devices.push(device.clone());
            }
        }
        info!(
            "Device added: '{}' (id {}, {} axes, {} buttons, {} hats, {} balls)",
            device.name(),
            device.id(),
            device.num_axes(),
            device.num_buttons(),
            device.num_hats(),
            device.num_balls()
        );

        let hook = read(&self.hooks).add_device.clone();
        hook(&device);
    }

    /// Unregisters and closes a device. Unknown devices are ignored.
    pub fn delete_device(&self, device: &Arc<Joystick>) {
        let removed = lock(&self.state).devices.remove(device);
        match removed {
            Ok(removed) => {
                removed.close();
                info!("Device removed: '{}' (id {})", removed.name(), removed.id());
                let hook = read(&self.hooks).remove_device.clone();
                hook(&removed);
            }
            Err(_) => debug!("Ignoring removal of unknown device '{}'", device),
        }
    }

    /// Entry point for raw key events from the backend loop.
    pub fn save_key_event(&self, mut key: Key) {
        let canonical = key
            .device()
            .and_then(|link| lock(&self.state).devices.get(link).ok().cloned());
        if let Some(joystick) = canonical {
            key.set_device(Some(joystick.link()));
        }

        if let Some(repeater) = &self.repeater {
            repeater.set(&key);
        }

        self.update_key_event(key);
    }

    /// Commits the value to the device and queues the key for dispatch.
    ///
    /// A non-button key already waiting in the batch only has its value
    /// refreshed. Button keys are always appended so both edges of a
    /// press/release survive a single cycle.
    pub fn update_key_event(&self, key: Key) {
        let mut state = lock(&self.state);

        if let Some(joystick) = key.joystick() {
            if let Err(e) = joystick.update_key(&key) {
                warn!("Dropping key event {}: {}", key, e);
                return;
            }
        }

        if key.keytype != KeyType::Button {
            if let Ok(queued) = state.pending.get_mut(&key) {
                trace!("Coalescing {} into pending batch", key);
                queued.set_raw_value(key.raw_value());
                return;
            }
        }
        trace!("Queued {}", key);
        state.pending.push(key);
    }

    /// Swaps the pending batch out for an empty one.
    pub fn take_pending(&self) -> Stash<Key> {
        lock(&self.state).pending.take()
    }

    /// Stops the repeater and forgets all devices and pending events.
    pub fn reset(&self) {
        if let Some(repeater) = &self.repeater {
            repeater.stop();
        }
        let devices = {
            let mut state = lock(&self.state);
            state.pending.clear();
            state.devices.take()
        };
        for device in &devices {
            device.close();
        }
        debug!("Cleared {} devices from the registry", devices.len());
    }
}

impl fmt::Debug for EventCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Released before the repeater is formatted, which takes its own lock.
        let (devices, pending) = {
            let state = lock(&self.state);
            (state.devices.len(), state.pending.len())
        };
        f.debug_struct("EventCore")
            .field("devices", &devices)
            .field("pending", &pending)
            .field("repeater", &self.repeater)
            .field("settings", &self.settings)
            .finish()
    }
}

/// Threads of one `start()`..`stop()` cycle.
pub(crate) struct ActiveRun {
    pub(crate) token: CancellationToken,
    pub(crate) name: String,
    pub(crate) backend: Option<JoinHandle<()>>,
    pub(crate) dispatcher: PeriodicWorker,
}

impl ActiveRun {
    pub(crate) fn is_live(&self) -> bool {
        !self.token.is_cancelled()
            && self
                .backend
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }

    /// Cancels the run and joins the dispatcher and backend threads, both
    /// within one `grace` window.
    ///
    /// A thread still busy afterwards (a blocked backend read, a slow key
    /// handler) is detached and reported as [`InputError::ShutdownTimeout`].
    pub(crate) fn shutdown(mut self, grace: Duration) -> Result<(), InputError> {
        let deadline = Instant::now() + grace;
        self.token.cancel();

        let dispatcher = self.dispatcher.stop(grace);
        if let Err(e) = &dispatcher {
            debug!("Dispatcher detached: {}", e);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let backend = match self.backend.take() {
            Some(handle) => join_within(handle, remaining, &self.name),
            None => Ok(()),
        };
        backend.and(dispatcher)
    }
}

/// Liveness check handed to backend loops: the run token plus an optional
/// user predicate.
pub(crate) fn liveness(
    token: &CancellationToken,
    alive_when: Option<AlivePredicate>,
) -> impl Fn() -> bool + Send + Sync + 'static {
    let token = token.clone();
    move || !token.is_cancelled() && alive_when.as_ref().map_or(true, |alive| alive())
}

/// Filter for [`EventManager::find_key`].
#[derive(Debug, Clone, Default)]
pub struct KeyQuery {
    /// Devices to accept. Empty accepts every device.
    pub devices: Vec<DeviceSelector>,
    /// Key types to accept. Empty accepts every type.
    pub keytypes: Vec<KeyType>,
    /// `None` waits forever.
    pub timeout: Option<Duration>,
    /// Overrides the manager's poll interval.
    pub poll_interval: Option<Duration>,
}

impl KeyQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device(mut self, selector: impl Into<DeviceSelector>) -> Self {
        self.devices.push(selector.into());
        self
    }

    pub fn keytype(mut self, keytype: KeyType) -> Self {
        self.keytypes.push(keytype);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Axis keys only count when they are off center. Other types pass with any value.
    pub fn accepts(&self, key: &Key) -> bool {
        let device_ok = self.devices.is_empty()
            || key.device().is_some_and(|link| {
                self.devices
                    .iter()
                    .any(|selector| selector.matches_ident(link.ident()))
            });
        let keytype_ok = self.keytypes.is_empty() || self.keytypes.contains(&key.keytype);
        let value_ok = key.keytype != KeyType::Axis || key.is_active();
        device_ok && keytype_ok && value_ok
    }
}

/// Polls `done` every `poll` until it returns true or `timeout` elapses.
///
/// Returns whether the condition was met.
pub fn wait_until<F>(mut done: F, timeout: Option<Duration>, poll: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let started = Instant::now();
    loop {
        if done() {
            return true;
        }
        if timeout.is_some_and(|timeout| started.elapsed() >= timeout) {
            return false;
        }
        thread::sleep(poll);
    }
}

/// Keeps a manager running for its lifetime, if it was the one to start it.
pub struct RunGuard<'a, M: EventManager + ?Sized> {
    manager: &'a M,
    started: bool,
}

impl<'a, M: EventManager + ?Sized> RunGuard<'a, M> {
    pub fn enter(manager: &'a M) -> Result<Self, InputError> {
        let started = !manager.is_running();
        if started {
            manager.start()?;
        }
        Ok(Self { manager, started })
    }

    pub fn started(&self) -> bool {
        self.started
    }
}

impl<M: EventManager + ?Sized> Drop for RunGuard<'_, M> {
    fn drop(&mut self) {
        if self.started {
            if let Err(e) = self.manager.stop() {
                debug!("Stop after temporary run: {}", e);
            }
        }
    }
}

/// Common surface of the threaded and process-isolated managers.
pub trait EventManager: Send + Sync {
    fn core(&self) -> &Arc<EventCore>;

    /// Launches the backend and the dispatcher. A running manager is stopped first.
    fn start(&self) -> Result<(), InputError>;

    /// Cancels the run and clears the registry.
    ///
    /// Returns promptly. A backend that does not honor the cancellation
    /// within the configured grace period is left running and reported as
    /// [`InputError::ShutdownTimeout`].
    fn stop(&self) -> Result<(), InputError>;

    /// True while the current run is neither stopped nor finished.
    ///
    /// A backend loop that returns on its own ends the run: the manager then
    /// reports not running even though the dispatcher may still drain the
    /// last batch, and the next `start()` (also from `run_during` or
    /// `find_key`) begins a fresh run with an empty registry.
    fn is_running(&self) -> bool;

    fn settings(&self) -> &ManagerSettings {
        self.core().settings()
    }

    fn devices(&self) -> Vec<Arc<Joystick>> {
        self.core().devices()
    }

    fn save_device(&self, device: Arc<Joystick>) {
        self.core().save_device(device);
    }

    fn delete_device(&self, device: &Arc<Joystick>) {
        self.core().delete_device(device);
    }

    fn save_key_event(&self, key: Key) {
        self.core().save_key_event(key);
    }

    /// Runs one dispatch cycle on the calling thread.
    fn process_events(&self) {
        dispatcher::dispatch_once(self.core());
    }

    fn set_key_handler(&self, handler: KeyHandler) -> KeyHandler {
        self.core().set_key_handler(handler)
    }

    /// Blocks until `done` returns true or `timeout` elapses.
    fn wait(&self, done: &mut dyn FnMut() -> bool, timeout: Option<Duration>) -> bool {
        wait_until(done, timeout, self.settings().poll_interval)
    }

    fn run_during(&self) -> Result<RunGuard<'_, Self>, InputError>
    where
        Self: Sized,
    {
        RunGuard::enter(self)
    }

    /// Waits for the next key accepted by `query`.
    ///
    /// The key handler is swapped out for the duration of the call. A
    /// manager that was stopped is started and stopped again; one that was
    /// running is left running.
    fn find_key(&self, query: &KeyQuery) -> Result<Option<Key>, InputError> {
        let found: Arc<Mutex<Option<Key>>> = Arc::new(Mutex::new(None));

        let filter = query.clone();
        let slot = found.clone();
        let previous = self.core().set_key_handler(Arc::new(move |key: &Key| {
            if filter.accepts(key) {
                let mut slot = lock(&slot);
                if slot.is_none() {
                    *slot = Some(key.clone());
                }
            }
        }));

        let poll = query.poll_interval.unwrap_or(self.settings().poll_interval);
        let outcome = RunGuard::enter(self).map(|guard| {
            wait_until(|| lock(&found).is_some(), query.timeout, poll);
            drop(guard);
        });
        self.core().set_key_handler(previous);
        outcome?;

        let key = lock(&found).take();
        match &key {
            Some(key) => debug!("find_key matched {}", key),
            None => debug!("find_key timed out after {:?}", query.timeout),
        }
        Ok(key)
    }
}

/// Builds either manager variant from one set of options.
#[derive(Default)]
pub struct EventManagerBuilder {
    backend: Option<Arc<dyn Backend>>,
    relay: Option<RelayCommand>,
    hooks: ManagerHooks,
    repeater: Option<Arc<Repeater>>,
    settings: ManagerSettings,
    alive_when: Option<AlivePredicate>,
}

impl EventManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings and repeater taken from a loaded configuration.
    pub fn config(mut self, config: &Config) -> Self {
        self.settings = config.manager_settings();
        self.repeater = config.repeater().map(Arc::new);
        self
    }

    pub fn backend(mut self, backend: impl Backend) -> Self {
        self.backend = Some(Arc::new(backend));
        self
    }

    pub fn shared_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn relay_command(mut self, command: RelayCommand) -> Self {
        self.relay = Some(command);
        self
    }

    pub fn on_add_device<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Arc<Joystick>) + Send + Sync + 'static,
    {
        self.hooks.add_device = Arc::new(handler);
        self
    }

    pub fn on_remove_device<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Arc<Joystick>) + Send + Sync + 'static,
    {
        self.hooks.remove_device = Arc::new(handler);
        self
    }

    pub fn on_key_event<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Key) + Send + Sync + 'static,
    {
        self.hooks.handle_key_event = Arc::new(handler);
        self
    }

    pub fn repeater(mut self, repeater: Repeater) -> Self {
        self.repeater = Some(Arc::new(repeater));
        self
    }

    pub fn no_repeater(mut self) -> Self {
        self.repeater = None;
        self
    }

    pub fn settings(mut self, settings: ManagerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn activity_timeout(mut self, timeout: Duration) -> Self {
        self.settings.activity_timeout = timeout;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.settings.shutdown_grace = grace;
        self
    }

    pub fn alive_when<F>(mut self, alive: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.alive_when = Some(Arc::new(alive));
        self
    }

    fn validate(&self) -> Result<(), InputError> {
        if self.settings.activity_timeout.is_zero() {
            return Err(InputError::ConfigError(
                "activity timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn build_threaded(self) -> Result<ThreadEventManager, InputError> {
        self.validate()?;
        let backend = self.backend.ok_or_else(|| {
            InputError::ConfigError("a threaded manager needs a backend".to_string())
        })?;
        let core = EventCore::new(self.settings, self.hooks, self.repeater);
        Ok(ThreadEventManager::from_parts(core, backend, self.alive_when))
    }

    pub fn build_isolated(self) -> Result<ProcessEventManager, InputError> {
        self.validate()?;
        let relay = self.relay.ok_or_else(|| {
            InputError::ConfigError("a process manager needs a relay command".to_string())
        })?;
        let core = EventCore::new(self.settings, self.hooks, self.repeater);
        Ok(ProcessEventManager::from_parts(core, relay, self.alive_when))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceIdent, DeviceInfo, DeviceLink, HatValue, KeyCounts};

    fn pad(id: i64, name: &str) -> Arc<Joystick> {
        Joystick::new(DeviceInfo::new(id, name, KeyCounts::new(2, 4, 1, 0)), None)
    }

    fn recording_core() -> (Arc<EventCore>, Arc<Mutex<Vec<Key>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let hooks = ManagerHooks {
            handle_key_event: Arc::new(move |key: &Key| sink.lock().unwrap().push(key.clone())),
            ..ManagerHooks::default()
        };
        (EventCore::new(ManagerSettings::default(), hooks, None), seen)
    }

    #[test]
    fn test_save_key_event_resolves_canonical_device() {
        let (core, _) = recording_core();
        let joystick = pad(4, "Pad");
        core.save_device(joystick.clone());

        let detached =
            Key::axis(1, 0.4).with_device(DeviceLink::detached(DeviceIdent::new(4, "Pad")));
        core.save_key_event(detached);

        assert_eq!(joystick.get_axis(1).unwrap(), 0.4);
        let pending = core.take_pending();
        assert!(pending[0].joystick().is_some());
    }

    #[test]
    fn test_non_button_keys_coalesce() {
        let (core, _) = recording_core();
        let joystick = pad(0, "Pad");
        core.save_device(joystick.clone());

        for i in 0..10 {
            core.save_key_event(Key::axis(0, i as f64 / 10.0).on(&joystick));
        }
        core.save_key_event(Key::hat(0, HatValue::Up).on(&joystick));
        core.save_key_event(Key::hat(0, HatValue::Left).on(&joystick));

        let pending = core.take_pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].scalar(), 0.9);
        assert_eq!(pending[1].hat_value().unwrap(), Some(HatValue::Left));
        assert_eq!(core.pending_count(), 0);
    }

    #[test]
    fn test_button_edges_are_kept() {
        let (core, _) = recording_core();
        core.save_key_event(Key::button(1, true));
        core.save_key_event(Key::button(1, false));
        core.save_key_event(Key::button(1, true));
        assert_eq!(core.pending_count(), 3);
    }

    #[test]
    fn test_out_of_range_key_is_dropped() {
        let (core, _) = recording_core();
        let joystick = pad(0, "Pad");
        core.save_device(joystick.clone());
        core.save_key_event(Key::button(12, true).on(&joystick));
        assert_eq!(core.pending_count(), 0);
    }

    #[test]
    fn test_device_hooks() {
        let added = Arc::new(Mutex::new(Vec::new()));
        let removed = Arc::new(Mutex::new(Vec::new()));
        let (add_sink, remove_sink) = (added.clone(), removed.clone());
        let hooks = ManagerHooks {
            add_device: Arc::new(move |d: &Arc<Joystick>| {
                add_sink.lock().unwrap().push(d.name().to_string())
            }),
            remove_device: Arc::new(move |d: &Arc<Joystick>| {
                remove_sink.lock().unwrap().push(d.name().to_string())
            }),
            ..ManagerHooks::default()
        };
        let core = EventCore::new(ManagerSettings::default(), hooks, None);

        let joystick = pad(1, "Pad");
        core.save_device(joystick.clone());
        core.save_device(pad(1, "Pad"));
        assert_eq!(core.devices().len(), 1);
        assert_eq!(added.lock().unwrap().len(), 2);

        core.delete_device(&joystick);
        core.delete_device(&joystick);
        assert!(core.devices().is_empty());
        assert_eq!(*removed.lock().unwrap(), vec!["Pad".to_string()]);
    }

    #[test]
    fn test_device_lookup_forms() {
        let (core, _) = recording_core();
        core.save_device(pad(3, "Pad A"));
        core.save_device(pad(8, "Pad B"));
        assert_eq!(core.device(&1usize).unwrap().name(), "Pad B");
        assert_eq!(core.device(&3i64).unwrap().name(), "Pad A");
        assert_eq!(core.device("Pad B").unwrap().id(), 8);
        assert!(core.device("Pad C").is_err());
    }

    #[test]
    fn test_key_query_filters() {
        let joystick = pad(2, "Pad");
        let query = KeyQuery::new().device(2i64).keytype(KeyType::Axis);

        assert!(!query.accepts(&Key::axis(0, 0.0).on(&joystick)));
        assert!(query.accepts(&Key::axis(0, -0.3).on(&joystick)));
        assert!(!query.accepts(&Key::axis(0, 0.3)));
        assert!(!query.accepts(&Key::button(0, true).on(&joystick)));

        let any = KeyQuery::new();
        assert!(any.accepts(&Key::button(0, false)));
        assert!(any.accepts(&Key::hat(0, HatValue::Centered)));
    }

    #[test]
    fn test_wait_until_times_out() {
        let started = Instant::now();
        let met = wait_until(|| false, Some(Duration::from_millis(30)), Duration::from_millis(5));
        assert!(!met);
        assert!(started.elapsed() >= Duration::from_millis(30));

        let mut calls = 0;
        assert!(wait_until(
            || {
                calls += 1;
                calls == 3
            },
            None,
            Duration::from_millis(1)
        ));
    }

    #[test]
    fn test_debug_format_while_repeats_fire() {
        use crate::repeater::{RepeatPolicy, RepeaterSettings};

        let repeater = Arc::new(Repeater::new(RepeaterSettings {
            policy: RepeatPolicy::Button,
            first_repeat_timeout: Duration::ZERO,
            repeat_timeout: Duration::from_millis(1),
            check_timeout: Some(Duration::from_millis(1)),
            ..RepeaterSettings::default()
        }));
        let core = EventCore::new(
            ManagerSettings::default(),
            ManagerHooks::default(),
            Some(repeater.clone()),
        );
        repeater.start().unwrap();
        for number in 0..256 {
            core.save_key_event(Key::button(number, true));
        }

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let formatter = {
            let core = core.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    assert!(format!("{:?}", core).contains("EventCore"));
                }
                done_tx.send(()).ok();
            })
        };

        let deadline = Instant::now() + Duration::from_secs(10);
        let finished = loop {
            if done_rx.try_recv().is_ok() {
                break true;
            }
            if Instant::now() >= deadline {
                break false;
            }
            core.take_pending();
        };
        assert!(finished, "formatting the core blocked the repeat pipeline");
        formatter.join().unwrap();
        repeater.stop();
    }
}
