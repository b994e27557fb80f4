//! Replays device events from a script instead of real hardware.
//!
//! Scripts are TOML: devices present at start, then timed steps.
//!
//! ```toml
//! [[device]]
//! id = 0
//! name = "Replay Pad"
//! counts = { axes = 2, buttons = 4, hats = 1 }
//!
//! [[step]]
//! delay_ms = 20
//! event = { kind = "key", device = 0, keytype = "Button", number = 2, value = 1 }
//! ```
//!
//! A [`ScriptHandle`] can inject further events while the loop runs.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{Backend, LoopHooks};
use crate::device::{DeviceHandle, DeviceInfo, Joystick, Key, KeyType, KeyValue};
use crate::error::InputError;
use crate::stash::Stash;

const IDLE_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScriptEvent {
    Add {
        device: DeviceInfo,
    },
    Remove {
        id: i64,
    },
    Key {
        device: i64,
        keytype: KeyType,
        number: usize,
        value: KeyValue,
    },
}

impl ScriptEvent {
    pub fn key(device: i64, keytype: KeyType, number: usize, value: impl Into<KeyValue>) -> Self {
        ScriptEvent::Key {
            device,
            keytype,
            number,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptStep {
    #[serde(default)]
    pub delay_ms: u64,
    pub event: ScriptEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceInfo>,
    #[serde(default, rename = "step")]
    pub steps: Vec<ScriptStep>,
    /// Keep the loop alive after the last step until stopped.
    #[serde(default = "default_hold")]
    pub hold: bool,
}

fn default_hold() -> bool {
    true
}

impl Default for Script {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            steps: Vec::new(),
            hold: true,
        }
    }
}

impl Script {
    pub fn parse(text: &str) -> Result<Self, InputError> {
        toml::from_str(text).map_err(|e| InputError::ConfigError(format!("invalid script: {}", e)))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, InputError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        info!("Loaded replay script from {}", path.display());
        Self::parse(&text)
    }

    pub fn device(mut self, info: DeviceInfo) -> Self {
        self.devices.push(info);
        self
    }

    pub fn step(mut self, delay: Duration, event: ScriptEvent) -> Self {
        self.steps.push(ScriptStep {
            delay_ms: delay.as_millis() as u64,
            event,
        });
        self
    }
}

#[derive(Debug)]
struct ScriptedHandle(u64);

impl DeviceHandle for ScriptedHandle {
    fn handle_id(&self) -> u64 {
        self.0
    }
}

/// Sends events into a running [`ScriptedBackend`].
#[derive(Debug, Clone)]
pub struct ScriptHandle {
    tx: Sender<ScriptEvent>,
}

impl ScriptHandle {
    pub fn send(&self, event: ScriptEvent) -> Result<(), InputError> {
        self.tx
            .send(event)
            .map_err(|_| InputError::TransportError("scripted backend is gone".to_string()))
    }

    pub fn add(&self, device: DeviceInfo) -> Result<(), InputError> {
        self.send(ScriptEvent::Add { device })
    }

    pub fn remove(&self, id: i64) -> Result<(), InputError> {
        self.send(ScriptEvent::Remove { id })
    }

    pub fn key(&self, device: i64, key: &Key) -> Result<(), InputError> {
        self.send(ScriptEvent::Key {
            device,
            keytype: key.keytype,
            number: key.number,
            value: key.value(),
        })
    }
}

#[derive(Debug)]
pub struct ScriptedBackend {
    script: Script,
    injected: Option<Receiver<ScriptEvent>>,
}

impl ScriptedBackend {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            injected: None,
        }
    }

    /// Backend plus a handle for injecting events while it runs.
    pub fn with_handle(script: Script) -> (Self, ScriptHandle) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let backend = Self {
            script,
            injected: Some(rx),
        };
        (backend, ScriptHandle { tx })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, InputError> {
        Ok(Self::new(Script::load(path)?))
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    fn open(info: &DeviceInfo) -> Arc<Joystick> {
        Joystick::new(info.clone(), Some(Box::new(ScriptedHandle(info.id as u64))))
    }

    fn apply(
        &self,
        event: &ScriptEvent,
        attached: &mut Stash<Arc<Joystick>>,
        hooks: &LoopHooks,
    ) -> Result<(), InputError> {
        match event {
            ScriptEvent::Add { device } => {
                let joystick = Self::open(device);
                attached.remove(&device.id).ok();
                attached.push(joystick.clone());
                hooks.add(joystick);
            }
            ScriptEvent::Remove { id } => {
                let joystick = attached.remove(id).map_err(|_| {
                    InputError::BackendTransient(format!("remove of unknown device {}", id))
                })?;
                hooks.remove(joystick);
            }
            ScriptEvent::Key {
                device,
                keytype,
                number,
                value,
            } => {
                let joystick = attached.get(device).map_err(|_| {
                    InputError::BackendTransient(format!("key for unknown device {}", device))
                })?;
                hooks.key(Key::new(*keytype, *number, Some(*value)).on(joystick));
            }
        }
        Ok(())
    }

    // Sleep in short slices so a stop request is noticed promptly
    fn sleep_while_alive(hooks: &LoopHooks, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        while hooks.is_alive() {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(IDLE_POLL.min(deadline - now));
        }
        false
    }
}

impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn list_devices(&self) -> Result<Stash<Arc<Joystick>>, InputError> {
        Ok(self.script.devices.iter().map(Self::open).collect())
    }

    fn run_event_loop(&self, hooks: &LoopHooks) -> Result<(), InputError> {
        info!(
            "Replaying script: {} devices, {} steps",
            self.script.devices.len(),
            self.script.steps.len()
        );
        let mut attached = self.list_devices()?;
        for joystick in attached.iter() {
            hooks.add(joystick.clone());
        }

        for step in &self.script.steps {
            if !Self::sleep_while_alive(hooks, Duration::from_millis(step.delay_ms)) {
                debug!("Replay stopped mid-script");
                return Ok(());
            }
            if let Err(e) = self.apply(&step.event, &mut attached, hooks) {
                warn!("Skipping script step: {}", e);
            }
        }
        debug!("Script finished");

        if !self.script.hold && self.injected.is_none() {
            return Ok(());
        }

        while hooks.is_alive() {
            match &self.injected {
                Some(rx) => match rx.recv_timeout(IDLE_POLL) {
                    Ok(event) => {
                        if let Err(e) = self.apply(&event, &mut attached, hooks) {
                            warn!("Skipping injected event: {}", e);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) if !self.script.hold => break,
                    Err(RecvTimeoutError::Disconnected) => thread::sleep(IDLE_POLL),
                },
                None => thread::sleep(IDLE_POLL),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::KeyCounts;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const SCRIPT: &str = r#"
hold = false

[[device]]
id = 0
name = "Replay Pad"
counts = { axes = 2, buttons = 4, hats = 1 }

[[step]]
event = { kind = "key", device = 0, keytype = "Axis", number = 0, value = 0.5 }

[[step]]
delay_ms = 5
event = { kind = "key", device = 0, keytype = "Button", number = 2, value = 1 }

[[step]]
event = { kind = "key", device = 3, keytype = "Button", number = 0, value = 1 }

[[step]]
event = { kind = "remove", id = 0 }
"#;

    fn recording_hooks() -> (LoopHooks, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (add_log, remove_log, key_log) = (log.clone(), log.clone(), log.clone());
        let hooks = LoopHooks {
            on_add: Box::new(move |d: Arc<Joystick>| {
                add_log.lock().unwrap().push(format!("add {}", d.name()))
            }),
            on_remove: Box::new(move |d: Arc<Joystick>| {
                remove_log.lock().unwrap().push(format!("remove {}", d.name()))
            }),
            on_key: Box::new(move |k: Key| {
                key_log.lock().unwrap().push(format!("{} = {}", k, k.scalar()))
            }),
            is_alive: Box::new(|| true),
        };
        (hooks, log)
    }

    #[test]
    fn test_parse_script() {
        let script = Script::parse(SCRIPT).unwrap();
        assert!(!script.hold);
        assert_eq!(script.devices[0].counts, KeyCounts::new(2, 4, 1, 0));
        assert_eq!(script.steps.len(), 4);
        assert_eq!(script.steps[1].delay_ms, 5);
        assert_eq!(
            script.steps[1].event,
            ScriptEvent::key(0, KeyType::Button, 2, 1.0)
        );
        assert!(matches!(Script::parse("step = 3"), Err(InputError::ConfigError(_))));
    }

    #[test]
    fn test_replay_skips_bad_steps() {
        let backend = ScriptedBackend::new(Script::parse(SCRIPT).unwrap());
        let (hooks, log) = recording_hooks();
        backend.run_event_loop(&hooks).unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "add Replay Pad".to_string(),
                "Axis 0 = 0.5".to_string(),
                "Button 2 = 1".to_string(),
                "remove Replay Pad".to_string(),
            ]
        );
    }

    #[test]
    fn test_list_devices() {
        let backend = ScriptedBackend::new(Script::parse(SCRIPT).unwrap());
        let devices = backend.list_devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert!(devices[0].is_available());
        assert_eq!(devices[0].num_buttons(), 4);
    }

    #[test]
    fn test_injected_events_until_stopped() {
        let script =
            Script::default().device(DeviceInfo::new(1, "Pad", KeyCounts::new(0, 2, 0, 0)));
        let (backend, handle) = ScriptedBackend::with_handle(script);

        let keys = Arc::new(AtomicUsize::new(0));
        let counter = keys.clone();
        let hooks = LoopHooks {
            on_add: Box::new(|_| {}),
            on_remove: Box::new(|_| {}),
            on_key: Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            is_alive: {
                let keys = keys.clone();
                Box::new(move || keys.load(Ordering::SeqCst) < 2)
            },
        };

        handle.key(1, &Key::button(0, true)).unwrap();
        handle.key(1, &Key::button(0, false)).unwrap();
        backend.run_event_loop(&hooks).unwrap();
        assert_eq!(keys.load(Ordering::SeqCst), 2);
    }
}
