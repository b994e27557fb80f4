use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use gilrs::{Axis, Button, Event, EventType, GamepadId, Gilrs};
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, LoopHooks};
use crate::device::{
    DeviceHandle, DeviceInfo, HatValue, Joystick, Key, KeyCounts, KeyType, KeyValue,
};
use crate::error::InputError;
use crate::stash::Stash;

// Button numbering, SDL game controller order
const BUTTONS: [Button; 15] = [
    Button::South,
    Button::East,
    Button::West,
    Button::North,
    Button::Select,
    Button::Mode,
    Button::Start,
    Button::LeftThumb,
    Button::RightThumb,
    Button::LeftTrigger,
    Button::RightTrigger,
    Button::LeftTrigger2,
    Button::RightTrigger2,
    Button::C,
    Button::Z,
];

const AXES: [Axis; 6] = [
    Axis::LeftStickX,
    Axis::LeftStickY,
    Axis::RightStickX,
    Axis::RightStickY,
    Axis::LeftZ,
    Axis::RightZ,
];

#[derive(Debug, Clone)]
pub struct GilrsSettings {
    /// Longest a single wait for a native event may block.
    pub poll_timeout: Duration,
}

impl Default for GilrsSettings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(20),
        }
    }
}

#[derive(Debug)]
struct GilrsHandle(u64);

impl DeviceHandle for GilrsHandle {
    fn handle_id(&self) -> u64 {
        self.0
    }
}

/// Native gamepads through `gilrs`.
///
/// The `Gilrs` context is created on the thread that runs the loop.
#[derive(Debug, Default)]
pub struct GilrsBackend {
    settings: GilrsSettings,
}

impl GilrsBackend {
    pub fn new() -> Result<Self, InputError> {
        Ok(Self::with_settings(GilrsSettings::default()))
    }

    pub fn with_settings(settings: GilrsSettings) -> Self {
        Self { settings }
    }

    fn open_context() -> Result<Gilrs, InputError> {
        match Gilrs::new() {
            Ok(gilrs) => {
                debug!("Initialized gilrs");
                Ok(gilrs)
            }
            Err(e) => {
                error!("Failed to initialize gilrs: {}", e);
                Err(InputError::BackendTransient(e.to_string()))
            }
        }
    }

    fn counts() -> KeyCounts {
        KeyCounts::new(AXES.len(), BUTTONS.len(), 1, 0)
    }

    fn open(gilrs: &Gilrs, id: GamepadId) -> Arc<Joystick> {
        let index = usize::from(id);
        let name = gilrs.gamepad(id).name().to_string();
        Joystick::new(
            DeviceInfo::new(index as i64, name, Self::counts()),
            Some(Box::new(GilrsHandle(index as u64))),
        )
    }
}

fn dpad_bits(button: Button) -> Option<u8> {
    match button {
        Button::DPadUp => Some(HatValue::Up.bits()),
        Button::DPadRight => Some(HatValue::Right.bits()),
        Button::DPadDown => Some(HatValue::Down.bits()),
        Button::DPadLeft => Some(HatValue::Left.bits()),
        _ => None,
    }
}

/// Per-gamepad D-pad state, folded into hat 0.
#[derive(Debug, Default)]
struct HatState {
    bits: HashMap<GamepadId, u8>,
}

impl HatState {
    fn update(&mut self, id: GamepadId, flag: u8, pressed: bool) -> u8 {
        let bits = self.bits.entry(id).or_insert(0);
        if pressed {
            *bits |= flag;
        } else {
            *bits &= !flag;
        }
        *bits
    }
}

fn button_key(hats: &mut HatState, id: GamepadId, button: Button, pressed: bool) -> Option<Key> {
    if let Some(flag) = dpad_bits(button) {
        let bits = hats.update(id, flag, pressed);
        return Some(Key::new(KeyType::Hat, 0, Some(KeyValue::Scalar(f64::from(bits)))));
    }
    BUTTONS
        .iter()
        .position(|b| *b == button)
        .map(|number| Key::button(number, pressed))
}

fn axis_key(axis: Axis, value: f32) -> Option<Key> {
    AXES.iter()
        .position(|a| *a == axis)
        .map(|number| Key::axis(number, f64::from(value)))
}

impl Backend for GilrsBackend {
    fn name(&self) -> &str {
        "gilrs"
    }

    fn list_devices(&self) -> Result<Stash<Arc<Joystick>>, InputError> {
        let gilrs = Self::open_context()?;
        Ok(gilrs
            .gamepads()
            .filter(|(_, gamepad)| gamepad.is_connected())
            .map(|(id, _)| Self::open(&gilrs, id))
            .collect())
    }

    fn run_event_loop(&self, hooks: &LoopHooks) -> Result<(), InputError> {
        let mut gilrs = Self::open_context()?;
        let mut attached: Stash<Arc<Joystick>> = Stash::new();
        let mut hats = HatState::default();

        let present: Vec<GamepadId> = gilrs.gamepads().map(|(id, _)| id).collect();
        for id in present {
            let joystick = Self::open(&gilrs, id);
            info!("Found gamepad {} ({})", joystick.name(), id);
            attached.push(joystick.clone());
            hooks.add(joystick);
        }

        info!("Starting gilrs event loop");
        while hooks.is_alive() {
            let timeout = Some(self.settings.poll_timeout);
            let Some(Event { id, event, .. }) = gilrs.next_event_blocking(timeout) else {
                continue;
            };
            let index = usize::from(id) as i64;

            let key = match event {
                EventType::Connected => {
                    let joystick = Self::open(&gilrs, id);
                    attached.remove(&index).ok();
                    attached.push(joystick.clone());
                    hooks.add(joystick);
                    None
                }
                EventType::Disconnected => {
                    match attached.remove(&index) {
                        Ok(joystick) => hooks.remove(joystick),
                        Err(_) => warn!("Disconnect from unknown gamepad {}", id),
                    }
                    None
                }
                EventType::ButtonPressed(button, _) => button_key(&mut hats, id, button, true),
                EventType::ButtonReleased(button, _) => button_key(&mut hats, id, button, false),
                EventType::AxisChanged(axis, value, _) => axis_key(axis, value),
                other => {
                    debug!("Ignoring gilrs event {:?}", other);
                    None
                }
            };

            if let Some(key) = key {
                match attached.get(&index) {
                    Ok(joystick) => hooks.key(key.on(joystick)),
                    Err(_) => debug!("Event {} from unregistered gamepad {}", key, id),
                }
            }
        }
        info!("gilrs event loop stopped");
        Ok(())
    }
}
