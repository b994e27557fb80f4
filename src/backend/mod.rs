//! Sources of raw device events.
//!
//! A backend owns the native polling loop. It reports attached devices, key
//! readings and removals through [`LoopHooks`] and returns once
//! `is_alive()` turns false. Backends that block on native reads should wait
//! with a timeout so the manager's cooperative stop can take effect.

#[cfg(feature = "gilrs")]
pub mod gilrs;
pub mod scripted;

use std::fmt;
use std::sync::Arc;

use crate::device::{Joystick, Key};
use crate::error::InputError;
use crate::stash::Stash;

#[cfg(feature = "gilrs")]
pub use self::gilrs::GilrsBackend;
pub use scripted::{Script, ScriptEvent, ScriptHandle, ScriptStep, ScriptedBackend};

/// Callbacks a backend loop reports through.
pub struct LoopHooks {
    pub on_add: Box<dyn Fn(Arc<Joystick>) + Send + Sync>,
    pub on_remove: Box<dyn Fn(Arc<Joystick>) + Send + Sync>,
    pub on_key: Box<dyn Fn(Key) + Send + Sync>,
    pub is_alive: Box<dyn Fn() -> bool + Send + Sync>,
}

impl LoopHooks {
    pub fn add(&self, device: Arc<Joystick>) {
        (self.on_add)(device);
    }

    pub fn remove(&self, device: Arc<Joystick>) {
        (self.on_remove)(device);
    }

    pub fn key(&self, key: Key) {
        (self.on_key)(key);
    }

    pub fn is_alive(&self) -> bool {
        (self.is_alive)()
    }
}

impl fmt::Debug for LoopHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHooks").finish_non_exhaustive()
    }
}

pub trait Backend: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Devices currently attached, in the order the backend enumerates them.
    fn list_devices(&self) -> Result<Stash<Arc<Joystick>>, InputError> {
        Ok(Stash::new())
    }

    /// Runs until `hooks.is_alive()` returns false.
    fn run_event_loop(&self, hooks: &LoopHooks) -> Result<(), InputError>;
}

/// Backend made from a plain event loop function.
pub struct FnBackend<F> {
    name: String,
    event_loop: F,
}

impl<F> Backend for FnBackend<F>
where
    F: Fn(&LoopHooks) -> Result<(), InputError> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run_event_loop(&self, hooks: &LoopHooks) -> Result<(), InputError> {
        (self.event_loop)(hooks)
    }
}

pub fn from_fn<F>(name: impl Into<String>, event_loop: F) -> FnBackend<F>
where
    F: Fn(&LoopHooks) -> Result<(), InputError> + Send + Sync + 'static,
{
    FnBackend {
        name: name.into(),
        event_loop,
    }
}

/// The backend selected at build time, used when no script is given.
pub fn native() -> Result<Arc<dyn Backend>, InputError> {
    #[cfg(feature = "gilrs")]
    {
        Ok(Arc::new(GilrsBackend::new()?))
    }
    #[cfg(not(feature = "gilrs"))]
    {
        Err(InputError::ConfigError(
            "no native backend compiled in; rebuild with --features gilrs or pass --script"
                .to_string(),
        ))
    }
}
