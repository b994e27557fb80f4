//! Gamepad event normalization.
//!
//! Backends report devices and raw key readings; an [`EventManager`] keeps
//! the canonical device state, coalesces bursts of updates and delivers them
//! to user callbacks on a fixed period, with auto-repeat for held buttons
//! and hats.

pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod manager;
pub mod relay;
pub mod repeater;
pub mod stash;
pub mod util;
pub mod wire;

pub use backend::{Backend, LoopHooks, Script, ScriptEvent, ScriptedBackend};
pub use config::Config;
pub use device::{
    DeviceIdent, DeviceInfo, DeviceLink, DeviceSelector, HatValue, Joystick, Key, KeyCounts,
    KeyType, KeyValue,
};
pub use error::InputError;
pub use manager::{
    EventCore, EventManager, EventManagerBuilder, KeyQuery, ManagerSettings,
    ProcessEventManager, RelayCommand, ThreadEventManager,
};
pub use repeater::{RepeatPolicy, Repeater, RepeaterSettings};
pub use stash::{Stash, StashKey};
