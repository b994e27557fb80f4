//! Canonical device and key model shared by every backend.
//!
//! ```text
//! Joystick ──owns──► Key collections (axis, button, hat, ball)
//!    ▲                     │
//!    └──── DeviceLink ◄────┘  (weak, identity only)
//! ```

pub mod joystick;
pub mod key;

pub use joystick::{
    DeviceHandle, DeviceIdent, DeviceInfo, DeviceLink, DeviceSelector, Joystick, KeyCounts,
    DEFAULT_DEADBAND,
};
pub use key::{hat_range_from_bits, HatValue, Key, KeyType, KeyValue};
