//! Canonical key model: one control reading on one device.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::device::joystick::{DeviceLink, Joystick};
use crate::error::InputError;

/// Kind of control a key reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    Axis,
    Button,
    Hat,
    Ball,
}

impl KeyType {
    pub const ALL: [KeyType; 4] = [KeyType::Axis, KeyType::Button, KeyType::Hat, KeyType::Ball];

    pub fn as_str(self) -> &'static str {
        match self {
            KeyType::Axis => "Axis",
            KeyType::Button => "Button",
            KeyType::Hat => "Hat",
            KeyType::Ball => "Ball",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KeyType::ALL
            .into_iter()
            .find(|kt| kt.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| InputError::InvalidKeyName(format!("unknown key type '{}'", s)))
    }
}

/// Hat directions. The discriminants are bit flags: Up=1, Right=2, Down=4, Left=8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum HatValue {
    Centered = 0,
    Up = 1,
    Right = 2,
    UpRight = 3,
    Down = 4,
    DownRight = 6,
    Left = 8,
    UpLeft = 9,
    DownLeft = 12,
}

impl HatValue {
    pub const ALL: [HatValue; 9] = [
        HatValue::Centered,
        HatValue::Up,
        HatValue::Right,
        HatValue::UpRight,
        HatValue::Down,
        HatValue::DownRight,
        HatValue::Left,
        HatValue::UpLeft,
        HatValue::DownLeft,
    ];

    pub fn bits(self) -> u8 {
        self as u8
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        HatValue::ALL.into_iter().find(|hat| hat.bits() == bits)
    }

    pub fn name(self) -> &'static str {
        match self {
            HatValue::Centered => "Centered",
            HatValue::Up => "Up",
            HatValue::Right => "Right",
            HatValue::UpRight => "Up Right",
            HatValue::Down => "Down",
            HatValue::DownRight => "Down Right",
            HatValue::Left => "Left",
            HatValue::UpLeft => "Up Left",
            HatValue::DownLeft => "Down Left",
        }
    }

    /// Accepts both word orders ("Up Left" and "Left Up").
    pub fn from_name(name: &str) -> Option<Self> {
        let words: Vec<String> = name
            .split_whitespace()
            .map(|w| w.to_ascii_lowercase())
            .collect();
        HatValue::ALL.into_iter().find(|hat| {
            let mut expected: Vec<String> = hat
                .name()
                .split_whitespace()
                .map(|w| w.to_ascii_lowercase())
                .collect();
            let mut given = words.clone();
            expected.sort();
            given.sort();
            expected == given
        })
    }

    /// (x, y) with right and up positive.
    pub fn as_range(self) -> (i8, i8) {
        hat_range_from_bits(self.bits())
    }

    pub fn from_range(range: (i8, i8)) -> Option<Self> {
        HatValue::ALL.into_iter().find(|hat| hat.as_range() == range)
    }
}

impl fmt::Display for HatValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Converts arbitrary hat bits to an (x, y) pair. Opposing flags cancel out.
pub fn hat_range_from_bits(bits: u8) -> (i8, i8) {
    let flag = |mask: u8| i8::from(bits & mask != 0);
    let x = flag(HatValue::Right as u8) - flag(HatValue::Left as u8);
    let y = flag(HatValue::Up as u8) - flag(HatValue::Down as u8);
    (x, y)
}

/// Raw reading of a control.
///
/// Axis values are -1..1, buttons 0/1, hats carry [`HatValue`] bits and
/// balls report a relative motion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    Scalar(f64),
    Motion(f64, f64),
}

impl KeyValue {
    pub const ZERO: KeyValue = KeyValue::Scalar(0.0);

    /// Scalar view. Ball motion collapses to its magnitude.
    pub fn scalar(self) -> f64 {
        match self {
            KeyValue::Scalar(v) => v,
            KeyValue::Motion(dx, dy) => dx.hypot(dy),
        }
    }

    pub fn is_zero(self) -> bool {
        match self {
            KeyValue::Scalar(v) => v == 0.0,
            KeyValue::Motion(dx, dy) => dx == 0.0 && dy == 0.0,
        }
    }
}

impl Default for KeyValue {
    fn default() -> Self {
        KeyValue::ZERO
    }
}

impl From<f64> for KeyValue {
    fn from(value: f64) -> Self {
        KeyValue::Scalar(value)
    }
}

impl From<f32> for KeyValue {
    fn from(value: f32) -> Self {
        KeyValue::Scalar(f64::from(value))
    }
}

impl From<i32> for KeyValue {
    fn from(value: i32) -> Self {
        KeyValue::Scalar(f64::from(value))
    }
}

impl From<bool> for KeyValue {
    fn from(pressed: bool) -> Self {
        KeyValue::Scalar(if pressed { 1.0 } else { 0.0 })
    }
}

impl From<HatValue> for KeyValue {
    fn from(hat: HatValue) -> Self {
        KeyValue::Scalar(f64::from(hat.bits()))
    }
}

impl From<(f64, f64)> for KeyValue {
    fn from((dx, dy): (f64, f64)) -> Self {
        KeyValue::Motion(dx, dy)
    }
}

/// One control reading.
///
/// Equality is relaxed: two keys are equal when keytype and number match and
/// either side has no device or both devices compare equal. The hash only
/// covers keytype and number, so keys of the same control on different
/// devices collide; registries look keys up with [`crate::stash::Stash`]
/// scans instead of hashing them.
#[derive(Debug, Clone)]
pub struct Key {
    pub keytype: KeyType,
    pub number: usize,
    raw_value: Option<KeyValue>,
    device: Option<DeviceLink>,
    pub is_repeat: bool,
    pub is_override: bool,
}

impl Key {
    pub fn new(keytype: KeyType, number: usize, value: Option<KeyValue>) -> Self {
        Self {
            keytype,
            number,
            raw_value: value,
            device: None,
            is_repeat: false,
            is_override: false,
        }
    }

    pub fn axis(number: usize, value: f64) -> Self {
        Self::new(KeyType::Axis, number, Some(KeyValue::Scalar(value)))
    }

    pub fn button(number: usize, pressed: bool) -> Self {
        Self::new(KeyType::Button, number, Some(pressed.into()))
    }

    pub fn hat(number: usize, hat: HatValue) -> Self {
        Self::new(KeyType::Hat, number, Some(hat.into()))
    }

    pub fn ball(number: usize, dx: f64, dy: f64) -> Self {
        Self::new(KeyType::Ball, number, Some(KeyValue::Motion(dx, dy)))
    }

    pub fn with_device(mut self, link: DeviceLink) -> Self {
        self.device = Some(link);
        self
    }

    pub fn on(self, joystick: &Arc<Joystick>) -> Self {
        self.with_device(DeviceLink::to(joystick))
    }

    pub fn device(&self) -> Option<&DeviceLink> {
        self.device.as_ref()
    }

    pub fn set_device(&mut self, link: Option<DeviceLink>) {
        self.device = link;
    }

    /// The owning device, if it is still alive.
    pub fn joystick(&self) -> Option<Arc<Joystick>> {
        self.device.as_ref().and_then(DeviceLink::upgrade)
    }

    pub fn raw_value(&self) -> Option<KeyValue> {
        self.raw_value
    }

    /// The reading, with an absent value reported as zero.
    pub fn value(&self) -> KeyValue {
        self.raw_value.unwrap_or_default()
    }

    pub fn scalar(&self) -> f64 {
        self.value().scalar()
    }

    /// Value limited to 1 at the top, so hats read like buttons.
    pub fn proper_value(&self) -> f64 {
        self.scalar().min(1.0)
    }

    pub fn is_active(&self) -> bool {
        !self.value().is_zero()
    }

    pub fn set_value(&mut self, value: impl Into<KeyValue>) {
        self.raw_value = Some(value.into());
    }

    pub fn set_raw_value(&mut self, value: Option<KeyValue>) {
        self.raw_value = value;
    }

    fn hat_bits(&self) -> Result<u8, InputError> {
        if self.keytype != KeyType::Hat {
            return Err(InputError::InvalidOperation(format!(
                "{} {} is not a hat key",
                self.keytype, self.number
            )));
        }
        Ok(self.scalar().clamp(0.0, 15.0) as u8)
    }

    pub fn hat_value(&self) -> Result<Option<HatValue>, InputError> {
        self.hat_bits().map(HatValue::from_bits)
    }

    /// Hat name for the value; unknown flag combinations render as the number.
    pub fn hat_name(&self) -> Result<String, InputError> {
        let bits = self.hat_bits()?;
        Ok(HatValue::from_bits(bits)
            .map(|hat| hat.name().to_string())
            .unwrap_or_else(|| bits.to_string()))
    }

    /// (right/left, up/down) as (1/-1, 1/-1).
    pub fn hat_range(&self) -> Result<(i8, i8), InputError> {
        self.hat_bits().map(hat_range_from_bits)
    }

    /// Refreshes the value from `joystick`, or from the key's own device.
    ///
    /// Best effort: a missing device or control leaves the value untouched.
    pub fn update_value(&mut self, joystick: Option<&Joystick>) {
        let value = match joystick {
            Some(joystick) => joystick.get_key(self).ok().map(|k| k.raw_value),
            None => self
                .joystick()
                .and_then(|joystick| joystick.get_key(self).ok().map(|k| k.raw_value)),
        };
        if let Some(value) = value {
            self.raw_value = value;
        }
    }

    /// Copy of this key that is never flagged as a repeat.
    pub fn copy(&self) -> Key {
        Key {
            is_repeat: false,
            ..self.clone()
        }
    }

    /// `"{device}:{keytype} {number}"`, or `"{keytype} {number}"` when unattached.
    pub fn repeat_hash(&self) -> String {
        match &self.device {
            Some(link) => format!("{}:{} {}", link, self.keytype, self.number),
            None => format!("{} {}", self.keytype, self.number),
        }
    }

    /// `"Axis 0"`, `"-Axis 1"` for negative values, `"Hat 0 [Up Left]"` for hats.
    pub fn keyname(&self) -> String {
        let prefix = if self.scalar() < 0.0 { "-" } else { "" };
        match self.hat_name() {
            Ok(name) => format!("{}{} {} [{}]", prefix, self.keytype, self.number, name),
            Err(_) => format!("{}{} {}", prefix, self.keytype, self.number),
        }
    }

    /// Parses the forms produced by [`Key::keyname`]. A `"device:"` prefix is ignored.
    pub fn from_keyname(keyname: &str) -> Result<Key, InputError> {
        let invalid = || InputError::InvalidKeyName(keyname.to_string());

        let name = match keyname.split_once(':') {
            Some((_, rest)) => rest.trim(),
            None => keyname.trim(),
        };
        let (keytype, rest) = name.split_once(' ').ok_or_else(invalid)?;

        let mut value = None;
        let keytype = match keytype.strip_prefix('-') {
            Some(stripped) => {
                value = Some(KeyValue::Scalar(-1.0));
                stripped.trim()
            }
            None => keytype,
        };
        let keytype: KeyType = keytype.parse().map_err(|_| invalid())?;

        let number = match rest.split_once('[') {
            Some((number, hat_name)) => {
                let hat_name = hat_name.trim_end().trim_end_matches(']').trim();
                let hat = match HatValue::from_name(hat_name) {
                    Some(hat) => hat,
                    None => hat_name
                        .parse::<u8>()
                        .ok()
                        .and_then(HatValue::from_bits)
                        .ok_or_else(invalid)?,
                };
                value = Some(hat.into());
                number.trim()
            }
            None => rest.trim(),
        };
        let number = number.parse::<usize>().map_err(|_| invalid())?;

        Ok(Key::new(keytype, number, value))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        if self.keytype != other.keytype || self.number != other.number {
            return false;
        }
        match (&self.device, &other.device) {
            (Some(mine), Some(theirs)) => mine == theirs,
            _ => true,
        }
    }
}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.keytype.hash(state);
        self.number.hash(state);
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.keyname())
    }
}

impl crate::stash::StashKey<Key> for Key {
    fn matches(&self, item: &Key) -> bool {
        item == self
    }
}
