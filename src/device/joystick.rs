//! Device model: one physical controller and the current state of its keys.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, RwLock, Weak};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::device::key::{Key, KeyType, KeyValue};
use crate::error::InputError;
use crate::stash::{Stash, StashKey};
use crate::util::{self, lock, read, write};

pub const DEFAULT_DEADBAND: f64 = 0.2;

/// Backend-specific handle a [`Joystick`] owns exclusively.
pub trait DeviceHandle: Send + Sync + fmt::Debug {
    /// Identity of the underlying native object.
    fn handle_id(&self) -> u64;

    fn is_attached(&self) -> bool {
        true
    }

    /// Releases the native resource. Called at most once.
    fn close(&self) {}
}

/// Number of controls of each type a device reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyCounts {
    pub axes: usize,
    pub buttons: usize,
    pub hats: usize,
    pub balls: usize,
}

impl KeyCounts {
    pub fn new(axes: usize, buttons: usize, hats: usize, balls: usize) -> Self {
        Self {
            axes,
            buttons,
            hats,
            balls,
        }
    }

    pub fn count(&self, keytype: KeyType) -> usize {
        match keytype {
            KeyType::Axis => self.axes,
            KeyType::Button => self.buttons,
            KeyType::Hat => self.hats,
            KeyType::Ball => self.balls,
        }
    }
}

/// Identifier and name of a device. Two idents match when either field matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdent {
    pub id: i64,
    pub name: String,
}

impl DeviceIdent {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    pub fn matches(&self, other: &DeviceIdent) -> bool {
        self.id == other.id || self.name == other.name
    }
}

impl fmt::Display for DeviceIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Description a backend reports for a newly attached device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub counts: KeyCounts,
}

impl DeviceInfo {
    pub fn new(id: i64, name: impl Into<String>, counts: KeyCounts) -> Self {
        Self {
            id,
            name: name.into(),
            counts,
        }
    }

    pub fn ident(&self) -> DeviceIdent {
        DeviceIdent::new(self.id, self.name.clone())
    }
}

/// Non-owning reference from a key back to its device.
///
/// Carries the device identity so equality keeps working after the device
/// itself is gone.
#[derive(Debug, Clone)]
pub struct DeviceLink {
    ident: DeviceIdent,
    joystick: Weak<Joystick>,
}

impl DeviceLink {
    pub fn to(joystick: &Arc<Joystick>) -> Self {
        Self {
            ident: joystick.ident(),
            joystick: Arc::downgrade(joystick),
        }
    }

    /// Link that only knows the identity, e.g. after crossing a process boundary.
    pub fn detached(ident: DeviceIdent) -> Self {
        Self {
            ident,
            joystick: Weak::new(),
        }
    }

    pub fn ident(&self) -> &DeviceIdent {
        &self.ident
    }

    pub fn upgrade(&self) -> Option<Arc<Joystick>> {
        self.joystick.upgrade()
    }

    fn points_to(&self, joystick: &Joystick) -> bool {
        self.joystick.strong_count() > 0 && std::ptr::eq(self.joystick.as_ptr(), joystick)
    }
}

impl PartialEq for DeviceLink {
    fn eq(&self, other: &Self) -> bool {
        self.ident.matches(&other.ident)
            || (self.joystick.strong_count() > 0 && Weak::ptr_eq(&self.joystick, &other.joystick))
    }
}

impl fmt::Display for DeviceLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.ident, f)
    }
}

/// The interchangeable ways callers name a device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceSelector {
    Id(i64),
    Name(String),
    Ident(DeviceIdent),
}

impl DeviceSelector {
    pub fn matches_ident(&self, ident: &DeviceIdent) -> bool {
        match self {
            DeviceSelector::Id(id) => ident.id == *id,
            DeviceSelector::Name(name) => ident.name == *name,
            DeviceSelector::Ident(wanted) => wanted.matches(ident),
        }
    }
}

impl From<i64> for DeviceSelector {
    fn from(id: i64) -> Self {
        DeviceSelector::Id(id)
    }
}

impl From<&str> for DeviceSelector {
    fn from(name: &str) -> Self {
        DeviceSelector::Name(name.to_string())
    }
}

impl From<String> for DeviceSelector {
    fn from(name: String) -> Self {
        DeviceSelector::Name(name)
    }
}

impl From<&Joystick> for DeviceSelector {
    fn from(joystick: &Joystick) -> Self {
        DeviceSelector::Ident(joystick.ident())
    }
}

impl From<&Arc<Joystick>> for DeviceSelector {
    fn from(joystick: &Arc<Joystick>) -> Self {
        DeviceSelector::Ident(joystick.ident())
    }
}

#[derive(Debug, Default)]
struct KeyTable {
    axis: Stash<Key>,
    button: Stash<Key>,
    hat: Stash<Key>,
    ball: Stash<Key>,
}

impl KeyTable {
    fn build(counts: &KeyCounts, link: &DeviceLink) -> Self {
        let make = |keytype: KeyType| -> Stash<Key> {
            (0..counts.count(keytype))
                .map(|number| Key::new(keytype, number, None).with_device(link.clone()))
                .collect()
        };
        Self {
            axis: make(KeyType::Axis),
            button: make(KeyType::Button),
            hat: make(KeyType::Hat),
            ball: make(KeyType::Ball),
        }
    }

    fn collection(&self, keytype: KeyType) -> &Stash<Key> {
        match keytype {
            KeyType::Axis => &self.axis,
            KeyType::Button => &self.button,
            KeyType::Hat => &self.hat,
            KeyType::Ball => &self.ball,
        }
    }

    fn collection_mut(&mut self, keytype: KeyType) -> &mut Stash<Key> {
        match keytype {
            KeyType::Axis => &mut self.axis,
            KeyType::Button => &mut self.button,
            KeyType::Hat => &mut self.hat,
            KeyType::Ball => &mut self.ball,
        }
    }
}

/// One physical controller.
///
/// Equality is deliberately loose: devices are equal when their names match,
/// their identifiers match, or they wrap the same backend handle.
pub struct Joystick {
    info: DeviceInfo,
    handle: Mutex<Option<Box<dyn DeviceHandle>>>,
    keys: RwLock<KeyTable>,
    deadband: RwLock<f64>,
    this: Weak<Joystick>,
}

impl Joystick {
    pub fn new(info: DeviceInfo, handle: Option<Box<dyn DeviceHandle>>) -> Arc<Self> {
        Arc::new_cyclic(|this| {
            let link = DeviceLink {
                ident: info.ident(),
                joystick: this.clone(),
            };
            Joystick {
                keys: RwLock::new(KeyTable::build(&info.counts, &link)),
                info,
                handle: Mutex::new(handle),
                deadband: RwLock::new(DEFAULT_DEADBAND),
                this: this.clone(),
            }
        })
    }

    pub fn id(&self) -> i64 {
        self.info.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn ident(&self) -> DeviceIdent {
        self.info.ident()
    }

    pub fn counts(&self) -> KeyCounts {
        self.info.counts
    }

    pub fn count(&self, keytype: KeyType) -> usize {
        self.info.counts.count(keytype)
    }

    pub fn num_axes(&self) -> usize {
        self.info.counts.axes
    }

    pub fn num_buttons(&self) -> usize {
        self.info.counts.buttons
    }

    pub fn num_hats(&self) -> usize {
        self.info.counts.hats
    }

    pub fn num_balls(&self) -> usize {
        self.info.counts.balls
    }

    pub fn link(&self) -> DeviceLink {
        DeviceLink {
            ident: self.ident(),
            joystick: self.this.clone(),
        }
    }

    /// Resets every key to match the reported counts, with no values.
    pub fn init_keys(&self) {
        let table = KeyTable::build(&self.info.counts, &self.link());
        *write(&self.keys) = table;
    }

    /// Snapshot of all keys: axes, buttons, hats, then balls.
    pub fn keys(&self) -> Vec<Key> {
        let table = read(&self.keys);
        KeyType::ALL
            .into_iter()
            .flat_map(|keytype| table.collection(keytype).iter().cloned().collect::<Vec<_>>())
            .collect()
    }

    pub fn keys_of(&self, keytype: KeyType) -> Vec<Key> {
        read(&self.keys).collection(keytype).iter().cloned().collect()
    }

    /// Current state of the control `key` refers to.
    pub fn get_key(&self, key: &Key) -> Result<Key, InputError> {
        read(&self.keys)
            .collection(key.keytype)
            .get(&key.number)
            .cloned()
            .map_err(|_| self.missing(key.keytype, key.number))
    }

    pub fn get_key_value(&self, key: &Key) -> Result<KeyValue, InputError> {
        self.get_key(key).map(|k| k.value())
    }

    /// Commits the value carried by `key` onto this device.
    pub fn update_key(&self, key: &Key) -> Result<(), InputError> {
        let mut table = write(&self.keys);
        let stored = table
            .collection_mut(key.keytype)
            .get_mut(&key.number)
            .map_err(|_| self.missing(key.keytype, key.number))?;
        stored.set_raw_value(key.raw_value());
        Ok(())
    }

    fn value_of(&self, keytype: KeyType, number: usize) -> Result<KeyValue, InputError> {
        self.get_key(&Key::new(keytype, number, None))
            .map(|k| k.value())
    }

    pub fn get_axis(&self, number: usize) -> Result<f64, InputError> {
        self.value_of(KeyType::Axis, number).map(KeyValue::scalar)
    }

    /// Axis value with this device's deadband applied.
    pub fn get_axis_deadbanded(&self, number: usize) -> Result<f64, InputError> {
        let value = self.get_axis(number)?;
        Ok(util::deadband(value, self.deadband(), 1.0))
    }

    pub fn get_button(&self, number: usize) -> Result<bool, InputError> {
        self.value_of(KeyType::Button, number).map(|v| !v.is_zero())
    }

    /// Raw hat bits, see [`crate::device::key::HatValue`].
    pub fn get_hat(&self, number: usize) -> Result<u8, InputError> {
        self.value_of(KeyType::Hat, number)
            .map(|v| v.scalar().clamp(0.0, 15.0) as u8)
    }

    pub fn get_ball(&self, number: usize) -> Result<(f64, f64), InputError> {
        self.value_of(KeyType::Ball, number).map(|v| match v {
            KeyValue::Motion(dx, dy) => (dx, dy),
            KeyValue::Scalar(v) => (v, 0.0),
        })
    }

    pub fn deadband(&self) -> f64 {
        *read(&self.deadband)
    }

    pub fn set_deadband(&self, value: f64) {
        *write(&self.deadband) = value;
    }

    pub fn handle_id(&self) -> Option<u64> {
        lock(&self.handle).as_ref().map(|handle| handle.handle_id())
    }

    /// Whether the backend handle is still open and attached.
    pub fn is_available(&self) -> bool {
        lock(&self.handle)
            .as_ref()
            .is_some_and(|handle| handle.is_attached())
    }

    /// Releases the backend handle. The device stays readable afterwards.
    pub fn close(&self) {
        if let Some(handle) = lock(&self.handle).take() {
            debug!("Closing device {} ({})", self.info.name, self.info.id);
            handle.close();
        }
    }

    fn missing(&self, keytype: KeyType, number: usize) -> InputError {
        InputError::NotFound(format!(
            "{} {} on '{}' (has {})",
            keytype,
            number,
            self.info.name,
            self.count(keytype)
        ))
    }
}

impl PartialEq for Joystick {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other)
            || self.info.name == other.info.name
            || self.info.id == other.info.id
        {
            return true;
        }
        match (self.handle_id(), other.handle_id()) {
            (Some(mine), Some(theirs)) => mine == theirs,
            _ => false,
        }
    }
}

impl Hash for Joystick {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.info.id.hash(state);
        self.info.name.hash(state);
    }
}

impl fmt::Debug for Joystick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Joystick")
            .field("id", &self.info.id)
            .field("name", &self.info.name)
            .field("counts", &self.info.counts)
            .field("handle", &self.handle_id())
            .finish()
    }
}

impl fmt::Display for Joystick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.info.name)
    }
}

impl StashKey<Arc<Joystick>> for i64 {
    fn matches(&self, item: &Arc<Joystick>) -> bool {
        item.id() == *self
    }
}

impl StashKey<Arc<Joystick>> for str {
    fn matches(&self, item: &Arc<Joystick>) -> bool {
        item.name() == self
    }
}

impl StashKey<Arc<Joystick>> for Joystick {
    fn matches(&self, item: &Arc<Joystick>) -> bool {
        item.as_ref() == self
    }
}

impl StashKey<Arc<Joystick>> for Arc<Joystick> {
    fn matches(&self, item: &Arc<Joystick>) -> bool {
        item.as_ref() == self.as_ref()
    }
}

impl StashKey<Arc<Joystick>> for DeviceIdent {
    fn matches(&self, item: &Arc<Joystick>) -> bool {
        self.matches(&item.ident())
    }
}

impl StashKey<Arc<Joystick>> for DeviceLink {
    fn matches(&self, item: &Arc<Joystick>) -> bool {
        self.points_to(item) || self.ident.matches(&item.ident())
    }
}

impl StashKey<Arc<Joystick>> for DeviceSelector {
    fn matches(&self, item: &Arc<Joystick>) -> bool {
        self.matches_ident(&item.ident())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct FakeHandle(u64);

    impl DeviceHandle for FakeHandle {
        fn handle_id(&self) -> u64 {
            self.0
        }
    }

    fn pad(id: i64, name: &str, handle: Option<u64>) -> Arc<Joystick> {
        Joystick::new(
            DeviceInfo::new(id, name, KeyCounts::new(2, 3, 1, 1)),
            handle.map(|h| Box::new(FakeHandle(h)) as Box<dyn DeviceHandle>),
        )
    }

    #[test]
    fn test_keys_match_counts() {
        let joystick = pad(0, "Pad", None);
        assert_eq!(joystick.keys_of(KeyType::Axis).len(), 2);
        assert_eq!(joystick.keys_of(KeyType::Button).len(), 3);
        assert_eq!(joystick.keys().len(), 7);

        let keys = joystick.keys();
        assert_eq!(keys[0].keytype, KeyType::Axis);
        assert_eq!(keys[6].keytype, KeyType::Ball);
        assert!(keys.iter().all(|k| k.joystick().is_some()));
    }

    #[test]
    fn test_get_key_out_of_range() {
        let joystick = pad(0, "Pad", None);
        assert!(joystick.get_key(&Key::button(2, false)).is_ok());
        assert!(matches!(
            joystick.get_key(&Key::button(3, false)),
            Err(InputError::NotFound(_))
        ));
        assert!(joystick.update_key(&Key::hat(1, crate::HatValue::Up)).is_err());
    }

    #[test]
    fn test_update_and_read_values() {
        let joystick = pad(0, "Pad", None);
        joystick.update_key(&Key::axis(1, -0.5)).unwrap();
        joystick.update_key(&Key::button(2, true)).unwrap();
        joystick.update_key(&Key::hat(0, crate::HatValue::DownRight)).unwrap();
        joystick.update_key(&Key::ball(0, 2.0, -1.0)).unwrap();

        assert_eq!(joystick.get_axis(1).unwrap(), -0.5);
        assert_eq!(joystick.get_axis(0).unwrap(), 0.0);
        assert!(joystick.get_button(2).unwrap());
        assert_eq!(joystick.get_hat(0).unwrap(), 6);
        assert_eq!(joystick.get_ball(0).unwrap(), (2.0, -1.0));

        joystick.init_keys();
        assert_eq!(joystick.get_axis(1).unwrap(), 0.0);
    }

    #[test]
    fn test_deadband_setting() {
        let joystick = pad(0, "Pad", None);
        assert_eq!(joystick.deadband(), DEFAULT_DEADBAND);
        joystick.update_key(&Key::axis(0, 0.1)).unwrap();
        assert_eq!(joystick.get_axis_deadbanded(0).unwrap(), 0.0);
        joystick.set_deadband(0.05);
        assert!(joystick.get_axis_deadbanded(0).unwrap() > 0.0);
    }

    #[test]
    fn test_loose_equality() {
        let a = pad(1, "Pad A", Some(10));
        assert_eq!(*a, *pad(1, "Other", None));
        assert_eq!(*a, *pad(5, "Pad A", None));
        assert_eq!(*a, *pad(5, "Other", Some(10)));
        assert_ne!(*a, *pad(5, "Other", Some(11)));
        assert_ne!(*a, *pad(5, "Other", None));
    }

    #[test]
    fn test_registry_lookup_forms() {
        let devices: Stash<Arc<Joystick>> =
            vec![pad(4, "Pad A", None), pad(9, "Pad B", None)].into();

        assert_eq!(devices.get(&1usize).unwrap().name(), "Pad B");
        assert_eq!(devices.get(&9i64).unwrap().name(), "Pad B");
        assert_eq!(devices.get("Pad A").unwrap().id(), 4);
        assert_eq!(devices.get(&DeviceSelector::from("Pad B")).unwrap().id(), 9);

        let other = pad(9, "Renamed", None);
        assert_eq!(devices.get(&other).unwrap().name(), "Pad B");
        assert!(devices.get(&3i64).is_err());
    }

    #[test]
    fn test_close_releases_handle() {
        let joystick = pad(0, "Pad", Some(3));
        assert!(joystick.is_available());
        assert_eq!(joystick.handle_id(), Some(3));
        joystick.close();
        assert!(!joystick.is_available());
        assert_eq!(joystick.handle_id(), None);
        assert_eq!(joystick.keys().len(), 7);
    }

    #[test]
    fn test_link_survives_device_drop() {
        let joystick = pad(2, "Pad", None);
        let key = Key::button(0, true).on(&joystick);
        drop(joystick);
        assert!(key.joystick().is_none());
        assert_eq!(key.device().unwrap().ident().id, 2);

        let mut key = key;
        key.update_value(None);
        assert!(key.is_active());
    }
}
