//! Line format between a relay child and its parent.
//!
//! One JSON object per line, tagged by `"event"`:
//!
//! ```text
//! {"event":"device_added","device":{"id":0,"name":"Pad","counts":{"axes":2,"buttons":4,"hats":1,"balls":0}}}
//! {"event":"key","key":{"keytype":"Button","number":2,"value":1.0,"device":{"id":0,"name":"Pad"}}}
//! {"event":"device_removed","device":{"id":0,"name":"Pad"}}
//! ```

use serde::{Deserialize, Serialize};

use crate::device::{DeviceIdent, DeviceInfo, DeviceLink, Key, KeyType, KeyValue};
use crate::error::InputError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireKey {
    pub keytype: KeyType,
    pub number: usize,
    pub value: Option<KeyValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceIdent>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_repeat: bool,
}

impl From<&Key> for WireKey {
    fn from(key: &Key) -> Self {
        Self {
            keytype: key.keytype,
            number: key.number,
            value: key.raw_value(),
            device: key.device().map(|link| link.ident().clone()),
            is_repeat: key.is_repeat,
        }
    }
}

impl WireKey {
    /// Rebuilds the key with a detached device link.
    pub fn into_key(self) -> Key {
        let mut key = Key::new(self.keytype, self.number, self.value);
        key.is_repeat = self.is_repeat;
        if let Some(ident) = self.device {
            key.set_device(Some(DeviceLink::detached(ident)));
        }
        key
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WireEvent {
    DeviceAdded { device: DeviceInfo },
    DeviceRemoved { device: DeviceIdent },
    Key { key: WireKey },
}

impl WireEvent {
    pub fn key(key: &Key) -> Self {
        WireEvent::Key { key: key.into() }
    }
}

pub fn encode(event: &WireEvent) -> Result<String, InputError> {
    serde_json::to_string(event).map_err(|e| InputError::TransportError(e.to_string()))
}

/// Parses one line. Malformed input is a transient failure for that line only.
pub fn decode(line: &str) -> Result<WireEvent, InputError> {
    serde_json::from_str(line.trim())
        .map_err(|e| InputError::BackendTransient(format!("malformed relay line: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{HatValue, Joystick, KeyCounts};

    #[test]
    fn test_key_line_format() {
        let joystick = Joystick::new(DeviceInfo::new(3, "Pad", KeyCounts::new(1, 4, 1, 0)), None);
        let key = Key::button(2, true).on(&joystick);

        let line = encode(&WireEvent::key(&key)).unwrap();
        assert_eq!(
            line,
            r#"{"event":"key","key":{"keytype":"Button","number":2,"value":1.0,"device":{"id":3,"name":"Pad"}}}"#
        );
    }

    #[test]
    fn test_decode_rebuilds_detached_key() {
        let line = r#"{"event":"key","key":{"keytype":"Hat","number":0,"value":9,"device":{"id":1,"name":"Pad"},"is_repeat":true}}"#;
        let WireEvent::Key { key } = decode(line).unwrap() else {
            panic!("expected a key event");
        };
        let key = key.into_key();
        assert_eq!(key.hat_value().unwrap(), Some(HatValue::UpLeft));
        assert!(key.is_repeat);
        assert!(key.joystick().is_none());
        assert_eq!(key.device().unwrap().ident().id, 1);
    }

    #[test]
    fn test_ball_motion_and_missing_value() {
        let line = encode(&WireEvent::key(&Key::ball(0, 1.5, -2.0))).unwrap();
        assert!(line.contains(r#""value":[1.5,-2.0]"#));
        let WireEvent::Key { key } = decode(&line).unwrap() else {
            panic!("expected a key event");
        };
        assert_eq!(key.value, Some(KeyValue::Motion(1.5, -2.0)));

        let absent =
            decode(r#"{"event":"key","key":{"keytype":"Axis","number":1,"value":null}}"#).unwrap();
        assert_eq!(
            absent,
            WireEvent::Key {
                key: WireKey {
                    keytype: KeyType::Axis,
                    number: 1,
                    value: None,
                    device: None,
                    is_repeat: false,
                }
            }
        );
    }

    #[test]
    fn test_device_events() {
        let added = decode(r#"{"event":"device_added","device":{"id":0,"name":"Pad"}}"#).unwrap();
        assert_eq!(
            added,
            WireEvent::DeviceAdded {
                device: DeviceInfo::new(0, "Pad", KeyCounts::default())
            }
        );
        assert!(matches!(
            decode("{\"event\":\"unplugged\"}"),
            Err(InputError::BackendTransient(_))
        ));
        assert!(decode("not json").is_err());
    }
}
