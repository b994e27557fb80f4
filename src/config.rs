use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::device::DEFAULT_DEADBAND;
use crate::error::InputError;
use crate::manager::ManagerSettings;
use crate::repeater::{RepeatPolicy, Repeater, RepeaterSettings};

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub manager: ManagerConfig,
    pub repeater: RepeaterConfig,
    pub find_key: FindKeyConfig,
    pub device: DeviceConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ManagerConfig {
    pub activity_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            activity_timeout_ms: 10,
            shutdown_grace_ms: 0,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RepeaterConfig {
    pub enabled: bool,
    pub mode: RepeatPolicy,
    pub first_repeat_timeout_ms: u64,
    pub repeat_timeout_ms: u64,
    pub check_timeout_ms: Option<u64>,
}

impl Default for RepeaterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: RepeatPolicy::ButtonHat,
            first_repeat_timeout_ms: 1000,
            repeat_timeout_ms: 500,
            check_timeout_ms: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct FindKeyConfig {
    pub poll_interval_ms: u64,
}

impl Default for FindKeyConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    pub deadband: f64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            deadband: DEFAULT_DEADBAND,
        }
    }
}

impl Config {
    /// `<config dir>/padstream/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("padstream").join("config.toml"))
    }

    pub fn parse(text: &str) -> Result<Self, InputError> {
        let config: Config = toml::from_str(text)
            .map_err(|e| InputError::ConfigError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, InputError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            InputError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::parse(&text)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Loads `path`, or the default location when `None`. A missing file
    /// yields the defaults; a malformed one is an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, InputError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) => path,
                None => {
                    debug!("No config directory on this platform, using defaults");
                    return Ok(Self::default());
                }
            },
        };
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    pub fn to_toml(&self) -> Result<String, InputError> {
        toml::to_string_pretty(self)
            .map_err(|e| InputError::ConfigError(format!("Failed to serialize config: {}", e)))
    }

    fn validate(&self) -> Result<(), InputError> {
        if self.manager.activity_timeout_ms == 0 {
            return Err(InputError::ConfigError(
                "manager.activity_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.repeater.enabled && self.repeater.repeat_timeout_ms == 0 {
            return Err(InputError::ConfigError(
                "repeater.repeat_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.device.deadband) {
            return Err(InputError::ConfigError(format!(
                "device.deadband must be in [0, 1), got {}",
                self.device.deadband
            )));
        }
        Ok(())
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            activity_timeout: Duration::from_millis(self.manager.activity_timeout_ms),
            shutdown_grace: Duration::from_millis(self.manager.shutdown_grace_ms),
            poll_interval: Duration::from_millis(self.find_key.poll_interval_ms),
            deadband: Some(self.device.deadband),
            ..ManagerSettings::default()
        }
    }

    pub fn repeater_settings(&self) -> RepeaterSettings {
        RepeaterSettings {
            policy: self.repeater.mode,
            first_repeat_timeout: Duration::from_millis(self.repeater.first_repeat_timeout_ms),
            repeat_timeout: Duration::from_millis(self.repeater.repeat_timeout_ms),
            check_timeout: self.repeater.check_timeout_ms.map(Duration::from_millis),
            ..RepeaterSettings::default()
        }
    }

    /// The configured repeater, or `None` when repeats are disabled.
    pub fn repeater(&self) -> Option<Repeater> {
        self.repeater
            .enabled
            .then(|| Repeater::new(self.repeater_settings()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());

        let settings = config.manager_settings();
        assert_eq!(settings.activity_timeout, Duration::from_millis(10));
        assert_eq!(settings.shutdown_grace, Duration::ZERO);
        assert_eq!(settings.deadband, Some(0.2));

        let repeater = config.repeater_settings();
        assert_eq!(repeater.policy, RepeatPolicy::ButtonHat);
        assert_eq!(repeater.effective_check_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::parse(
            r#"
[repeater]
mode = "hat"
first_repeat_timeout_ms = 300
check_timeout_ms = 20

[device]
deadband = 0.05
"#,
        )
        .unwrap();
        assert_eq!(config.repeater.mode, RepeatPolicy::Hat);
        assert_eq!(config.repeater.repeat_timeout_ms, 500);
        assert_eq!(
            config.repeater_settings().effective_check_timeout(),
            Duration::from_millis(20)
        );
        assert_eq!(config.manager.activity_timeout_ms, 10);
        assert_eq!(config.manager_settings().deadband, Some(0.05));
    }

    #[test]
    fn test_disabled_repeater() {
        let config = Config::parse("[repeater]\nenabled = false\n").unwrap();
        assert!(config.repeater().is_none());
        assert!(Config::default().repeater().is_some());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            Config::parse("[manager]\nactivity_timeout_ms = 0\n"),
            Err(InputError::ConfigError(_))
        ));
        assert!(Config::parse("[repeater]\nmode = \"sometimes\"\n").is_err());
        assert!(Config::parse("[device]\ndeadband = 1.5\n").is_err());
    }

    #[test]
    fn test_load_from_file_and_missing_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[manager]\nshutdown_grace_ms = 250").unwrap();

        let config = Config::load_or_default(Some(file.path())).unwrap();
        assert_eq!(config.manager.shutdown_grace_ms, 250);

        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert_eq!(Config::load_or_default(Some(&missing)).unwrap(), Config::default());
        assert!(Config::load(&missing).is_err());
    }

    #[test]
    fn test_serialized_config_parses_back() {
        let mut config = Config::default();
        config.repeater.mode = RepeatPolicy::Button;
        let text = config.to_toml().unwrap();
        assert!(text.contains("mode = \"button\""));
        assert_eq!(Config::parse(&text).unwrap(), config);
    }
}
