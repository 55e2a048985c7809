//! Hardware configuration loading.
//!
//! Device tables are declared in TOML and loaded through the `config`
//! crate, then validated semantically before a registry is built from
//! them by a driver factory.
//!
//! ```toml
//! [[device]]
//! name = "ai-0"
//! kind = "analog_input"
//! path = "/dev/daq0"
//!
//! [[device]]
//! name = "att-0"
//! kind = "attenuator"
//! path = "/dev/att0"
//! [device.options]
//! step = "0.5"
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::device::SubdeviceKind;

/// Errors from configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] config::ConfigError),

    #[error("config validation failed: {0}")]
    Validation(String),
}

/// One declared device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntryConfig {
    pub name: String,
    pub kind: SubdeviceKind,
    pub path: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

/// Top-level hardware configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardwareConfig {
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceEntryConfig>,
}

impl HardwareConfig {
    /// Load from a TOML file and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "loading hardware config");
        let cfg = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?;
        let parsed: HardwareConfig = cfg.try_deserialize()?;
        parsed.validate()?;
        info!(devices = parsed.devices.len(), "hardware config loaded");
        Ok(parsed)
    }

    /// Parse from a TOML string (tests, embedded defaults).
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?;
        let parsed: HardwareConfig = cfg.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Semantic validation: names unique and non-empty, paths non-empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for dev in &self.devices {
            if dev.name.is_empty() {
                return Err(ConfigError::Validation("device name must not be empty".into()));
            }
            if dev.path.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "device '{}': path must not be empty",
                    dev.name
                )));
            }
            if !seen.insert(dev.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate device name '{}'",
                    dev.name
                )));
            }
        }
        Ok(())
    }

    /// Entries of one kind, in declaration order.
    pub fn of_kind(&self, kind: SubdeviceKind) -> impl Iterator<Item = &DeviceEntryConfig> {
        self.devices.iter().filter(move |d| d.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    const SAMPLE: &str = r#"
[[device]]
name = "ai-0"
kind = "analog_input"
path = "/dev/daq0"

[[device]]
name = "ao-0"
kind = "analog_output"
path = "/dev/daq0"

[[device]]
name = "att-0"
kind = "attenuator"
path = "/dev/att0"
[device.options]
step = "0.5"
"#;

    #[test]
    fn test_parse_sample() {
        let cfg = HardwareConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(cfg.devices.len(), 3);
        assert_eq!(cfg.devices[0].kind, SubdeviceKind::AnalogInput);
        assert_eq!(cfg.devices[2].options.get("step").map(String::as_str), Some("0.5"));
        assert_eq!(cfg.of_kind(SubdeviceKind::Attenuator).count(), 1);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let text = r#"
[[device]]
name = "a"
kind = "analog_input"
path = "/dev/daq0"

[[device]]
name = "a"
kind = "analog_output"
path = "/dev/daq0"
"#;
        let err = HardwareConfig::from_toml(text).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_empty_path_rejected() {
        let text = r#"
[[device]]
name = "a"
kind = "analog_input"
path = ""
"#;
        assert!(HardwareConfig::from_toml(text).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let cfg = HardwareConfig::load(file.path()).unwrap();
        assert_eq!(cfg.devices.len(), 3);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let text = r#"
[[device]]
name = "a"
kind = "frobnicator"
path = "/dev/x"
"#;
        assert!(HardwareConfig::from_toml(text).is_err());
    }
}
