use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::protocol::DEFAULT_SAMPLING_RATE_HZ;

/// Configuration for a [`crate::session::DeviceSession`] and the
/// [`crate::btle::BtleTransport`] behind it.
///
/// Every field has a default, so a TOML file only needs the keys it changes:
///
/// ```
/// # use myo_link::config::SessionConfig;
/// let cfg = SessionConfig::from_toml_str("scan_timeout_secs = 5").unwrap();
/// assert_eq!(cfg.scan_timeout_secs, 5);
/// assert_eq!(cfg.sampling_rate_hz, 50);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Accept devices whose advertised name starts with this string, in
    /// addition to devices advertising the Myo service. Default: `"Myo"`.
    pub name_prefix: String,
    /// Name reported for a device that advertises none.
    /// Default: `"Myo Armband"`.
    pub default_device_name: String,
    /// BLE scan duration in seconds before device selection gives up.
    /// Default: `15`.
    pub scan_timeout_secs: u64,
    /// Hard limit on GATT connect and on service discovery, each.
    /// Default: `10`.
    pub connect_timeout_secs: u64,
    /// Rate written by the initialization sequence. Default: `50`.
    pub sampling_rate_hz: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name_prefix: "Myo".into(),
            default_device_name: "Myo Armband".into(),
            scan_timeout_secs: 15,
            connect_timeout_secs: 10,
            sampling_rate_hz: DEFAULT_SAMPLING_RATE_HZ,
        }
    }
}

impl SessionConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
