use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

/// How DVB-S tuning drives the dish: through DiSEqC sequences, or with a
/// fixed universal LNB whose band is picked by the switch frequency.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    pub diseqc: bool,
    /// Switch frequency between the low and high LNB band, MHz.
    pub lnb_slof: u32,
    /// Local oscillator of the low band, MHz.
    pub lnb_low: u32,
    /// Local oscillator of the high band, MHz.
    pub lnb_high: u32,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        SwitchConfig {
            diseqc: false,
            lnb_slof: 11_700,
            lnb_low: 9_750,
            lnb_high: 10_600,
        }
    }
}

/// What the device does when a Dolby Digital track is selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DolbyTransferMode {
    /// No audio bypass, no transfer mode.
    Off,
    /// Audio bypass in the driver, transfer mode as fallback.
    #[default]
    BypassAndTransfer,
    /// No audio bypass, always transfer mode.
    TransferOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct ArbitrationPolicy {
    /// Minimum priority a request needs to take streams from the primary device.
    pub primary_limit: i32,
    pub dolby_transfer_mode: DolbyTransferMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub max_devices: u32,
    /// Index of the first `/dev/videoN` belonging to a DVB decoder.
    pub video_offset: u32,
    /// Card index of the primary device.
    pub primary_device: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            max_devices: 8,
            video_offset: 0,
            primary_device: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub switch: SwitchConfig,
    pub policy: ArbitrationPolicy,
    pub discovery: DiscoveryConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Toml {
            path: path.display().to_string(),
            source,
        })
    }
}
