//! Stack configuration
//!
//! One TOML document configures the bus, both transports and the acceptance
//! filter. Every section is optional and falls back to the defaults below.
//!
//! ```toml
//! [bus]
//! bitrate = 500000
//!
//! [isotp]
//! own_id = 0x7E0
//! peer_id = 0x7E8
//! full_frame = true
//!
//! [tp20]
//! session_timeout_ms = 5000
//! ```

use crate::data_link::filter_table::DEFAULT_CAPACITY_WORDS;
use crate::error::{AutomotiveError, Result};
use crate::physical::can::{CanConfig, CanOptions};
use crate::transport::isotp::{AddressingVariant, IsoTpConfig, IsoTpTiming, TransmissionParameters};
use crate::transport::tp20::Tp20Config;
use crate::types::{CanId, Config, IdFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level stack configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub isotp: IsoTpSection,
    #[serde(default)]
    pub tp20: Tp20Section,
    #[serde(default)]
    pub filters: FilterSection,
}

impl StackConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: StackConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AutomotiveError::Config(format!("failed to read '{}': {}", path.display(), e))
        })?;
        tracing::debug!(path = %path.display(), "loading stack configuration");
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| AutomotiveError::Config(e.to_string()))
    }

    pub fn isotp_config(&self) -> Result<IsoTpConfig> {
        IsoTpConfig::try_from(&self.isotp)
    }

    pub fn tp20_config(&self) -> Tp20Config {
        Tp20Config::from(&self.tp20)
    }

    pub fn can_config(&self) -> CanConfig {
        CanConfig::from(&self.bus)
    }
}

impl Config for StackConfig {
    fn validate(&self) -> Result<()> {
        self.can_config().validate()?;
        self.isotp_config()?.validate()?;
        self.tp20_config().validate()?;
        if self.filters.capacity_words == 0 {
            return Err(AutomotiveError::Config("filter table needs at least one word".into()));
        }
        Ok(())
    }
}

/// `[bus]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    /// Listen-only: the controller never drives the bus
    #[serde(default)]
    pub monitor_mode: bool,
}

fn default_bitrate() -> u32 {
    500000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bitrate: default_bitrate(),
            monitor_mode: false,
        }
    }
}

impl From<&BusConfig> for CanConfig {
    fn from(bus: &BusConfig) -> Self {
        let options = if bus.monitor_mode {
            CanOptions::LISTEN_ONLY
        } else {
            CanOptions::NONE
        };
        CanConfig {
            bitrate: bus.bitrate,
            sample_point: 0.75,
            sjw: 1,
            options,
        }
    }
}

/// `[isotp]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsoTpSection {
    #[serde(default = "default_own_id")]
    pub own_id: CanId,
    #[serde(default = "default_peer_id")]
    pub peer_id: CanId,
    /// 29-bit identifiers
    #[serde(default)]
    pub extended_ids: bool,
    /// Target address byte for one-byte extended addressing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_extension: Option<u8>,
    /// Address byte expected on frames from the ECU under extended addressing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_address: Option<u8>,
    #[serde(default)]
    pub full_frame: bool,
    #[serde(default = "default_padding")]
    pub padding_byte: u8,
    #[serde(default)]
    pub use_filters: bool,
    #[serde(default = "default_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_max_wait_frames")]
    pub max_wait_frames: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tester_present_interval_ms: Option<u64>,
}

fn default_own_id() -> CanId {
    0x7E0
}

fn default_peer_id() -> CanId {
    0x7E8
}

fn default_padding() -> u8 {
    0xCC
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_max_wait_frames() -> u8 {
    8
}

impl Default for IsoTpSection {
    fn default() -> Self {
        Self {
            own_id: default_own_id(),
            peer_id: default_peer_id(),
            extended_ids: false,
            address_extension: None,
            reply_address: None,
            full_frame: false,
            padding_byte: default_padding(),
            use_filters: false,
            request_timeout_ms: default_timeout_ms(),
            response_timeout_ms: default_timeout_ms(),
            max_wait_frames: default_max_wait_frames(),
            tester_present_interval_ms: None,
        }
    }
}

impl TryFrom<&IsoTpSection> for IsoTpConfig {
    type Error = AutomotiveError;

    fn try_from(section: &IsoTpSection) -> Result<Self> {
        let address_format = if section.extended_ids {
            IdFormat::Extended
        } else {
            IdFormat::Standard
        };
        let params = TransmissionParameters {
            own_id: section.own_id,
            peer_id: section.peer_id,
            address_format,
            addressing: section
                .address_extension
                .map_or(AddressingVariant::Standard, AddressingVariant::OneByteExtended),
            reply_address: section.reply_address,
            full_frame: section.full_frame,
            padding_byte: section.padding_byte,
            use_filters: section.use_filters,
        };
        params
            .validate()
            .map_err(|e| AutomotiveError::Config(format!("[isotp] {}", e)))?;

        Ok(IsoTpConfig {
            params,
            timing: IsoTpTiming {
                request_timeout: Duration::from_millis(section.request_timeout_ms),
                response_timeout: Duration::from_millis(section.response_timeout_ms),
            },
            max_wait_frames: section.max_wait_frames,
            tester_present_interval: section.tester_present_interval_ms.map(Duration::from_millis),
        })
    }
}

/// `[tp20]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tp20Section {
    #[serde(default = "default_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_test_interval_ms: Option<u64>,
    #[serde(default = "default_block_size")]
    pub block_size: u8,
    #[serde(default = "default_t1")]
    pub t1: u8,
    #[serde(default = "default_t3")]
    pub t3: u8,
    #[serde(default = "default_setup_id")]
    pub setup_id: CanId,
}

fn default_session_timeout_ms() -> u64 {
    5000
}

fn default_block_size() -> u8 {
    0x0F
}

fn default_t1() -> u8 {
    0x8A
}

fn default_t3() -> u8 {
    0x32
}

fn default_setup_id() -> CanId {
    0x200
}

impl Default for Tp20Section {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_timeout_ms(),
            response_timeout_ms: default_timeout_ms(),
            session_timeout_ms: default_session_timeout_ms(),
            channel_test_interval_ms: None,
            block_size: default_block_size(),
            t1: default_t1(),
            t3: default_t3(),
            setup_id: default_setup_id(),
        }
    }
}

impl From<&Tp20Section> for Tp20Config {
    fn from(section: &Tp20Section) -> Self {
        Tp20Config {
            request_timeout: Duration::from_millis(section.request_timeout_ms),
            response_timeout: Duration::from_millis(section.response_timeout_ms),
            session_timeout: Duration::from_millis(section.session_timeout_ms),
            channel_test_interval: section.channel_test_interval_ms.map(Duration::from_millis),
            block_size: section.block_size,
            t1: section.t1,
            t3: section.t3,
            setup_id: section.setup_id,
        }
    }
}

/// `[filters]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSection {
    #[serde(default = "default_capacity_words")]
    pub capacity_words: usize,
}

fn default_capacity_words() -> usize {
    DEFAULT_CAPACITY_WORDS
}

impl Default for FilterSection {
    fn default() -> Self {
        Self {
            capacity_words: default_capacity_words(),
        }
    }
}
