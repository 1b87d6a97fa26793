//! Gateway configuration
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration. Durations are given in milliseconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable consulted for the default storage root
pub const STORAGE_ENV: &str = "CANGW_STORAGE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanGwConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub flash: FlashConfig,
}

impl CanGwConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: CanGwConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flash.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "flash.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.storage.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("storage.path is empty".to_string()));
        }
        Ok(())
    }
}

// =============================================================================
// Storage
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory of dictionaries and flash records
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

fn default_storage_path() -> PathBuf {
    std::env::var_os(STORAGE_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("cangw-data"))
}

// =============================================================================
// Bus
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// How long a state read waits for a fresh heartbeat
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,
}

impl BusConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: default_heartbeat_timeout(),
        }
    }
}

fn default_heartbeat_timeout() -> u64 {
    3000
}

// =============================================================================
// Flash
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Orders that may wait behind the running one
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Pause between the second STOP and START
    #[serde(default = "default_settle_before_start")]
    pub settle_before_start_ms: u64,
    /// Time the device gets to boot the new image before it is checked
    #[serde(default = "default_boot_delay")]
    pub boot_delay_ms: u64,
    #[serde(default)]
    pub objects: ProgramObjects,
}

impl FlashConfig {
    pub fn settle_before_start(&self) -> Duration {
        Duration::from_millis(self.settle_before_start_ms)
    }

    pub fn boot_delay(&self) -> Duration {
        Duration::from_millis(self.boot_delay_ms)
    }
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            settle_before_start_ms: default_settle_before_start(),
            boot_delay_ms: default_boot_delay(),
            objects: ProgramObjects::default(),
        }
    }
}

fn default_queue_capacity() -> usize {
    20
}

fn default_settle_before_start() -> u64 {
    1000
}

fn default_boot_delay() -> u64 {
    10_000
}

/// Address of one object dictionary entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryAddress {
    pub index: u16,
    pub subindex: u8,
}

impl EntryAddress {
    pub const fn new(index: u16, subindex: u8) -> Self {
        Self { index, subindex }
    }
}

impl std::fmt::Display for EntryAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04X}:{}", self.index, self.subindex)
    }
}

/// Objects used by the flash sequence (CiA 302 program download layout)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramObjects {
    #[serde(default = "default_program_data")]
    pub program_data: EntryAddress,
    #[serde(default = "default_program_control")]
    pub program_control: EntryAddress,
    #[serde(default = "default_flash_status")]
    pub flash_status: EntryAddress,
    #[serde(default = "default_error_register")]
    pub error_register: EntryAddress,
    #[serde(default = "default_software_version")]
    pub software_version: EntryAddress,
}

impl Default for ProgramObjects {
    fn default() -> Self {
        Self {
            program_data: default_program_data(),
            program_control: default_program_control(),
            flash_status: default_flash_status(),
            error_register: default_error_register(),
            software_version: default_software_version(),
        }
    }
}

fn default_program_data() -> EntryAddress {
    EntryAddress::new(0x1F50, 1)
}

fn default_program_control() -> EntryAddress {
    EntryAddress::new(0x1F51, 1)
}

fn default_flash_status() -> EntryAddress {
    EntryAddress::new(0x1F57, 1)
}

fn default_error_register() -> EntryAddress {
    EntryAddress::new(0x1001, 0)
}

fn default_software_version() -> EntryAddress {
    EntryAddress::new(0x100A, 0)
}
