//! Common types shared across openthunk crates
//!
//! Address translation between the 32-bit guest and the 64-bit host, the
//! guest heap window, handle tables, Win32 scalar types and the bridge
//! configuration.

#[cfg(not(target_pointer_width = "64"))]
compile_error!("the host side of the bridge must be a 64-bit target");

pub mod addr;
pub mod arena;
pub mod error;
pub mod handle;
pub mod logging;
pub mod win;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub use addr::{AddressSpace, GuestAddr, HostAddr};
pub use arena::{GuestArena, Pod};
pub use error::{AddrError, ConfigError};
pub use handle::HandleTable;
pub use win::{Guid, HResult};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "OPENTHUNK_CONFIG";

/// Where the guest's view of memory lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestConfig {
    /// First guest address of the heap window
    pub window_base: u32,
    /// Size of the window in bytes
    pub window_size: u32,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            window_base: 0x0001_0000,
            window_size: 0x0100_0000,
        }
    }
}

/// Which window class hooks the bridge installs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    pub rebar: bool,
    pub richedit: bool,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            rebar: true,
            richedit: true,
        }
    }
}

/// Bridge-wide configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub log_level: String,
    /// Abort calls whose guest structure is tagged with the host size.
    /// When false the anomaly is logged and the structure converted anyway.
    pub strict_layout: bool,
    pub guest: GuestConfig,
    pub hooks: HookConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            strict_layout: true,
            guest: GuestConfig::default(),
            hooks: HookConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// The file named by `OPENTHUNK_CONFIG`, if set.
    pub fn env_path() -> Option<PathBuf> {
        std::env::var_os(CONFIG_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let GuestConfig {
            window_base,
            window_size,
        } = self.guest;
        let invalid = AddrError::InvalidWindow {
            start: window_base,
            len: window_size,
        };
        if window_base == 0 || window_size == 0 {
            return Err(invalid.into());
        }
        if window_base % arena::GUEST_HEAP_ALIGN != 0 || window_size % arena::GUEST_HEAP_ALIGN != 0 {
            return Err(invalid.into());
        }
        if u64::from(window_base) + u64::from(window_size) > 1 << 32 {
            return Err(invalid.into());
        }
        Ok(())
    }
}
