//! Errors shared by every layer of the bridge

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddrError {
    #[error("guest address {0:#x} is outside the shared window")]
    GuestOutOfRange(u32),

    #[error("host address {0:#x} is not reachable from the guest")]
    HostOutOfRange(usize),

    #[error("null guest address dereferenced")]
    NullAccess,

    #[error("guest window of {len:#x} bytes at {start:#x} is not representable")]
    InvalidWindow { start: u32, len: u32 },

    #[error("handle {0:#x} does not survive narrowing to 32 bits")]
    HandleTooWide(u64),

    #[error("value {0:#x} does not fit a 32-bit guest slot")]
    ValueTooWide(u64),

    #[error("envelope slot {0:#x} does not hold a guest address")]
    SlotTooWide(u64),

    #[error("guest heap exhausted allocating {0} bytes")]
    OutOfMemory(usize),

    #[error("guest address {0:#x} is not a live allocation")]
    NotAllocated(u32),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid guest window: {0}")]
    Window(#[from] AddrError),
}
