//! Guest and host addresses
//!
//! A guest address is a 32-bit value that only means something inside the
//! guest's view of memory. A host address is a native pointer value. The two
//! are distinct types so one side's address can never be used as the other's
//! without going through an [`AddressSpace`].
//!
//! Translation is NOT idempotent: feeding a host address back into `to_far`
//! twice, or a guest value into `to_host` after it was already translated, is a
//! caller bug. The types make that hard to do by accident.

use std::fmt;

use crate::error::AddrError;

/// An address in the guest's 32-bit address space.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct GuestAddr(u32);

impl GuestAddr {
    pub const NULL: GuestAddr = GuestAddr(0);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Offset this address by `bytes`, failing on 32-bit overflow.
    pub fn checked_add(self, bytes: u32) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Interpret a wide envelope slot as a guest address.
    pub fn from_slot(slot: u64) -> Result<Self, AddrError> {
        u32::try_from(slot)
            .map(Self)
            .map_err(|_| AddrError::SlotTooWide(slot))
    }
}

impl fmt::Debug for GuestAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g:{:#010x}", self.0)
    }
}

impl fmt::Display for GuestAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// A native address on the host side.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct HostAddr(usize);

impl HostAddr {
    pub const NULL: HostAddr = HostAddr(0);

    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    pub const fn get(self) -> usize {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

impl fmt::Debug for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h:{:#018x}", self.0)
    }
}

/// The window of host memory the guest can see.
///
/// Guest addresses `[guest_start, guest_start + len)` map onto host addresses
/// `[host_base, host_base + len)`. Null maps to null in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    host_base: usize,
    guest_start: u32,
    len: u32,
}

impl AddressSpace {
    pub fn new(host_base: usize, guest_start: u32, len: u32) -> Result<Self, AddrError> {
        let invalid = AddrError::InvalidWindow {
            start: guest_start,
            len,
        };
        if len == 0 || guest_start == 0 {
            return Err(invalid);
        }
        if u64::from(guest_start) + u64::from(len) > 1 << 32 {
            return Err(invalid);
        }
        if host_base == 0 || host_base.checked_add(len as usize).is_none() {
            return Err(invalid);
        }
        Ok(Self {
            host_base,
            guest_start,
            len,
        })
    }

    pub fn host_base(&self) -> usize {
        self.host_base
    }

    pub fn guest_start(&self) -> GuestAddr {
        GuestAddr(self.guest_start)
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains_guest(&self, addr: GuestAddr) -> bool {
        addr.0 >= self.guest_start && u64::from(addr.0) < self.guest_end()
    }

    pub fn contains_host(&self, addr: HostAddr) -> bool {
        addr.0 >= self.host_base && addr.0 - self.host_base < self.len as usize
    }

    /// Guest → host.
    pub fn to_host(&self, addr: GuestAddr) -> Result<HostAddr, AddrError> {
        if addr.is_null() {
            return Ok(HostAddr::NULL);
        }
        if !self.contains_guest(addr) {
            return Err(AddrError::GuestOutOfRange(addr.0));
        }
        Ok(HostAddr(self.host_base + (addr.0 - self.guest_start) as usize))
    }

    /// Host → guest ("far" from the host's point of view).
    pub fn to_far(&self, addr: HostAddr) -> Result<GuestAddr, AddrError> {
        if addr.is_null() {
            return Ok(GuestAddr::NULL);
        }
        if !self.contains_host(addr) {
            return Err(AddrError::HostOutOfRange(addr.0));
        }
        // The window is at most 4 GiB starting at guest_start, so this fits.
        Ok(GuestAddr(self.guest_start + (addr.0 - self.host_base) as u32))
    }

    /// Check that `[addr, addr + size)` lies inside the window.
    pub fn check_span(&self, addr: GuestAddr, size: usize) -> Result<HostAddr, AddrError> {
        let host = self.to_host(addr)?;
        if host.is_null() {
            return Err(AddrError::NullAccess);
        }
        let end = u64::from(addr.0) + size as u64;
        if end > self.guest_end() {
            return Err(AddrError::GuestOutOfRange(addr.0));
        }
        Ok(host)
    }

    fn guest_end(&self) -> u64 {
        u64::from(self.guest_start) + u64::from(self.len)
    }
}

/// Handles are sign-extended when they widen to the host.
pub fn handle_to_host(handle: u32) -> u64 {
    handle as i32 as i64 as u64
}

/// Handles narrow back by truncation; the value must survive the round trip.
pub fn handle_to_guest(handle: u64) -> Result<u32, AddrError> {
    let narrowed = handle as u32;
    if handle_to_host(narrowed) != handle {
        return Err(AddrError::HandleTooWide(handle));
    }
    Ok(narrowed)
}

/// Unsigned pointer-sized integers (`UINT_PTR`, `WPARAM`) zero-extend.
pub fn uint_ptr_to_host(value: u32) -> u64 {
    u64::from(value)
}

pub fn uint_ptr_to_guest(value: u64) -> Result<u32, AddrError> {
    u32::try_from(value).map_err(|_| AddrError::ValueTooWide(value))
}

/// Signed pointer-sized integers (`LPARAM`, `LRESULT`) sign-extend.
pub fn int_ptr_to_host(value: u32) -> i64 {
    i64::from(value as i32)
}

pub fn int_ptr_to_guest(value: i64) -> Result<u32, AddrError> {
    i32::try_from(value)
        .map(|v| v as u32)
        .map_err(|_| AddrError::ValueTooWide(value as u64))
}
