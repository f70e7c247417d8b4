//! Win32 scalar types as the host sees them
//!
//! Kept free of any platform crate so the bridge logic builds and tests on
//! every host. The aliases carry host (64-bit) widths.

use std::fmt;

pub type Hwnd = isize;
pub type WParam = usize;
pub type LParam = isize;
pub type LResult = isize;
pub type Bool = i32;

pub const TRUE: Bool = 1;
pub const FALSE: Bool = 0;

pub const WM_USER: u32 = 0x0400;
pub const WM_NOTIFY: u32 = 0x004E;

/// A COM result code.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct HResult(pub i32);

impl HResult {
    pub const S_OK: HResult = HResult(0);
    pub const S_FALSE: HResult = HResult(1);
    pub const E_NOTIMPL: HResult = HResult(0x80004001_u32 as i32);
    pub const E_NOINTERFACE: HResult = HResult(0x80004002_u32 as i32);
    pub const E_POINTER: HResult = HResult(0x80004003_u32 as i32);
    pub const E_FAIL: HResult = HResult(0x80004005_u32 as i32);
    pub const E_OUTOFMEMORY: HResult = HResult(0x8007000E_u32 as i32);
    pub const E_INVALIDARG: HResult = HResult(0x80070057_u32 as i32);

    pub const fn succeeded(self) -> bool {
        self.0 >= 0
    }

    pub const fn failed(self) -> bool {
        self.0 < 0
    }

    /// Bit pattern for an envelope slot.
    pub const fn to_slot(self) -> u64 {
        self.0 as u32 as u64
    }

    pub const fn from_slot(slot: u64) -> Self {
        HResult(slot as u32 as i32)
    }
}

impl fmt::Debug for HResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HRESULT({:#010x})", self.0 as u32)
    }
}

impl fmt::Display for HResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0 as u32)
    }
}

/// An interface identifier, laid out like the native `GUID`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(C)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Guid {
    pub const fn from_u128(uuid: u128) -> Self {
        Self {
            data1: (uuid >> 96) as u32,
            data2: (uuid >> 80 & 0xffff) as u16,
            data3: (uuid >> 64 & 0xffff) as u16,
            data4: (uuid as u64).to_be_bytes(),
        }
    }

    pub const fn to_u128(&self) -> u128 {
        (self.data1 as u128) << 96
            | (self.data2 as u128) << 80
            | (self.data3 as u128) << 64
            | u64::from_be_bytes(self.data4) as u128
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.data4;
        write!(
            f,
            "{{{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}}}",
            self.data1, self.data2, self.data3, d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7]
        )
    }
}

// SAFETY: plain integers, no padding (4 + 2 + 2 + 8).
unsafe impl crate::arena::Pod for Guid {}

pub const IID_IUNKNOWN: Guid = Guid::from_u128(0x00000000_0000_0000_c000_000000000046);
