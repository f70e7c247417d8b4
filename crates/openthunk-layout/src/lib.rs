//! Struct Layout Converter
//!
//! Each structure whose field widths differ between the 32-bit guest and the
//! 64-bit host exists twice: a guest-shaped `#[repr(C)]` type made only of
//! 32-bit fields (readable straight out of the guest heap window), and the
//! host-shaped type the real API consumes. [`LayoutPair`] converts between
//! the two, translating pointers through the [`AddressSpace`] and widening or
//! narrowing handles and pointer-sized integers.

pub mod dxgi;
pub mod geometry;
pub mod msg;
pub mod notify;
pub mod rebar;

use std::mem;

use openthunk_common::addr::{AddressSpace, GuestAddr, HostAddr};
use openthunk_common::arena::{GuestArena, Pod};
use openthunk_common::error::AddrError;
use thiserror::Error;

pub use dxgi::{GuestSharedResource, SharedResource, SurfaceDesc};
pub use geometry::{Point, Rect};
pub use msg::{GuestMsg, Msg};
pub use notify::{
    GuestNmHdr, GuestNmRebar, GuestNmRebarAutoSize, GuestNmRebarChevron, GuestNmRebarChildSize,
    NmHdr, NmRebar, NmRebarAutoSize, NmRebarChevron, NmRebarChildSize,
};
pub use rebar::{GuestRebarBandInfo, GuestRebarInfo, RebarBandInfo, RebarInfo};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("{name}: guest structure declares the host size {size}")]
    HostSized { name: &'static str, size: u32 },

    #[error("{name}: {field} value {value:#x} does not fit the guest field")]
    Narrowing {
        name: &'static str,
        field: &'static str,
        value: u64,
    },

    #[error(transparent)]
    Addr(#[from] AddrError),
}

pub type Result<T> = std::result::Result<T, LayoutError>;

/// A host-shaped structure and its guest-shaped twin.
pub trait LayoutPair: Sized {
    type Guest: Pod;

    const NAME: &'static str;

    fn to_host_layout(guest: &Self::Guest, space: &AddressSpace) -> Result<Self>;

    fn to_guest_layout(&self, space: &AddressSpace) -> Result<Self::Guest>;
}

/// Structures that open with a `cbSize` field naming the layout revision
/// the caller was built against.
pub trait SelfSized: LayoutPair {
    /// Full size of the newest guest layout.
    const GUEST_SIZE: u32;
    /// Full size of the newest host layout.
    const HOST_SIZE: u32;

    fn declared_size(guest: &Self::Guest) -> u32;

    /// Reject a guest structure tagged with the host size.
    ///
    /// That only happens when host code sends the message through a hooked
    /// procedure meant for guest callers, so converting it would corrupt it.
    fn check_declared(guest: &Self::Guest) -> Result<()> {
        let size = Self::declared_size(guest);
        if Self::HOST_SIZE != Self::GUEST_SIZE && size == Self::HOST_SIZE {
            return Err(LayoutError::HostSized {
                name: Self::NAME,
                size,
            });
        }
        Ok(())
    }
}

/// Apply `to_host_layout` to every record. An empty input yields an empty vector.
pub fn convert_array<T: LayoutPair>(guests: &[T::Guest], space: &AddressSpace) -> Result<Vec<T>> {
    guests.iter().map(|g| T::to_host_layout(g, space)).collect()
}

pub fn convert_array_to_guest<T: LayoutPair>(
    hosts: &[T],
    space: &AddressSpace,
) -> Result<Vec<T::Guest>> {
    hosts.iter().map(|h| h.to_guest_layout(space)).collect()
}

/// Narrow an array of host addresses to guest pointers.
pub fn pointer_array_to_guest(hosts: &[HostAddr], space: &AddressSpace) -> Result<Vec<u32>> {
    hosts
        .iter()
        .map(|&h| Ok(space.to_far(h)?.get()))
        .collect()
}

/// Read a self-sized guest structure, honouring its declared size.
///
/// Only `min(declared, GUEST_SIZE)` bytes are read from the guest; the rest
/// of the returned value is zero so an older, shorter layout converts with
/// its missing trailing fields cleared.
pub fn read_guest_sized<T: SelfSized>(arena: &GuestArena, addr: GuestAddr) -> Result<T::Guest> {
    let declared = arena.read::<u32>(addr)?;
    let len = declared.clamp(4, T::GUEST_SIZE) as usize;
    let bytes = arena.read_bytes(addr, len)?;
    let guest = pod_from_prefix::<T::Guest>(&bytes);
    tracing::trace!(name = T::NAME, declared, ?addr, "read self-sized guest structure");
    Ok(guest)
}

/// Write a guest structure back without touching bytes past the size the
/// caller declared for its buffer.
pub fn write_guest_sized<G: Pod>(
    arena: &GuestArena,
    addr: GuestAddr,
    guest: &G,
    declared: u32,
) -> Result<()> {
    let len = (declared as usize).min(mem::size_of::<G>());
    let bytes = pod_bytes(guest);
    arena.write_bytes(addr, &bytes[..len])?;
    Ok(())
}

/// A zeroed `T` with its leading bytes taken from `bytes`.
pub fn pod_from_prefix<T: Pod>(bytes: &[u8]) -> T {
    // SAFETY: T is Pod, so all-zero is a valid value.
    let mut value: T = unsafe { mem::zeroed() };
    let len = bytes.len().min(mem::size_of::<T>());
    // SAFETY: len is bounded by both buffers.
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), (&mut value as *mut T).cast::<u8>(), len);
    }
    value
}

pub fn pod_bytes<T: Pod>(value: &T) -> Vec<u8> {
    let mut out = vec![0u8; mem::size_of::<T>()];
    // SAFETY: out holds exactly size_of::<T>() bytes.
    unsafe {
        std::ptr::copy_nonoverlapping((value as *const T).cast::<u8>(), out.as_mut_ptr(), out.len());
    }
    out
}

/// Size summary of one structure pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutInfo {
    pub name: &'static str,
    pub guest_size: usize,
    pub host_size: usize,
}

pub fn layout_info<T: LayoutPair>() -> LayoutInfo {
    LayoutInfo {
        name: T::NAME,
        guest_size: mem::size_of::<T::Guest>(),
        host_size: mem::size_of::<T>(),
    }
}

/// Every structure pair this crate knows how to convert.
pub fn catalog() -> Vec<LayoutInfo> {
    vec![
        layout_info::<Rect>(),
        layout_info::<Point>(),
        layout_info::<Msg>(),
        layout_info::<RebarInfo>(),
        layout_info::<RebarBandInfo>(),
        layout_info::<NmHdr>(),
        layout_info::<NmRebarChildSize>(),
        layout_info::<NmRebar>(),
        layout_info::<NmRebarAutoSize>(),
        layout_info::<NmRebarChevron>(),
        layout_info::<SurfaceDesc>(),
        layout_info::<SharedResource>(),
    ]
}

pub(crate) fn narrow_handle(name: &'static str, field: &'static str, value: isize) -> Result<u32> {
    openthunk_common::addr::handle_to_guest(value as u64).map_err(|_| LayoutError::Narrowing {
        name,
        field,
        value: value as u64,
    })
}

pub(crate) fn narrow_int_ptr(name: &'static str, field: &'static str, value: isize) -> Result<u32> {
    openthunk_common::addr::int_ptr_to_guest(value as i64).map_err(|_| LayoutError::Narrowing {
        name,
        field,
        value: value as u64,
    })
}

pub(crate) fn narrow_uint_ptr(name: &'static str, field: &'static str, value: usize) -> Result<u32> {
    openthunk_common::addr::uint_ptr_to_guest(value as u64).map_err(|_| LayoutError::Narrowing {
        name,
        field,
        value: value as u64,
    })
}

pub(crate) fn widen_handle(value: u32) -> isize {
    openthunk_common::addr::handle_to_host(value) as isize
}

pub(crate) fn widen_int_ptr(value: u32) -> isize {
    openthunk_common::addr::int_ptr_to_host(value) as isize
}

pub(crate) fn guest_ptr_to_host(space: &AddressSpace, value: u32) -> Result<usize> {
    Ok(space.to_host(GuestAddr::new(value))?.get())
}

pub(crate) fn host_ptr_to_guest(space: &AddressSpace, value: usize) -> Result<u32> {
    Ok(space.to_far(HostAddr::new(value))?.get())
}
