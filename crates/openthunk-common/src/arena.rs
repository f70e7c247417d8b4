//! The guest heap window
//!
//! A block of host memory that forms the guest's address space. Host code reads
//! and writes guest structures here by guest address, and buffers whose
//! ownership moves to the guest (notification payloads, returned arrays) are
//! carved out of it with a small first-fit allocator.

use std::alloc::{self, Layout};
use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::Mutex;

use crate::addr::{AddressSpace, GuestAddr, HostAddr};
use crate::error::AddrError;

/// Allocation granularity inside the window.
pub const GUEST_HEAP_ALIGN: u32 = 16;

/// Types that can be copied in and out of guest memory byte-for-byte.
///
/// # Safety
///
/// Every bit pattern of `size_of::<Self>()` bytes must be a valid value, and
/// the type must contain no pointers or references into host memory.
pub unsafe trait Pod: Copy + 'static {}

macro_rules! pod_primitives {
    ($($ty:ty),*) => { $( unsafe impl Pod for $ty {} )* };
}

pod_primitives!(u8, u16, u32, u64, i8, i16, i32, i64);

unsafe impl<T: Pod, const N: usize> Pod for [T; N] {}

#[derive(Debug, Default)]
struct Heap {
    /// offset -> size of each free block
    free: BTreeMap<u32, u32>,
    /// offset -> size of each live allocation
    live: HashMap<u32, u32>,
}

impl Heap {
    fn alloc(&mut self, size: u32) -> Option<u32> {
        let (&offset, &block) = self.free.iter().find(|(_, len)| **len >= size)?;
        self.free.remove(&offset);
        if block > size {
            self.free.insert(offset + size, block - size);
        }
        self.live.insert(offset, size);
        Some(offset)
    }

    fn free(&mut self, offset: u32) -> bool {
        let Some(size) = self.live.remove(&offset) else {
            return false;
        };
        let mut start = offset;
        let mut len = size;

        if let Some(next_len) = self.free.remove(&(offset + size)) {
            len += next_len;
        }
        if let Some((&prev, &prev_len)) = self.free.range(..offset).next_back() {
            if prev + prev_len == offset {
                self.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        self.free.insert(start, len);
        true
    }
}

pub struct GuestArena {
    base: NonNull<u8>,
    layout: Layout,
    space: AddressSpace,
    heap: Mutex<Heap>,
}

// The window is plain memory owned by the arena. Concurrent access to the same
// bytes follows the guest's own synchronisation, as it would on real hardware.
unsafe impl Send for GuestArena {}
unsafe impl Sync for GuestArena {}

impl GuestArena {
    /// Reserve `len` bytes of host memory and expose them at guest address `guest_start`.
    pub fn new(guest_start: u32, len: u32) -> Result<Self, AddrError> {
        let invalid = AddrError::InvalidWindow {
            start: guest_start,
            len,
        };
        if len == 0 || len % GUEST_HEAP_ALIGN != 0 || guest_start % GUEST_HEAP_ALIGN != 0 {
            return Err(invalid);
        }
        let layout = Layout::from_size_align(len as usize, 4096).map_err(|_| invalid.clone())?;
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let base = NonNull::new(raw).ok_or(AddrError::OutOfMemory(len as usize))?;

        let space = match AddressSpace::new(base.as_ptr() as usize, guest_start, len) {
            Ok(space) => space,
            Err(err) => {
                // SAFETY: allocated above with this layout.
                unsafe { alloc::dealloc(base.as_ptr(), layout) };
                return Err(err);
            }
        };

        let mut heap = Heap::default();
        heap.free.insert(0, len);

        tracing::debug!(
            guest_start = format_args!("{guest_start:#x}"),
            len = format_args!("{len:#x}"),
            "guest heap window reserved"
        );

        Ok(Self {
            base,
            layout,
            space,
            heap: Mutex::new(heap),
        })
    }

    pub fn space(&self) -> &AddressSpace {
        &self.space
    }

    pub fn to_host(&self, addr: GuestAddr) -> Result<HostAddr, AddrError> {
        self.space.to_host(addr)
    }

    pub fn to_far(&self, addr: HostAddr) -> Result<GuestAddr, AddrError> {
        self.space.to_far(addr)
    }

    /// Allocate `size` zeroed bytes owned by whoever ends up holding the address.
    pub fn alloc(&self, size: usize) -> Result<GuestAddr, AddrError> {
        let rounded = size
            .max(1)
            .checked_next_multiple_of(GUEST_HEAP_ALIGN as usize)
            .and_then(|s| u32::try_from(s).ok())
            .ok_or(AddrError::OutOfMemory(size))?;

        let offset = self
            .lock_heap()
            .alloc(rounded)
            .ok_or(AddrError::OutOfMemory(size))?;

        // SAFETY: offset..offset+rounded lies inside the window.
        unsafe { ptr::write_bytes(self.base.as_ptr().add(offset as usize), 0, rounded as usize) };

        let addr = GuestAddr::new(self.space.guest_start().get() + offset);
        tracing::trace!(?addr, size, "guest heap alloc");
        Ok(addr)
    }

    pub fn free(&self, addr: GuestAddr) -> Result<(), AddrError> {
        let offset = addr
            .get()
            .checked_sub(self.space.guest_start().get())
            .ok_or(AddrError::NotAllocated(addr.get()))?;
        if !self.lock_heap().free(offset) {
            return Err(AddrError::NotAllocated(addr.get()));
        }
        tracing::trace!(?addr, "guest heap free");
        Ok(())
    }

    pub fn is_live(&self, addr: GuestAddr) -> bool {
        addr.get()
            .checked_sub(self.space.guest_start().get())
            .is_some_and(|offset| self.lock_heap().live.contains_key(&offset))
    }

    pub fn live_allocations(&self) -> usize {
        self.lock_heap().live.len()
    }

    pub fn read<T: Pod>(&self, addr: GuestAddr) -> Result<T, AddrError> {
        let host = self.space.check_span(addr, mem::size_of::<T>())?;
        // SAFETY: span checked; T accepts every bit pattern.
        Ok(unsafe { ptr::read_unaligned(host.as_ptr::<T>()) })
    }

    pub fn write<T: Pod>(&self, addr: GuestAddr, value: &T) -> Result<(), AddrError> {
        let host = self.space.check_span(addr, mem::size_of::<T>())?;
        // SAFETY: span checked.
        unsafe { ptr::write_unaligned(host.as_mut_ptr::<T>(), *value) };
        Ok(())
    }

    pub fn read_array<T: Pod>(&self, addr: GuestAddr, count: usize) -> Result<Vec<T>, AddrError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let bytes = count
            .checked_mul(mem::size_of::<T>())
            .ok_or(AddrError::GuestOutOfRange(addr.get()))?;
        let host = self.space.check_span(addr, bytes)?;
        let src = host.as_ptr::<T>();
        // SAFETY: span checked for `count` elements.
        Ok((0..count)
            .map(|i| unsafe { ptr::read_unaligned(src.add(i)) })
            .collect())
    }

    pub fn write_array<T: Pod>(&self, addr: GuestAddr, values: &[T]) -> Result<(), AddrError> {
        if values.is_empty() {
            return Ok(());
        }
        let host = self.space.check_span(addr, mem::size_of_val(values))?;
        let dst = host.as_mut_ptr::<T>();
        for (i, value) in values.iter().enumerate() {
            // SAFETY: span checked for `values.len()` elements.
            unsafe { ptr::write_unaligned(dst.add(i), *value) };
        }
        Ok(())
    }

    pub fn read_bytes(&self, addr: GuestAddr, len: usize) -> Result<Vec<u8>, AddrError> {
        self.read_array::<u8>(addr, len)
    }

    pub fn write_bytes(&self, addr: GuestAddr, bytes: &[u8]) -> Result<(), AddrError> {
        self.write_array(addr, bytes)
    }

    /// Allocate guest memory and copy `value` into it.
    pub fn alloc_value<T: Pod>(&self, value: &T) -> Result<GuestAddr, AddrError> {
        let addr = self.alloc(mem::size_of::<T>())?;
        self.write(addr, value)?;
        Ok(addr)
    }

    pub fn alloc_array<T: Pod>(&self, values: &[T]) -> Result<GuestAddr, AddrError> {
        let addr = self.alloc(mem::size_of_val(values))?;
        self.write_array(addr, values)?;
        Ok(addr)
    }

    fn lock_heap(&self) -> std::sync::MutexGuard<'_, Heap> {
        self.heap.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for GuestArena {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this layout.
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for GuestArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestArena")
            .field("space", &self.space)
            .field("live", &self.live_allocations())
            .finish()
    }
}
