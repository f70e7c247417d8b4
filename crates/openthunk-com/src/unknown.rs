//! `IUnknown` on objects we did not create

use std::ffi::c_void;
use std::ptr::NonNull;

use openthunk_common::win::{Guid, HResult};

/// A static function table that can live in a `static`.
#[repr(transparent)]
pub struct VTable<const N: usize>(pub [*const c_void; N]);

// Function pointers only; never written after construction.
unsafe impl<const N: usize> Sync for VTable<N> {}

impl<const N: usize> VTable<N> {
    pub const fn as_ptr(&self) -> *const *const c_void {
        self.0.as_ptr()
    }
}

pub type QueryInterfaceFn =
    unsafe extern "system" fn(this: *mut c_void, iid: *const Guid, out: *mut *mut c_void) -> i32;
pub type AddRefFn = unsafe extern "system" fn(this: *mut c_void) -> u32;
pub type ReleaseFn = unsafe extern "system" fn(this: *mut c_void) -> u32;

/// The three slots every COM vtable starts with.
#[repr(C)]
pub struct IUnknownVtbl {
    pub query_interface: QueryInterfaceFn,
    pub add_ref: AddRefFn,
    pub release: ReleaseFn,
}

/// # Safety
///
/// `obj` must be a live COM object.
unsafe fn vtbl<'a>(obj: *mut c_void) -> &'a IUnknownVtbl {
    &**(obj as *const *const IUnknownVtbl)
}

/// # Safety
///
/// `obj` must be a live COM object and `out` writable.
pub unsafe fn query_interface(obj: *mut c_void, iid: &Guid, out: *mut *mut c_void) -> HResult {
    HResult((vtbl(obj).query_interface)(obj, iid, out))
}

/// # Safety
///
/// `obj` must be a live COM object.
pub unsafe fn add_ref(obj: *mut c_void) -> u32 {
    (vtbl(obj).add_ref)(obj)
}

/// # Safety
///
/// `obj` must be a live COM object the caller holds a reference on.
pub unsafe fn release(obj: *mut c_void) -> u32 {
    (vtbl(obj).release)(obj)
}

/// The vtable pointer an object starts with, or null for a null object.
///
/// # Safety
///
/// `obj` must be null or point to at least one readable pointer.
pub unsafe fn vtable_of(obj: *const c_void) -> *const *const c_void {
    if obj.is_null() {
        return std::ptr::null();
    }
    *(obj as *const *const *const c_void)
}

/// An owned reference to an object created elsewhere.
pub struct ForeignRef(NonNull<c_void>);

// COM objects handed across threads are required to be free-threaded here.
unsafe impl Send for ForeignRef {}
unsafe impl Sync for ForeignRef {}

impl ForeignRef {
    /// Take a new reference on `obj`. `None` for null.
    ///
    /// # Safety
    ///
    /// `obj` must be null or a live COM object.
    pub unsafe fn add_ref_raw(obj: *mut c_void) -> Option<Self> {
        let ptr = NonNull::new(obj)?;
        add_ref(obj);
        Some(Self(ptr))
    }

    /// Adopt a reference the caller already owns.
    ///
    /// # Safety
    ///
    /// `obj` must be null or a live COM object the caller holds a reference on.
    pub unsafe fn from_raw(obj: *mut c_void) -> Option<Self> {
        NonNull::new(obj).map(Self)
    }

    pub fn as_raw(&self) -> *mut c_void {
        self.0.as_ptr()
    }

    /// Give a new reference to a caller, e.g. through an out pointer.
    pub fn to_raw_add_ref(&self) -> *mut c_void {
        // SAFETY: we hold a reference.
        unsafe { add_ref(self.as_raw()) };
        self.as_raw()
    }

    pub fn query_interface(&self, iid: &Guid, out: *mut *mut c_void) -> HResult {
        // SAFETY: we hold a reference; `out` is the caller's.
        unsafe { query_interface(self.as_raw(), iid, out) }
    }
}

impl Clone for ForeignRef {
    fn clone(&self) -> Self {
        // SAFETY: we hold a reference.
        unsafe { add_ref(self.as_raw()) };
        Self(self.0)
    }
}

impl Drop for ForeignRef {
    fn drop(&mut self) {
        // SAFETY: we own exactly one reference.
        unsafe { release(self.as_raw()) };
    }
}

impl std::fmt::Debug for ForeignRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ForeignRef({:p})", self.0)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! A plain `IUnknown` implemented without the proxy machinery.

    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[repr(C)]
    pub struct Foreign {
        vtbl: *const IUnknownVtbl,
        pub refs: AtomicU32,
    }

    unsafe extern "system" fn qi(this: *mut c_void, iid: *const Guid, out: *mut *mut c_void) -> i32 {
        if *iid == openthunk_common::win::IID_IUNKNOWN {
            add_ref_impl(this);
            *out = this;
            return HResult::S_OK.0;
        }
        *out = std::ptr::null_mut();
        HResult::E_NOINTERFACE.0
    }

    unsafe extern "system" fn add_ref_impl(this: *mut c_void) -> u32 {
        (*(this as *const Foreign)).refs.fetch_add(1, Ordering::SeqCst) + 1
    }

    unsafe extern "system" fn release_impl(this: *mut c_void) -> u32 {
        (*(this as *const Foreign)).refs.fetch_sub(1, Ordering::SeqCst) - 1
    }

    static FOREIGN_VTBL: IUnknownVtbl = IUnknownVtbl {
        query_interface: qi,
        add_ref: add_ref_impl,
        release: release_impl,
    };

    impl Foreign {
        pub fn new() -> Box<Self> {
            Box::new(Self {
                vtbl: &FOREIGN_VTBL,
                refs: AtomicU32::new(1),
            })
        }

        pub fn as_raw(&self) -> *mut c_void {
            self as *const Self as *mut c_void
        }
    }
}
