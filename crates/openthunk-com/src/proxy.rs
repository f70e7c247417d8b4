//! Proxy objects
//!
//! A proxy is a `#[repr(C)]` block whose first word is a pointer to a static
//! vtable of trampolines. The vtable pointer doubles as the identity marker:
//! an object is one of ours exactly when its first word equals the class
//! vtable.

use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, AtomicU32, Ordering};

use openthunk_common::win::{Guid, HResult, IID_IUNKNOWN};

use crate::unknown;

/// Parked in the count while a proxy is being destroyed. AddRef/Release
/// calls made by a cascading teardown move the count around the bias and
/// never reach zero again.
const TEARDOWN_BIAS: u32 = 0x4000_0000;

/// One kind of proxy.
///
/// # Safety
///
/// [`vtable`](Self::vtable) must return a static table whose first three
/// slots are [`query_interface::<Self>`], [`add_ref::<Self>`] and
/// [`release::<Self>`], and whose remaining slots take `*mut Proxy<Self>`
/// as their first argument.
pub unsafe trait ProxyClass: Sized + Send + Sync + 'static {
    const NAME: &'static str;

    /// Interface ids answered with the proxy itself, besides `IUnknown`.
    const IIDS: &'static [Guid];

    fn vtable() -> *const *const c_void;

    /// Drop the reference the proxy holds on whatever it wraps. Runs exactly
    /// once, when the proxy's count reaches zero.
    fn release_underlying(&self);

    /// Last resort for ids not in [`IIDS`](Self::IIDS). Must leave `*out`
    /// null on failure.
    fn forward_query_interface(&self, _iid: &Guid, out: *mut *mut c_void) -> HResult {
        // SAFETY: callers pass a checked, writable out pointer.
        unsafe { *out = ptr::null_mut() };
        HResult::E_NOINTERFACE
    }
}

#[repr(C)]
pub struct Proxy<C: ProxyClass> {
    vtbl: *const *const c_void,
    refcount: AtomicU32,
    inner: C,
}

impl<C: ProxyClass> Proxy<C> {
    /// Wrap `inner` in a new proxy holding one reference.
    pub fn create(inner: C) -> ProxyRef<C> {
        let boxed = Box::new(Proxy {
            vtbl: C::vtable(),
            refcount: AtomicU32::new(1),
            inner,
        });
        tracing::trace!(class = C::NAME, "proxy created");
        ProxyRef {
            // SAFETY: Box::into_raw never returns null.
            ptr: unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) },
            _marker: PhantomData,
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn as_interface(&self) -> *mut c_void {
        self as *const Self as *mut c_void
    }

    fn add_ref(&self) -> u32 {
        self.refcount.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// # Safety
    ///
    /// The caller gives up one reference; `this` may be freed on return.
    unsafe fn release(this: *mut Self) -> u32 {
        let prev = (*this).refcount.fetch_sub(1, Ordering::Release);
        if prev >= TEARDOWN_BIAS / 2 {
            // Re-entered from our own teardown.
            return 0;
        }
        if prev == 0 {
            (*this).refcount.fetch_add(1, Ordering::Relaxed);
            tracing::error!(class = C::NAME, "proxy released more often than referenced");
            return 0;
        }
        if prev != 1 {
            return prev - 1;
        }

        fence(Ordering::Acquire);
        (*this).refcount.store(TEARDOWN_BIAS, Ordering::Relaxed);
        tracing::trace!(class = C::NAME, "proxy destroyed");
        (*this).inner.release_underlying();
        drop(Box::from_raw(this));
        0
    }
}

impl<C: ProxyClass + fmt::Debug> fmt::Debug for Proxy<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("class", &C::NAME)
            .field("refcount", &self.refcount())
            .field("inner", &self.inner)
            .finish()
    }
}

/// `IUnknown::QueryInterface` trampoline for class `C`.
pub unsafe extern "system" fn query_interface<C: ProxyClass>(
    this: *mut Proxy<C>,
    iid: *const Guid,
    out: *mut *mut c_void,
) -> i32 {
    if out.is_null() {
        return HResult::E_POINTER.0;
    }
    if this.is_null() || iid.is_null() {
        *out = ptr::null_mut();
        return HResult::E_POINTER.0;
    }
    let iid = &*iid;
    if *iid == IID_IUNKNOWN || C::IIDS.contains(iid) {
        (*this).add_ref();
        *out = this.cast();
        return HResult::S_OK.0;
    }

    let hr = (*this).inner.forward_query_interface(iid, out);
    if hr.failed() {
        tracing::debug!(class = C::NAME, %iid, %hr, "interface not supported");
        *out = ptr::null_mut();
    }
    hr.0
}

pub unsafe extern "system" fn add_ref<C: ProxyClass>(this: *mut Proxy<C>) -> u32 {
    if this.is_null() {
        return 0;
    }
    (*this).add_ref()
}

pub unsafe extern "system" fn release<C: ProxyClass>(this: *mut Proxy<C>) -> u32 {
    if this.is_null() {
        return 0;
    }
    Proxy::release(this)
}

/// Recognise one of our proxies by its vtable pointer.
///
/// Returns `None` for null and for any object of another class, without
/// touching anything past the candidate's first word.
///
/// # Safety
///
/// `candidate` must be null or point to a live COM object.
pub unsafe fn resolve_proxy<'a, C: ProxyClass>(candidate: *mut c_void) -> Option<&'a Proxy<C>> {
    if unknown::vtable_of(candidate) != C::vtable() || C::vtable().is_null() {
        return None;
    }
    Some(&*(candidate as *const Proxy<C>))
}

/// An owned reference to a proxy. Cloning is AddRef, dropping is Release.
pub struct ProxyRef<C: ProxyClass> {
    ptr: NonNull<Proxy<C>>,
    _marker: PhantomData<Proxy<C>>,
}

// The count is atomic and C is Send + Sync.
unsafe impl<C: ProxyClass> Send for ProxyRef<C> {}
unsafe impl<C: ProxyClass> Sync for ProxyRef<C> {}

impl<C: ProxyClass> ProxyRef<C> {
    /// Hand the reference to the other side as a raw interface pointer.
    pub fn into_raw(self) -> *mut c_void {
        let raw = self.ptr.as_ptr().cast();
        std::mem::forget(self);
        raw
    }

    /// Take back a reference previously given out with [`into_raw`](Self::into_raw)
    /// or obtained through `QueryInterface`/`AddRef`.
    ///
    /// # Safety
    ///
    /// `raw` must be a proxy of class `C` and the caller must own one reference.
    pub unsafe fn from_raw(raw: *mut c_void) -> Option<Self> {
        NonNull::new(raw.cast::<Proxy<C>>()).map(|ptr| Self {
            ptr,
            _marker: PhantomData,
        })
    }

    /// Like [`resolve_proxy`], but takes a new reference on success.
    ///
    /// # Safety
    ///
    /// `candidate` must be null or point to a live COM object.
    pub unsafe fn resolve(candidate: *mut c_void) -> Option<Self> {
        let proxy = resolve_proxy::<C>(candidate)?;
        proxy.add_ref();
        Self::from_raw(candidate)
    }

    pub fn as_raw(&self) -> *mut c_void {
        self.ptr.as_ptr().cast()
    }

    pub fn proxy(&self) -> &Proxy<C> {
        // SAFETY: we hold a reference, so the proxy is alive.
        unsafe { self.ptr.as_ref() }
    }

    pub fn inner(&self) -> &C {
        &self.proxy().inner
    }
}

impl<C: ProxyClass> Clone for ProxyRef<C> {
    fn clone(&self) -> Self {
        self.proxy().add_ref();
        Self {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }
}

impl<C: ProxyClass> Drop for ProxyRef<C> {
    fn drop(&mut self) {
        // SAFETY: we own exactly one reference.
        unsafe { Proxy::release(self.ptr.as_ptr()) };
    }
}

impl<C: ProxyClass> fmt::Debug for ProxyRef<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyRef")
            .field("class", &C::NAME)
            .field("ptr", &self.ptr)
            .field("refcount", &self.proxy().refcount())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unknown::{fake::Foreign, VTable};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    const IID_ITEST: Guid = Guid::from_u128(0x11111111_2222_3333_4444_555555555555);
    const IID_OTHER: Guid = Guid::from_u128(0x99999999_2222_3333_4444_555555555555);

    struct Counted {
        released: Arc<AtomicUsize>,
    }

    static COUNTED_VTABLE: VTable<3> = VTable([
        query_interface::<Counted> as *const c_void,
        add_ref::<Counted> as *const c_void,
        release::<Counted> as *const c_void,
    ]);

    unsafe impl ProxyClass for Counted {
        const NAME: &'static str = "Counted";
        const IIDS: &'static [Guid] = &[IID_ITEST];

        fn vtable() -> *const *const c_void {
            COUNTED_VTABLE.as_ptr()
        }

        fn release_underlying(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counted() -> (ProxyRef<Counted>, Arc<AtomicUsize>) {
        let released = Arc::new(AtomicUsize::new(0));
        let proxy = Proxy::create(Counted {
            released: released.clone(),
        });
        (proxy, released)
    }

    #[test]
    fn test_n_addrefs_then_n_plus_one_releases() {
        let (proxy, released) = counted();
        let raw = proxy.into_raw();
        unsafe {
            for i in 0..5 {
                assert_eq!(add_ref::<Counted>(raw.cast()), i + 2);
            }
            for _ in 0..5 {
                release::<Counted>(raw.cast());
                assert_eq!(released.load(Ordering::SeqCst), 0);
            }
            assert_eq!(release::<Counted>(raw.cast()), 0);
        }
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_clone_and_drop() {
        let (proxy, released) = counted();
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let local = proxy.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let extra = local.clone();
                        drop(extra);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(proxy.proxy().refcount(), 1);
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(proxy);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_query_interface_rules() {
        let (proxy, _released) = counted();
        let raw = proxy.as_raw().cast::<Proxy<Counted>>();
        let mut out = ptr::null_mut();
        unsafe {
            assert_eq!(query_interface::<Counted>(raw, &IID_ITEST, &mut out), 0);
            assert_eq!(out, raw.cast());
            assert_eq!(proxy.proxy().refcount(), 2);
            release::<Counted>(raw);

            out = 0x1234 as *mut c_void;
            let hr = query_interface::<Counted>(raw, &IID_OTHER, &mut out);
            assert_eq!(HResult(hr), HResult::E_NOINTERFACE);
            assert!(out.is_null());

            let hr = query_interface::<Counted>(raw, &IID_IUNKNOWN, ptr::null_mut());
            assert_eq!(HResult(hr), HResult::E_POINTER);
        }
        assert_eq!(proxy.proxy().refcount(), 1);
    }

    #[test]
    fn test_identity_check_rejects_foreign_and_null() {
        let (proxy, _released) = counted();
        let foreign = Foreign::new();
        unsafe {
            assert!(resolve_proxy::<Counted>(proxy.as_raw()).is_some());
            assert!(resolve_proxy::<Counted>(foreign.as_raw()).is_none());
            assert!(resolve_proxy::<Counted>(ptr::null_mut()).is_none());
            assert!(ProxyRef::<Counted>::resolve(foreign.as_raw()).is_none());

            let again = ProxyRef::<Counted>::resolve(proxy.as_raw()).unwrap();
            assert_eq!(again.proxy().refcount(), 2);
        }
        // The foreign object was never touched.
        assert_eq!(foreign.refs.load(Ordering::SeqCst), 1);
    }

    struct Cascading {
        self_raw: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
    }

    static CASCADING_VTABLE: VTable<3> = VTable([
        query_interface::<Cascading> as *const c_void,
        add_ref::<Cascading> as *const c_void,
        release::<Cascading> as *const c_void,
    ]);

    unsafe impl ProxyClass for Cascading {
        const NAME: &'static str = "Cascading";
        const IIDS: &'static [Guid] = &[];

        fn vtable() -> *const *const c_void {
            CASCADING_VTABLE.as_ptr()
        }

        fn release_underlying(&self) {
            // A teardown that calls back into the dying proxy.
            let raw = self.self_raw.load(Ordering::SeqCst) as *mut Proxy<Cascading>;
            unsafe {
                add_ref::<Cascading>(raw);
                release::<Cascading>(raw);
            }
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_reentrant_release_during_teardown_destroys_once() {
        let self_raw = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicUsize::new(0));
        let proxy = Proxy::create(Cascading {
            self_raw: self_raw.clone(),
            released: released.clone(),
        });
        self_raw.store(proxy.as_raw() as usize, Ordering::SeqCst);
        drop(proxy);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
