//! Guest side: `IDXGIDevice2` and surface proxies
//!
//! A device proxy counts its own references and holds one reference on the
//! host wrapper, dropped when the proxy dies. Interfaces the proxy does not
//! implement are asked of the child layer (the D3D device sharing the
//! object), then reported to the host for diagnostics.

use std::ffi::c_void;
use std::sync::{Mutex, MutexGuard};

use openthunk_com::proxy::{add_ref, query_interface, release};
use openthunk_com::{resolve_proxy, ForeignRef, Proxy, ProxyClass, ProxyRef, VTable};
use openthunk_common::addr::GuestAddr;
use openthunk_common::error::AddrError;
use openthunk_common::win::{Bool, Guid, HResult, FALSE};
use openthunk_dispatch::CallEnvelope;
use openthunk_layout::{GuestSharedResource, SurfaceDesc};

use super::private::PrivateStore;
use super::{
    Call, GuestSurfaceRecord, IID_IDXGIDEVICE, IID_IDXGIDEVICE1, IID_IDXGIDEVICE2,
    IID_IDXGIOBJECT,
};
use crate::{bool_from_slot, GuestCallError, GuestSide};

fn syscall(side: &GuestSide, call: Call, args: &[u64]) -> Result<CallEnvelope, GuestCallError> {
    let mut envelope = CallEnvelope::new(call.id());
    for (i, &arg) in args.iter().enumerate() {
        envelope.set_arg(i, arg);
    }
    side.syscall(&mut envelope)?;
    Ok(envelope)
}

/// Module-level guest entry points.
#[derive(Debug, Clone)]
pub struct DxgiGuest {
    side: GuestSide,
}

impl DxgiGuest {
    pub fn new(side: GuestSide) -> Self {
        Self { side }
    }

    /// Tell the host which guest function to run when a device wrapper dies.
    pub fn register_callbacks(&self, device_destroy: GuestAddr) -> Bool {
        syscall(&self.side, Call::SetGuestCallbacks, &[u64::from(device_destroy.get())])
            .map(|c| bool_from_slot(c.result()))
            .unwrap_or(FALSE)
    }

    /// Build the guest proxy for the host device wrapper `handle`, taking a
    /// host reference for it.
    pub fn attach(
        &self,
        handle: u32,
        adapter: ForeignRef,
        child_layer: Option<ForeignRef>,
    ) -> Result<ProxyRef<GuestDevice>, HResult> {
        let envelope = syscall(&self.side, Call::AddRef, &[u64::from(handle)])
            .map_err(|e| e.hresult())?;
        if envelope.result() == 0 {
            return Err(HResult::E_INVALIDARG);
        }
        Ok(Proxy::create(GuestDevice {
            side: self.side.clone(),
            handle,
            adapter,
            child_layer,
            private: Mutex::new(PrivateStore::new()),
        }))
    }
}

pub struct GuestDevice {
    side: GuestSide,
    handle: u32,
    adapter: ForeignRef,
    child_layer: Option<ForeignRef>,
    private: Mutex<PrivateStore>,
}

/// Guest handles of our surface proxies. `None` if any entry is null or
/// some other object.
///
/// # Safety
///
/// Every entry must be null or a live COM object.
unsafe fn surface_handles(resources: &[*mut c_void]) -> Option<Vec<u32>> {
    resources
        .iter()
        .map(|&r| resolve_proxy::<GuestSurface>(r).map(|p| p.inner().handle))
        .collect()
}

impl GuestDevice {
    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn private_data(&self) -> MutexGuard<'_, PrivateStore> {
        self.private.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn call(&self, call: Call, args: &[u64]) -> Result<CallEnvelope, GuestCallError> {
        let mut all = Vec::with_capacity(args.len() + 1);
        all.push(u64::from(self.handle));
        all.extend_from_slice(args);
        syscall(&self.side, call, &all)
    }

    fn hresult_call(&self, call: Call, args: &[u64]) -> HResult {
        self.call(call, args)
            .map(|c| c.hresult())
            .unwrap_or_else(|e| e.hresult())
    }

    /// The parent of a device is its adapter.
    pub fn get_parent(&self, iid: &Guid, out: *mut *mut c_void) -> HResult {
        self.adapter.query_interface(iid, out)
    }

    pub fn get_adapter(&self) -> Result<ForeignRef, HResult> {
        let hr = self.hresult_call(Call::GetAdapter, &[]);
        if hr.failed() {
            return Err(hr);
        }
        Ok(self.adapter.clone())
    }

    pub fn create_surface(
        &self,
        desc: Option<&SurfaceDesc>,
        count: u32,
        usage: u32,
        shared: Option<&GuestSharedResource>,
    ) -> Result<Vec<ProxyRef<GuestSurface>>, HResult> {
        let Some(desc) = desc else {
            return Err(HResult::E_INVALIDARG);
        };
        let envelope = self
            .request_surfaces(desc, count, usage, shared)
            .map_err(|e| e.hresult())?;
        let hr = envelope.hresult();
        if hr.failed() {
            return Err(hr);
        }
        let array = GuestAddr::new(envelope.arg(5) as u32);
        if array.is_null() {
            return Ok(Vec::new());
        }
        self.adopt_surfaces(array, count).map_err(|e| {
            tracing::error!("surface records unreadable: {e}");
            HResult::E_FAIL
        })
    }

    fn request_surfaces(
        &self,
        desc: &SurfaceDesc,
        count: u32,
        usage: u32,
        shared: Option<&GuestSharedResource>,
    ) -> Result<CallEnvelope, GuestCallError> {
        self.side.scratch(Some(desc), |desc| {
            self.side.scratch(shared, |shared| {
                self.call(
                    Call::CreateSurface,
                    &[
                        u64::from(desc.get()),
                        u64::from(count),
                        u64::from(usage),
                        u64::from(shared.get()),
                    ],
                )
            })
        })??
    }

    /// Wrap the records the host handed back, then free the array it
    /// allocated for us.
    ///
    /// If any record is unreadable the call fails as a whole; the surfaces
    /// that could be read are released again on the way out.
    fn adopt_surfaces(
        &self,
        array: GuestAddr,
        count: u32,
    ) -> Result<Vec<ProxyRef<GuestSurface>>, AddrError> {
        let arena = self.side.arena();
        let records = match arena.read_array::<u32>(array, count as usize) {
            Ok(records) => records,
            Err(e) => {
                let _ = arena.free(array);
                return Err(e);
            }
        };
        let mut surfaces = Vec::with_capacity(records.len());
        let mut failure = None;
        for record in records {
            let record = GuestAddr::new(record);
            match arena.read::<GuestSurfaceRecord>(record) {
                Ok(GuestSurfaceRecord { handle, .. }) => surfaces.push(Proxy::create(GuestSurface {
                    side: self.side.clone(),
                    handle,
                    record,
                })),
                Err(e) => {
                    tracing::error!(?record, "surface record unreadable: {e}");
                    failure.get_or_insert(e);
                }
            }
        }
        let freed = arena.free(array);
        if let Some(e) = failure {
            drop(surfaces);
            return Err(e);
        }
        freed?;
        Ok(surfaces)
    }

    /// # Safety
    ///
    /// Every entry of `resources` must be null or a live COM object.
    pub unsafe fn query_resource_residency(
        &self,
        resources: &[*mut c_void],
    ) -> Result<Vec<u32>, HResult> {
        let Some(handles) = surface_handles(resources) else {
            return Err(HResult::E_INVALIDARG);
        };
        let result = self.with_handles(&handles, |array| {
            let (envelope, residency) = self.side.out_array::<u32, _>(handles.len(), |out| {
                self.call(
                    Call::QueryResourceResidency,
                    &[
                        u64::from(array.get()),
                        u64::from(out.get()),
                        handles.len() as u64,
                    ],
                )
            })?;
            Ok::<_, GuestCallError>((envelope?, residency))
        });
        match result {
            Ok((envelope, residency)) if envelope.hresult().succeeded() => Ok(residency),
            Ok((envelope, _)) => Err(envelope.hresult()),
            Err(e) => Err(e.hresult()),
        }
    }

    fn with_handles<R>(
        &self,
        handles: &[u32],
        f: impl FnOnce(GuestAddr) -> Result<R, GuestCallError>,
    ) -> Result<R, GuestCallError> {
        if handles.is_empty() {
            return f(GuestAddr::NULL);
        }
        let arena = self.side.arena();
        let array = arena.alloc_array(handles)?;
        let ret = f(array);
        arena.free(array)?;
        ret
    }

    pub fn set_gpu_thread_priority(&self, priority: i32) -> HResult {
        self.hresult_call(Call::SetGpuThreadPriority, &[u64::from(priority as u32)])
    }

    pub fn gpu_thread_priority(&self) -> Result<i32, HResult> {
        let envelope = self
            .call(Call::GetGpuThreadPriority, &[])
            .map_err(|e| e.hresult())?;
        match envelope.hresult() {
            hr if hr.failed() => Err(hr),
            _ => Ok(envelope.arg(1) as u32 as i32),
        }
    }

    pub fn set_maximum_frame_latency(&self, latency: u32) -> HResult {
        self.hresult_call(Call::SetMaximumFrameLatency, &[u64::from(latency)])
    }

    pub fn maximum_frame_latency(&self) -> Result<u32, HResult> {
        let envelope = self
            .call(Call::GetMaximumFrameLatency, &[])
            .map_err(|e| e.hresult())?;
        match envelope.hresult() {
            hr if hr.failed() => Err(hr),
            _ => Ok(envelope.arg(1) as u32),
        }
    }

    /// # Safety
    ///
    /// Every entry of `resources` must be null or a live COM object.
    pub unsafe fn offer_resources(&self, resources: &[*mut c_void], priority: u32) -> HResult {
        let Some(handles) = surface_handles(resources) else {
            return HResult::E_INVALIDARG;
        };
        self.with_handles(&handles, |array| {
            self.call(
                Call::OfferResources,
                &[handles.len() as u64, u64::from(array.get()), u64::from(priority)],
            )
        })
        .map(|c| c.hresult())
        .unwrap_or_else(|e| e.hresult())
    }

    /// # Safety
    ///
    /// Every entry of `resources` must be null or a live COM object.
    pub unsafe fn reclaim_resources(&self, resources: &[*mut c_void]) -> Result<Vec<Bool>, HResult> {
        let Some(handles) = surface_handles(resources) else {
            return Err(HResult::E_INVALIDARG);
        };
        let result = self.with_handles(&handles, |array| {
            let (envelope, discarded) = self.side.out_array::<Bool, _>(handles.len(), |out| {
                self.call(
                    Call::ReclaimResources,
                    &[handles.len() as u64, u64::from(array.get()), u64::from(out.get())],
                )
            })?;
            Ok::<_, GuestCallError>((envelope?, discarded))
        });
        match result {
            Ok((envelope, discarded)) if envelope.hresult().succeeded() => Ok(discarded),
            Ok((envelope, _)) => Err(envelope.hresult()),
            Err(e) => Err(e.hresult()),
        }
    }

    pub fn enqueue_set_event(&self, event: u32) -> HResult {
        self.hresult_call(Call::EnqueueSetEvent, &[u64::from(event)])
    }
}

impl std::fmt::Debug for GuestDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestDevice")
            .field("handle", &self.handle)
            .field("adapter", &self.adapter)
            .field("child_layer", &self.child_layer)
            .finish_non_exhaustive()
    }
}

type Device = *mut Proxy<GuestDevice>;

unsafe extern "system" fn set_private_data(
    this: Device,
    guid: *const Guid,
    size: u32,
    data: *const c_void,
) -> i32 {
    if this.is_null() || guid.is_null() {
        return HResult::E_INVALIDARG.0;
    }
    let data = (!data.is_null()).then(|| std::slice::from_raw_parts(data.cast::<u8>(), size as usize));
    (*this).inner().private_data().set(*guid, data).0
}

unsafe extern "system" fn set_private_data_interface(
    this: Device,
    guid: *const Guid,
    object: *mut c_void,
) -> i32 {
    if this.is_null() || guid.is_null() {
        return HResult::E_INVALIDARG.0;
    }
    let object = ForeignRef::add_ref_raw(object);
    (*this).inner().private_data().set_interface(*guid, object).0
}

unsafe extern "system" fn get_private_data(
    this: Device,
    guid: *const Guid,
    size: *mut u32,
    data: *mut c_void,
) -> i32 {
    if this.is_null() || guid.is_null() || size.is_null() {
        return HResult::E_INVALIDARG.0;
    }
    let out = (!data.is_null()).then(|| std::slice::from_raw_parts_mut(data.cast::<u8>(), *size as usize));
    (*this).inner().private_data().get(&*guid, &mut *size, out).0
}

unsafe extern "system" fn get_parent(this: Device, iid: *const Guid, out: *mut *mut c_void) -> i32 {
    if out.is_null() {
        return HResult::E_POINTER.0;
    }
    if this.is_null() || iid.is_null() {
        *out = std::ptr::null_mut();
        return HResult::E_INVALIDARG.0;
    }
    (*this).inner().get_parent(&*iid, out).0
}

unsafe extern "system" fn get_adapter(this: Device, out: *mut *mut c_void) -> i32 {
    if this.is_null() || out.is_null() {
        return HResult::E_INVALIDARG.0;
    }
    match (*this).inner().get_adapter() {
        Ok(adapter) => {
            *out = adapter.to_raw_add_ref();
            HResult::S_OK.0
        }
        Err(hr) => hr.0,
    }
}

unsafe extern "system" fn create_surface(
    this: Device,
    desc: *const SurfaceDesc,
    count: u32,
    usage: u32,
    shared: *const GuestSharedResource,
    out: *mut *mut c_void,
) -> i32 {
    if this.is_null() || (out.is_null() && count != 0) {
        return HResult::E_INVALIDARG.0;
    }
    match (*this)
        .inner()
        .create_surface(desc.as_ref(), count, usage, shared.as_ref())
    {
        Ok(surfaces) => {
            for (i, surface) in surfaces.into_iter().enumerate() {
                *out.add(i) = surface.into_raw();
            }
            HResult::S_OK.0
        }
        Err(hr) => hr.0,
    }
}

unsafe fn resource_slice<'a>(resources: *const *mut c_void, count: u32) -> Option<&'a [*mut c_void]> {
    if count == 0 {
        return Some(&[]);
    }
    (!resources.is_null()).then(|| std::slice::from_raw_parts(resources, count as usize))
}

unsafe extern "system" fn query_resource_residency(
    this: Device,
    resources: *const *mut c_void,
    residency: *mut u32,
    count: u32,
) -> i32 {
    let Some(resources) = resource_slice(resources, count) else {
        return HResult::E_INVALIDARG.0;
    };
    if this.is_null() || (residency.is_null() && count != 0) {
        return HResult::E_INVALIDARG.0;
    }
    match (*this).inner().query_resource_residency(resources) {
        Ok(values) => {
            for (i, value) in values.into_iter().enumerate() {
                *residency.add(i) = value;
            }
            HResult::S_OK.0
        }
        Err(hr) => hr.0,
    }
}

unsafe extern "system" fn set_gpu_thread_priority(this: Device, priority: i32) -> i32 {
    if this.is_null() {
        return HResult::E_INVALIDARG.0;
    }
    (*this).inner().set_gpu_thread_priority(priority).0
}

unsafe extern "system" fn get_gpu_thread_priority(this: Device, priority: *mut i32) -> i32 {
    if this.is_null() || priority.is_null() {
        return HResult::E_INVALIDARG.0;
    }
    match (*this).inner().gpu_thread_priority() {
        Ok(value) => {
            *priority = value;
            HResult::S_OK.0
        }
        Err(hr) => hr.0,
    }
}

unsafe extern "system" fn set_maximum_frame_latency(this: Device, latency: u32) -> i32 {
    if this.is_null() {
        return HResult::E_INVALIDARG.0;
    }
    (*this).inner().set_maximum_frame_latency(latency).0
}

unsafe extern "system" fn get_maximum_frame_latency(this: Device, latency: *mut u32) -> i32 {
    if this.is_null() || latency.is_null() {
        return HResult::E_INVALIDARG.0;
    }
    match (*this).inner().maximum_frame_latency() {
        Ok(value) => {
            *latency = value;
            HResult::S_OK.0
        }
        Err(hr) => hr.0,
    }
}

unsafe extern "system" fn offer_resources(
    this: Device,
    count: u32,
    resources: *const *mut c_void,
    priority: u32,
) -> i32 {
    match resource_slice(resources, count) {
        Some(resources) if !this.is_null() => (*this).inner().offer_resources(resources, priority).0,
        _ => HResult::E_INVALIDARG.0,
    }
}

unsafe extern "system" fn reclaim_resources(
    this: Device,
    count: u32,
    resources: *const *mut c_void,
    discarded: *mut Bool,
) -> i32 {
    let Some(resources) = resource_slice(resources, count) else {
        return HResult::E_INVALIDARG.0;
    };
    if this.is_null() {
        return HResult::E_INVALIDARG.0;
    }
    match (*this).inner().reclaim_resources(resources) {
        Ok(values) => {
            if !discarded.is_null() {
                for (i, value) in values.into_iter().enumerate() {
                    *discarded.add(i) = value;
                }
            }
            HResult::S_OK.0
        }
        Err(hr) => hr.0,
    }
}

unsafe extern "system" fn enqueue_set_event(this: Device, event: u32) -> i32 {
    if this.is_null() {
        return HResult::E_INVALIDARG.0;
    }
    (*this).inner().enqueue_set_event(event).0
}

static DEVICE_VTABLE: VTable<17> = VTable([
    query_interface::<GuestDevice> as *const c_void,
    add_ref::<GuestDevice> as *const c_void,
    release::<GuestDevice> as *const c_void,
    set_private_data as *const c_void,
    set_private_data_interface as *const c_void,
    get_private_data as *const c_void,
    get_parent as *const c_void,
    get_adapter as *const c_void,
    create_surface as *const c_void,
    query_resource_residency as *const c_void,
    set_gpu_thread_priority as *const c_void,
    get_gpu_thread_priority as *const c_void,
    set_maximum_frame_latency as *const c_void,
    get_maximum_frame_latency as *const c_void,
    offer_resources as *const c_void,
    reclaim_resources as *const c_void,
    enqueue_set_event as *const c_void,
]);

unsafe impl ProxyClass for GuestDevice {
    const NAME: &'static str = "IDXGIDevice2";
    const IIDS: &'static [Guid] = &[
        IID_IDXGIOBJECT,
        IID_IDXGIDEVICE,
        IID_IDXGIDEVICE1,
        IID_IDXGIDEVICE2,
    ];

    fn vtable() -> *const *const c_void {
        DEVICE_VTABLE.as_ptr()
    }

    fn release_underlying(&self) {
        if let Err(e) = self.call(Call::Release, &[]) {
            tracing::error!(handle = self.handle, "device release not delivered: {e}");
        }
    }

    fn forward_query_interface(&self, iid: &Guid, out: *mut *mut c_void) -> HResult {
        if let Some(child) = &self.child_layer {
            tracing::trace!(%iid, "forwarding to the child layer");
            return child.query_interface(iid, out);
        }
        // The host only logs what it would have answered.
        let _ = self
            .side
            .scratch(Some(iid), |iid| self.call(Call::QueryInterface, &[u64::from(iid.get())]));
        // SAFETY: the trampoline checked `out`.
        unsafe { *out = std::ptr::null_mut() };
        HResult::E_NOINTERFACE
    }
}

/// A surface created through [`GuestDevice::create_surface`].
pub struct GuestSurface {
    side: GuestSide,
    handle: u32,
    record: GuestAddr,
}

impl GuestSurface {
    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn record(&self) -> GuestAddr {
        self.record
    }
}

impl std::fmt::Debug for GuestSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestSurface")
            .field("handle", &self.handle)
            .field("record", &self.record)
            .finish()
    }
}

static SURFACE_VTABLE: VTable<3> = VTable([
    query_interface::<GuestSurface> as *const c_void,
    add_ref::<GuestSurface> as *const c_void,
    release::<GuestSurface> as *const c_void,
]);

unsafe impl ProxyClass for GuestSurface {
    const NAME: &'static str = "IDXGISurface";
    const IIDS: &'static [Guid] = &[];

    fn vtable() -> *const *const c_void {
        SURFACE_VTABLE.as_ptr()
    }

    fn release_underlying(&self) {
        if let Err(e) = syscall(&self.side, Call::SurfaceRelease, &[u64::from(self.handle)]) {
            tracing::error!(handle = self.handle, "surface release not delivered: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dxgi::fake::{ComObject, FakeDevice, IID_IDXGIADAPTER, IID_ID3D11DEVICE};
    use crate::dxgi::{DxgiHost, DXGI_ERROR_NOT_FOUND};
    use crate::test_support;
    use openthunk_com::unknown;
    use openthunk_common::win::IID_IUNKNOWN;
    use openthunk_dispatch::{Dispatcher, GuestFunctions};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct Setup {
        host: Arc<DxgiHost>,
        guest: DxgiGuest,
        funcs: Arc<GuestFunctions>,
        device: Arc<FakeDevice>,
        handle: u32,
        adapter: Box<ComObject>,
    }

    fn setup() -> Setup {
        let (ops, funcs) = test_support::ops();
        let arena = ops.arena_arc().clone();
        let host = Arc::new(DxgiHost::new(ops));
        let dispatcher = Dispatcher::builder()
            .register(host.table().unwrap())
            .unwrap()
            .build()
            .unwrap();
        let guest = DxgiGuest::new(GuestSide::new(Arc::new(dispatcher), arena));
        let device = FakeDevice::new();
        let handle = host.wrap_device(device.clone()).unwrap();
        Setup {
            host,
            guest,
            funcs,
            device,
            handle,
            adapter: ComObject::new(),
        }
    }

    fn attach(s: &Setup, child: Option<ForeignRef>) -> ProxyRef<GuestDevice> {
        let adapter = unsafe { ForeignRef::add_ref_raw(s.adapter.as_raw()) }.unwrap();
        s.guest.attach(s.handle, adapter, child).unwrap()
    }

    #[test]
    fn test_directly_answered_interfaces() {
        let s = setup();
        let device = attach(&s, None);
        for iid in [IID_IUNKNOWN, IID_IDXGIOBJECT, IID_IDXGIDEVICE, IID_IDXGIDEVICE1, IID_IDXGIDEVICE2] {
            let mut out = std::ptr::null_mut();
            let hr = unsafe { unknown::query_interface(device.as_raw(), &iid, &mut out) };
            assert_eq!(hr, HResult::S_OK);
            assert_eq!(out, device.as_raw());
            unsafe { unknown::release(out) };
        }
        // Unknown to the proxy and no child layer; the host is only asked.
        let mut out = 0x1 as *mut c_void;
        let hr = unsafe { unknown::query_interface(device.as_raw(), &IID_ID3D11DEVICE, &mut out) };
        assert_eq!(hr, HResult::E_NOINTERFACE);
        assert!(out.is_null());
        assert_eq!(device.proxy().refcount(), 1);
    }

    #[test]
    fn test_child_layer_answers_unknown_ids() {
        let s = setup();
        let child = ComObject::new();
        let device = attach(&s, unsafe { ForeignRef::add_ref_raw(child.as_raw()) });
        let mut out = std::ptr::null_mut();
        let hr = unsafe { unknown::query_interface(device.as_raw(), &IID_IUNKNOWN, &mut out) };
        // IUnknown is ours.
        assert_eq!((hr, out), (HResult::S_OK, device.as_raw()));
        unsafe { unknown::release(out) };

        let hr = unsafe { unknown::query_interface(device.as_raw(), &IID_IDXGIADAPTER, &mut out) };
        assert_eq!((hr, out), (HResult::S_OK, child.as_raw()));
        unsafe { unknown::release(out) };
        drop(device);
        assert_eq!(child.refs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lifetime_and_guest_destroy() {
        let s = setup();
        let destroyed = Arc::new(AtomicU32::new(0));
        let seen = destroyed.clone();
        let destroy = s
            .funcs
            .register(move |handle| {
                seen.store(handle as u32, Ordering::SeqCst);
                0
            })
            .unwrap();
        assert_eq!(s.guest.register_callbacks(destroy), 1);

        let device = attach(&s, None);
        assert_eq!(s.device.refs.load(Ordering::SeqCst), 2);
        assert_eq!(s.host.release_device(s.handle), Some(1));

        let extra = device.clone();
        drop(device);
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);
        drop(extra);
        assert_eq!(destroyed.load(Ordering::SeqCst), s.handle);
        assert_eq!(s.host.device_count(), 0);
        assert_eq!(s.adapter.refs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_attach_to_unknown_handle_fails() {
        let s = setup();
        let adapter = unsafe { ForeignRef::add_ref_raw(s.adapter.as_raw()) }.unwrap();
        assert_eq!(
            s.guest.attach(99, adapter, None).unwrap_err(),
            HResult::E_INVALIDARG
        );
    }

    #[test]
    fn test_parent_and_adapter() {
        let s = setup();
        let device = attach(&s, None);
        let mut out = std::ptr::null_mut();
        assert_eq!(device.inner().get_parent(&IID_IDXGIADAPTER, &mut out), HResult::S_OK);
        assert_eq!(out, s.adapter.as_raw());
        unsafe { unknown::release(out) };

        let adapter = device.inner().get_adapter().unwrap();
        assert_eq!(adapter.as_raw(), s.adapter.as_raw());
        drop(adapter);
        drop(device);
        assert_eq!(s.adapter.refs.load(Ordering::SeqCst), 1);
    }

    type GetPrivateFn = unsafe extern "system" fn(*mut c_void, *const Guid, *mut u32, *mut c_void) -> i32;
    type SetPrivateFn = unsafe extern "system" fn(*mut c_void, *const Guid, u32, *const c_void) -> i32;

    #[test]
    fn test_private_data_stays_in_the_guest() {
        let s = setup();
        let device = attach(&s, None);
        let key = Guid::from_u128(0x42);
        unsafe {
            let vtbl = unknown::vtable_of(device.as_raw());
            let set: SetPrivateFn = std::mem::transmute(*vtbl.add(3));
            let get: GetPrivateFn = std::mem::transmute(*vtbl.add(5));

            let data = 0xdead_beef_u32;
            let hr = set(device.as_raw(), &key, 4, (&data as *const u32).cast());
            assert_eq!(HResult(hr), HResult::S_OK);

            let mut value = 0u32;
            let mut size = 4u32;
            let hr = get(device.as_raw(), &key, &mut size, (&mut value as *mut u32).cast());
            assert_eq!(HResult(hr), HResult::S_OK);
            assert_eq!(value, 0xdead_beef);

            let hr = get(device.as_raw(), &key, std::ptr::null_mut(), std::ptr::null_mut());
            assert_eq!(HResult(hr), HResult::E_INVALIDARG);

            let other = Guid::from_u128(0x43);
            let hr = get(device.as_raw(), &other, &mut size, std::ptr::null_mut());
            assert_eq!(HResult(hr), DXGI_ERROR_NOT_FOUND);
        }
        assert_eq!(device.inner().private_data().len(), 1);
    }

    #[test]
    fn test_surfaces_round_trip_through_the_host() {
        let s = setup();
        let device = attach(&s, None);
        let desc = SurfaceDesc {
            width: 16,
            height: 16,
            format: 87,
            sample_count: 1,
            sample_quality: 0,
        };
        let arena_live = s.host_live();
        let surfaces = device
            .inner()
            .create_surface(Some(&desc), 3, 0, None)
            .unwrap();
        assert_eq!(surfaces.len(), 3);
        assert_eq!(s.host.surface_count(), 3);
        // One record per surface; the array went back to the guest heap.
        assert_eq!(s.host_live(), arena_live + 3);

        let raw: Vec<*mut c_void> = surfaces.iter().map(|p| p.as_raw()).collect();
        let residency = unsafe { device.inner().query_resource_residency(&raw) }.unwrap();
        assert_eq!(residency.len(), 3);
        assert_eq!(unsafe { device.inner().offer_resources(&raw, 2) }, HResult::S_OK);
        assert_eq!(s.device.offered.load(Ordering::SeqCst), 3);
        let discarded = unsafe { device.inner().reclaim_resources(&raw) }.unwrap();
        assert_eq!(discarded.len(), 3);

        let foreign = ComObject::new();
        let mixed = [raw[0], foreign.as_raw()];
        assert_eq!(
            unsafe { device.inner().offer_resources(&mixed, 2) },
            HResult::E_INVALIDARG
        );
        assert_eq!(
            unsafe { device.inner().query_resource_residency(&[std::ptr::null_mut()]) }.unwrap_err(),
            HResult::E_INVALIDARG
        );

        drop(surfaces);
        assert_eq!(s.host.surface_count(), 0);
        assert_eq!(s.device.live_surfaces(), 0);
        assert_eq!(s.host_live(), arena_live);
    }

    #[test]
    fn test_unreadable_surface_record_releases_the_others() {
        let s = setup();
        let device = attach(&s, None);
        let desc = SurfaceDesc {
            width: 8,
            height: 8,
            ..SurfaceDesc::default()
        };
        let live = s.host_live();
        let envelope = device.inner().request_surfaces(&desc, 3, 0, None).unwrap();
        assert_eq!(envelope.hresult(), HResult::S_OK);
        let array = GuestAddr::new(envelope.arg(5) as u32);
        let arena = s.guest.side.arena();
        arena
            .write(GuestAddr::new(array.get() + 4), &0xffff_0000u32)
            .unwrap();

        assert!(device.inner().adopt_surfaces(array, 3).is_err());
        assert!(!arena.is_live(array));
        // Only the surface whose record went missing is still held.
        assert_eq!(s.host.surface_count(), 1);
        assert_eq!(s.device.live_surfaces(), 1);
        assert_eq!(s.host_live(), live + 1);
    }

    #[test]
    fn test_zero_surfaces() {
        let s = setup();
        let device = attach(&s, None);
        let desc = SurfaceDesc {
            width: 1,
            height: 1,
            ..SurfaceDesc::default()
        };
        let surfaces = device.inner().create_surface(Some(&desc), 0, 0, None).unwrap();
        assert!(surfaces.is_empty());
        assert_eq!(
            device.inner().create_surface(None, 1, 0, None).unwrap_err(),
            HResult::E_INVALIDARG
        );
    }

    #[test]
    fn test_scalar_methods() {
        let s = setup();
        let device = attach(&s, None);
        let d = device.inner();
        assert_eq!(d.set_gpu_thread_priority(-2), HResult::S_OK);
        assert_eq!(d.gpu_thread_priority(), Ok(-2));
        assert_eq!(d.maximum_frame_latency(), Ok(3));
        assert_eq!(d.set_maximum_frame_latency(1), HResult::S_OK);
        assert_eq!(d.maximum_frame_latency(), Ok(1));
        assert_eq!(d.enqueue_set_event(0xffff_fffe), HResult::S_OK);
        assert_eq!(*s.device.events.lock().unwrap(), vec![-2]);
    }

    impl Setup {
        fn host_live(&self) -> usize {
            self.guest.side.arena().live_allocations()
        }
    }
}
