//! Host side of the device wrapper

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use openthunk_common::addr::{handle_to_host, GuestAddr};
use openthunk_common::error::AddrError;
use openthunk_common::handle::HandleTable;
use openthunk_common::win::{Bool, Guid, HResult, FALSE, TRUE};
use openthunk_dispatch::{CallEnvelope, HostOps, ModuleTable, RegistrationError};
use openthunk_layout::{GuestSharedResource, LayoutPair, SharedResource, SurfaceDesc};

use super::{Call, GuestSurfaceRecord, MODULE_ID, MODULE_NAME};

/// The real device. Implementations own their reference counting; the
/// wrapper holds exactly the references it was given or took.
pub trait HostDevice: Send + Sync {
    fn add_ref(&self) -> u32;
    fn release(&self) -> u32;
    /// Whether the device answers `iid`. Any reference taken is already dropped.
    fn query_interface(&self, iid: &Guid) -> HResult;
    /// Identity of the adapter the device was created on.
    fn adapter(&self) -> Result<u64, HResult>;
    fn create_surfaces(
        &self,
        desc: &SurfaceDesc,
        count: u32,
        usage: u32,
        shared: Option<&SharedResource>,
    ) -> Result<Vec<Arc<dyn HostSurface>>, HResult>;
    fn query_resource_residency(
        &self,
        resources: &[Arc<dyn HostSurface>],
    ) -> Result<Vec<u32>, HResult>;
    fn set_gpu_thread_priority(&self, priority: i32) -> HResult;
    fn gpu_thread_priority(&self) -> Result<i32, HResult>;
    fn set_maximum_frame_latency(&self, latency: u32) -> HResult;
    fn maximum_frame_latency(&self) -> Result<u32, HResult>;
    fn offer_resources(&self, resources: &[Arc<dyn HostSurface>], priority: u32) -> HResult;
    fn reclaim_resources(&self, resources: &[Arc<dyn HostSurface>]) -> Result<Vec<Bool>, HResult>;
    fn enqueue_set_event(&self, event: isize) -> HResult;
}

pub trait HostSurface: Send + Sync {
    fn id(&self) -> u64;
    fn release(&self) -> u32;
}

struct DeviceWrapper {
    host: Arc<dyn HostDevice>,
    adapter: u64,
}

struct SurfaceWrapper {
    host: Arc<dyn HostSurface>,
    record: GuestAddr,
}

pub struct DxgiHost {
    ops: HostOps,
    devices: Mutex<HandleTable<DeviceWrapper>>,
    surfaces: Mutex<HandleTable<SurfaceWrapper>>,
    guest_destroy: RwLock<Option<GuestAddr>>,
}

fn locked<T>(table: &Mutex<HandleTable<T>>) -> MutexGuard<'_, HandleTable<T>> {
    table.lock().unwrap_or_else(|e| e.into_inner())
}

impl DxgiHost {
    pub fn new(ops: HostOps) -> Self {
        Self {
            ops,
            devices: Mutex::new(HandleTable::new()),
            surfaces: Mutex::new(HandleTable::new()),
            guest_destroy: RwLock::new(None),
        }
    }

    /// Adopt one reference on `host` and return the handle the guest uses.
    pub fn wrap_device(&self, host: Arc<dyn HostDevice>) -> Result<u32, HResult> {
        let adapter = host.adapter()?;
        let Some(handle) = locked(&self.devices).insert(DeviceWrapper { host, adapter }) else {
            tracing::error!("device handle table full");
            return Err(HResult::E_OUTOFMEMORY);
        };
        tracing::debug!(handle, adapter = format_args!("{adapter:#x}"), "dxgi device wrapped");
        Ok(handle)
    }

    /// Drop the reference adopted by [`wrap_device`](Self::wrap_device).
    pub fn release_device(&self, handle: u32) -> Option<u32> {
        self.release(handle)
    }

    pub fn device_count(&self) -> usize {
        locked(&self.devices).len()
    }

    pub fn surface_count(&self) -> usize {
        locked(&self.surfaces).len()
    }

    pub fn table(self: &Arc<Self>) -> Result<ModuleTable, RegistrationError> {
        let mut table = ModuleTable::new(MODULE_ID, MODULE_NAME);
        for call in Call::ALL {
            let host = self.clone();
            table = table.entry(call.name(), move |c| host.handle(call, c))?;
        }
        Ok(table)
    }

    fn device(&self, handle: u32) -> Option<(Arc<dyn HostDevice>, u64)> {
        locked(&self.devices)
            .get(handle)
            .map(|w| (w.host.clone(), w.adapter))
    }

    fn handle(&self, call: Call, c: &mut CallEnvelope) {
        tracing::trace!(call = call.name(), "dxgi");
        if call == Call::SetGuestCallbacks {
            let ret = match c.arg_addr(0) {
                Ok(addr) if !addr.is_null() => {
                    *self.guest_destroy.write().unwrap_or_else(|e| e.into_inner()) = Some(addr);
                    TRUE
                }
                _ => FALSE,
            };
            c.set_result(ret as u32 as u64);
            return;
        }

        // Every other call names a device or surface handle first.
        let handle = match c.arg_u32(0) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(call = call.name(), "bad handle slot: {e}");
                match call {
                    Call::AddRef | Call::Release | Call::SurfaceRelease => c.set_result(0),
                    _ => c.set_hresult(HResult::E_INVALIDARG),
                }
                return;
            }
        };
        match call {
            Call::AddRef => {
                let count = self
                    .device(handle)
                    .map(|(host, _)| host.add_ref())
                    .unwrap_or(0);
                c.set_result(u64::from(count));
            }
            Call::Release => {
                let count = self.release(handle).unwrap_or(0);
                c.set_result(u64::from(count));
            }
            Call::SurfaceRelease => {
                let count = self.release_surface(handle);
                c.set_result(u64::from(count));
            }
            _ => {
                let Some((device, adapter)) = self.device(handle) else {
                    tracing::error!(call = call.name(), handle, "unknown device handle");
                    c.set_hresult(HResult::E_INVALIDARG);
                    return;
                };
                let hr = self
                    .device_call(call, c, device.as_ref(), adapter)
                    .unwrap_or_else(|e| match e {
                        AddrError::OutOfMemory(_) => {
                            tracing::warn!(call = call.name(), "out of memory");
                            HResult::E_OUTOFMEMORY
                        }
                        e => {
                            tracing::warn!(call = call.name(), "{e}");
                            HResult::E_INVALIDARG
                        }
                    });
                c.set_hresult(hr);
            }
        }
    }

    fn device_call(
        &self,
        call: Call,
        c: &mut CallEnvelope,
        device: &dyn HostDevice,
        adapter: u64,
    ) -> Result<HResult, AddrError> {
        let arena = self.ops.arena();
        Ok(match call {
            Call::QueryInterface => {
                let iid = arena.read::<Guid>(c.arg_addr(1)?)?;
                let hr = device.query_interface(&iid);
                if hr.succeeded() {
                    tracing::warn!(%iid, "host device answers an interface the wrapper does not know");
                }
                hr
            }
            Call::GetAdapter => match device.adapter() {
                Ok(current) => {
                    if current != adapter {
                        tracing::warn!(
                            expected = format_args!("{adapter:#x}"),
                            actual = format_args!("{current:#x}"),
                            "device reports a different adapter"
                        );
                    }
                    c.set_arg(1, adapter);
                    HResult::S_OK
                }
                Err(hr) => hr,
            },
            Call::CreateSurface => self.create_surface(c, device)?,
            Call::QueryResourceResidency => {
                let count = c.arg_u32(3)? as usize;
                let resources = self.resolve_surfaces(c.arg_addr(1)?, count)?;
                let Some(resources) = resources else {
                    return Ok(HResult::E_INVALIDARG);
                };
                match device.query_resource_residency(&resources) {
                    Ok(residency) => {
                        if !residency.is_empty() {
                            arena.write_array(c.arg_addr(2)?, &residency)?;
                        }
                        HResult::S_OK
                    }
                    Err(hr) => hr,
                }
            }
            Call::SetGpuThreadPriority => device.set_gpu_thread_priority(c.arg_u32(1)? as i32),
            Call::GetGpuThreadPriority => match device.gpu_thread_priority() {
                Ok(priority) => {
                    c.set_arg(1, u64::from(priority as u32));
                    HResult::S_OK
                }
                Err(hr) => hr,
            },
            Call::SetMaximumFrameLatency => device.set_maximum_frame_latency(c.arg_u32(1)?),
            Call::GetMaximumFrameLatency => match device.maximum_frame_latency() {
                Ok(latency) => {
                    c.set_arg(1, u64::from(latency));
                    HResult::S_OK
                }
                Err(hr) => hr,
            },
            Call::OfferResources => {
                let count = c.arg_u32(1)? as usize;
                match self.resolve_surfaces(c.arg_addr(2)?, count)? {
                    Some(resources) => device.offer_resources(&resources, c.arg_u32(3)?),
                    None => HResult::E_INVALIDARG,
                }
            }
            Call::ReclaimResources => {
                let count = c.arg_u32(1)? as usize;
                let Some(resources) = self.resolve_surfaces(c.arg_addr(2)?, count)? else {
                    return Ok(HResult::E_INVALIDARG);
                };
                match device.reclaim_resources(&resources) {
                    Ok(discarded) => {
                        let out = c.arg_addr(3)?;
                        if !out.is_null() && !discarded.is_empty() {
                            arena.write_array(out, &discarded)?;
                        }
                        HResult::S_OK
                    }
                    Err(hr) => hr,
                }
            }
            Call::EnqueueSetEvent => {
                device.enqueue_set_event(handle_to_host(c.arg_u32(1)?) as isize)
            }
            Call::SetGuestCallbacks | Call::AddRef | Call::Release | Call::SurfaceRelease => {
                HResult::E_NOTIMPL
            }
        })
    }

    /// Surfaces named by an array of guest surface handles. `None` when one
    /// of them is not a live surface.
    fn resolve_surfaces(
        &self,
        array: GuestAddr,
        count: usize,
    ) -> Result<Option<Vec<Arc<dyn HostSurface>>>, AddrError> {
        if count == 0 {
            return Ok(Some(Vec::new()));
        }
        let handles = self.ops.arena().read_array::<u32>(array, count)?;
        let table = locked(&self.surfaces);
        Ok(handles
            .iter()
            .map(|&h| table.get(h).map(|w| w.host.clone()))
            .collect())
    }

    fn create_surface(
        &self,
        c: &mut CallEnvelope,
        device: &dyn HostDevice,
    ) -> Result<HResult, AddrError> {
        let arena = self.ops.arena();
        let desc_addr = c.arg_addr(1)?;
        if desc_addr.is_null() {
            return Ok(HResult::E_INVALIDARG);
        }
        let desc = arena.read::<SurfaceDesc>(desc_addr)?;
        let count = c.arg_u32(2)?;
        let usage = c.arg_u32(3)?;
        let shared_addr = c.arg_addr(4)?;
        let shared = if shared_addr.is_null() {
            None
        } else {
            let guest = arena.read::<GuestSharedResource>(shared_addr)?;
            match SharedResource::to_host_layout(&guest, arena.space()) {
                Ok(shared) => Some(shared),
                Err(e) => {
                    tracing::warn!("{e}");
                    return Ok(HResult::E_INVALIDARG);
                }
            }
        };

        let created = match device.create_surfaces(&desc, count, usage, shared.as_ref()) {
            Ok(created) => created,
            Err(hr) => return Ok(hr),
        };
        c.set_arg(5, 0);
        if created.is_empty() {
            return Ok(HResult::S_OK);
        }

        let device_handle = c.arg_u32(0)?;
        let mut handles = Vec::with_capacity(created.len());
        let mut records = Vec::with_capacity(created.len());
        let mut failure = None;
        for surface in &created {
            let Some(handle) = locked(&self.surfaces).insert(SurfaceWrapper {
                host: surface.clone(),
                record: GuestAddr::NULL,
            }) else {
                failure = Some(AddrError::OutOfMemory(std::mem::size_of::<GuestSurfaceRecord>()));
                break;
            };
            handles.push(handle);
            match arena.alloc_value(&GuestSurfaceRecord {
                handle,
                device: device_handle,
            }) {
                Ok(record) => {
                    if let Some(w) = locked(&self.surfaces).get_mut(handle) {
                        w.record = record;
                    }
                    records.push(record.get());
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        let array = match failure {
            None => arena.alloc_array(&records),
            Some(e) => Err(e),
        };
        match array {
            Ok(array) => {
                tracing::debug!(count = records.len(), ?array, "surfaces created");
                c.set_arg(5, u64::from(array.get()));
                Ok(HResult::S_OK)
            }
            Err(e) => {
                tracing::warn!("surface creation failed: {e}");
                let mut table = locked(&self.surfaces);
                for handle in handles {
                    if let Some(w) = table.remove(handle) {
                        if !w.record.is_null() {
                            let _ = arena.free(w.record);
                        }
                    }
                }
                drop(table);
                for surface in &created {
                    surface.release();
                }
                Err(e)
            }
        }
    }

    fn release(&self, handle: u32) -> Option<u32> {
        let (device, _) = self.device(handle)?;
        let count = device.release();
        if count == 0 {
            locked(&self.devices).remove(handle);
            tracing::debug!(handle, "dxgi device wrapper destroyed");
            let destroy = *self.guest_destroy.read().unwrap_or_else(|e| e.into_inner());
            if let Some(destroy) = destroy {
                let _ = self.ops.execute(destroy, u64::from(handle));
            }
        }
        Some(count)
    }

    fn release_surface(&self, handle: u32) -> u32 {
        let Some(wrapper) = locked(&self.surfaces).remove(handle) else {
            tracing::error!(handle, "release of an unknown surface");
            return 0;
        };
        if !wrapper.record.is_null() {
            let _ = self.ops.arena().free(wrapper.record);
        }
        wrapper.host.release()
    }
}

impl std::fmt::Debug for DxgiHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DxgiHost")
            .field("devices", &self.device_count())
            .field("surfaces", &self.surface_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dxgi::fake::{FakeDevice, IID_ID3D11DEVICE};
    use crate::test_support;
    use openthunk_dispatch::{Dispatcher, GuestFunctions, Transport};
    use std::sync::atomic::{AtomicU64, Ordering};

    fn setup() -> (Arc<DxgiHost>, Dispatcher, Arc<GuestFunctions>) {
        let (ops, funcs) = test_support::ops();
        let host = Arc::new(DxgiHost::new(ops));
        let dispatcher = Dispatcher::builder()
            .register(host.table().unwrap())
            .unwrap()
            .build()
            .unwrap();
        (host, dispatcher, funcs)
    }

    fn call(d: &Dispatcher, call: Call, args: &[u64]) -> CallEnvelope {
        let mut envelope = CallEnvelope::new(call.id());
        for (i, &a) in args.iter().enumerate() {
            envelope.set_arg(i, a);
        }
        d.syscall(&mut envelope).unwrap();
        envelope
    }

    #[test]
    fn test_release_to_zero_runs_guest_destroy() {
        let (host, d, funcs) = setup();
        let destroyed = Arc::new(AtomicU64::new(0));
        let seen = destroyed.clone();
        let destroy = funcs
            .register(move |handle| {
                seen.store(handle, Ordering::SeqCst);
                0
            })
            .unwrap();
        assert_eq!(call(&d, Call::SetGuestCallbacks, &[u64::from(destroy.get())]).result(), 1);

        let device = FakeDevice::new();
        let handle = host.wrap_device(device.clone()).unwrap();
        assert_eq!(call(&d, Call::AddRef, &[u64::from(handle)]).result(), 2);
        assert_eq!(host.release_device(handle), Some(1));
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);
        assert_eq!(call(&d, Call::Release, &[u64::from(handle)]).result(), 0);
        assert_eq!(destroyed.load(Ordering::SeqCst), u64::from(handle));
        assert_eq!(host.device_count(), 0);
        // The handle is gone; further calls fail cleanly.
        assert_eq!(
            call(&d, Call::GetAdapter, &[u64::from(handle)]).hresult(),
            HResult::E_INVALIDARG
        );
    }

    #[test]
    fn test_query_interface_is_diagnostic() {
        let (host, d, _) = setup();
        let handle = host.wrap_device(FakeDevice::new()).unwrap();
        let iid = host.ops.arena().alloc_value(&IID_ID3D11DEVICE).unwrap();
        let hr = call(&d, Call::QueryInterface, &[u64::from(handle), u64::from(iid.get())]).hresult();
        assert_eq!(hr, HResult::S_OK);
    }

    #[test]
    fn test_get_adapter_returns_cached_identity() {
        let (host, d, _) = setup();
        let device = FakeDevice::new();
        let handle = host.wrap_device(device.clone()).unwrap();
        device.adapter.store(0xbad, Ordering::SeqCst);
        let envelope = call(&d, Call::GetAdapter, &[u64::from(handle)]);
        assert_eq!(envelope.hresult(), HResult::S_OK);
        assert_eq!(envelope.arg(1), 0xada);
    }

    #[test]
    fn test_scalar_getters_fill_the_envelope() {
        let (host, d, _) = setup();
        let handle = u64::from(host.wrap_device(FakeDevice::new()).unwrap());
        assert_eq!(
            call(&d, Call::SetGpuThreadPriority, &[handle, (-3i32) as u32 as u64]).hresult(),
            HResult::S_OK
        );
        assert_eq!(
            call(&d, Call::SetGpuThreadPriority, &[handle, 9]).hresult(),
            HResult::E_INVALIDARG
        );
        let envelope = call(&d, Call::GetGpuThreadPriority, &[handle]);
        assert_eq!(envelope.arg(1) as u32 as i32, -3);

        call(&d, Call::SetMaximumFrameLatency, &[handle, 5]);
        assert_eq!(call(&d, Call::GetMaximumFrameLatency, &[handle]).arg(1), 5);
    }

    #[test]
    fn test_create_surface_records_and_release() {
        let (host, d, _) = setup();
        let device = FakeDevice::new();
        let handle = u64::from(host.wrap_device(device.clone()).unwrap());
        let arena = host.ops.arena();
        let desc = arena
            .alloc_value(&SurfaceDesc {
                width: 64,
                height: 32,
                format: 28,
                sample_count: 1,
                sample_quality: 0,
            })
            .unwrap();
        let shared = arena
            .alloc_value(&GuestSharedResource { handle: 0xffff_fff4 })
            .unwrap();

        let envelope = call(
            &d,
            Call::CreateSurface,
            &[handle, u64::from(desc.get()), 2, 0x20, u64::from(shared.get())],
        );
        assert_eq!(envelope.hresult(), HResult::S_OK);
        assert_eq!(device.last_shared.lock().unwrap().unwrap().handle, -12);
        let records = arena
            .read_array::<u32>(GuestAddr::new(envelope.arg(5) as u32), 2)
            .unwrap();
        let first = arena
            .read::<GuestSurfaceRecord>(GuestAddr::new(records[0]))
            .unwrap();
        assert_eq!(first.device, handle as u32);
        assert_eq!(host.surface_count(), 2);

        assert_eq!(call(&d, Call::SurfaceRelease, &[u64::from(first.handle)]).result(), 0);
        assert_eq!(host.surface_count(), 1);
        assert_eq!(device.live_surfaces(), 1);
        assert!(!arena.is_live(GuestAddr::new(records[0])));
    }

    #[test]
    fn test_create_surface_failures() {
        let (host, d, _) = setup();
        let device = FakeDevice::new();
        let handle = u64::from(host.wrap_device(device.clone()).unwrap());
        let arena = host.ops.arena();

        let hr = call(&d, Call::CreateSurface, &[handle, 0, 1, 0, 0]).hresult();
        assert_eq!(hr, HResult::E_INVALIDARG);

        // The device itself refuses a zero width.
        let desc = arena.alloc_value(&SurfaceDesc::default()).unwrap();
        let hr = call(&d, Call::CreateSurface, &[handle, u64::from(desc.get()), 1, 0, 0]).hresult();
        assert_eq!(hr, HResult::E_INVALIDARG);
        assert_eq!(host.surface_count(), 0);
    }

    #[test]
    fn test_handle_slot_above_32_bits_is_rejected() {
        let (host, d, _) = setup();
        let device = FakeDevice::new();
        let handle = u64::from(host.wrap_device(device.clone()).unwrap());
        let wide = (1 << 32) | handle;

        assert_eq!(call(&d, Call::AddRef, &[wide]).result(), 0);
        assert_eq!(call(&d, Call::Release, &[wide]).result(), 0);
        assert_eq!(device.refs.load(Ordering::SeqCst), 1);
        assert_eq!(host.device_count(), 1);
        assert_eq!(call(&d, Call::GetAdapter, &[wide]).hresult(), HResult::E_INVALIDARG);
        assert_eq!(call(&d, Call::SurfaceRelease, &[wide]).result(), 0);
        assert_eq!(
            call(&d, Call::SetGpuThreadPriority, &[handle, 1 << 32]).hresult(),
            HResult::E_INVALIDARG
        );

        // The handle itself still works.
        assert_eq!(call(&d, Call::AddRef, &[handle]).result(), 2);
    }

    #[test]
    fn test_released_device_handle_is_not_reissued() {
        let (host, d, _) = setup();
        let first = host.wrap_device(FakeDevice::new()).unwrap();
        assert_eq!(call(&d, Call::Release, &[u64::from(first)]).result(), 0);
        let second = host.wrap_device(FakeDevice::new()).unwrap();
        assert_ne!(first, second);
        assert_eq!(call(&d, Call::AddRef, &[u64::from(first)]).result(), 0);
        assert_eq!(call(&d, Call::AddRef, &[u64::from(second)]).result(), 2);
    }

    #[test]
    fn test_unknown_surface_handles_are_rejected() {
        let (host, d, _) = setup();
        let handle = u64::from(host.wrap_device(FakeDevice::new()).unwrap());
        let array = host.ops.arena().alloc_array(&[77u32]).unwrap();
        let hr = call(&d, Call::OfferResources, &[handle, 1, u64::from(array.get()), 1]).hresult();
        assert_eq!(hr, HResult::E_INVALIDARG);
    }
}
