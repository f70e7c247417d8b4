//! dxgi: the `IDXGIDevice2` wrapper
//!
//! The host keeps the real device and its surfaces in handle tables
//! ([`host`]); the guest sees proxies that carry those handles across
//! ([`guest`]). Private data set on a device never leaves the guest
//! ([`private`]).

pub mod guest;
pub mod host;
pub mod private;

use openthunk_common::arena::Pod;
use openthunk_common::win::{Guid, HResult};
use openthunk_dispatch::SyscallId;

pub use guest::{DxgiGuest, GuestDevice, GuestSurface};
pub use host::{DxgiHost, HostDevice, HostSurface};
pub use private::PrivateStore;

pub const MODULE_ID: u32 = 3;
pub const MODULE_NAME: &str = "dxgi";

pub const DXGI_ERROR_NOT_FOUND: HResult = HResult(0x887A_0002_u32 as i32);
pub const DXGI_ERROR_MORE_DATA: HResult = HResult(0x887A_0003_u32 as i32);

pub const IID_IDXGIOBJECT: Guid = Guid::from_u128(0xaec22fb8_76f3_4639_9be0_28eb43a67a2e);
pub const IID_IDXGIDEVICE: Guid = Guid::from_u128(0x54ec77fa_1377_44e6_8c32_88fd5f44c84c);
pub const IID_IDXGIDEVICE1: Guid = Guid::from_u128(0x77db970f_6276_48ba_ba28_070143b4392c);
pub const IID_IDXGIDEVICE2: Guid = Guid::from_u128(0x05008617_fbfd_4051_a790_144884b4f6a9);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Call {
    SetGuestCallbacks,
    QueryInterface,
    AddRef,
    Release,
    GetAdapter,
    CreateSurface,
    QueryResourceResidency,
    SetGpuThreadPriority,
    GetGpuThreadPriority,
    SetMaximumFrameLatency,
    GetMaximumFrameLatency,
    OfferResources,
    ReclaimResources,
    EnqueueSetEvent,
    SurfaceRelease,
}

impl Call {
    pub const ALL: [Call; 15] = [
        Call::SetGuestCallbacks,
        Call::QueryInterface,
        Call::AddRef,
        Call::Release,
        Call::GetAdapter,
        Call::CreateSurface,
        Call::QueryResourceResidency,
        Call::SetGpuThreadPriority,
        Call::GetGpuThreadPriority,
        Call::SetMaximumFrameLatency,
        Call::GetMaximumFrameLatency,
        Call::OfferResources,
        Call::ReclaimResources,
        Call::EnqueueSetEvent,
        Call::SurfaceRelease,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Call::SetGuestCallbacks => "set_guest_callbacks",
            Call::QueryInterface => "QueryInterface",
            Call::AddRef => "AddRef",
            Call::Release => "Release",
            Call::GetAdapter => "GetAdapter",
            Call::CreateSurface => "CreateSurface",
            Call::QueryResourceResidency => "QueryResourceResidency",
            Call::SetGpuThreadPriority => "SetGPUThreadPriority",
            Call::GetGpuThreadPriority => "GetGPUThreadPriority",
            Call::SetMaximumFrameLatency => "SetMaximumFrameLatency",
            Call::GetMaximumFrameLatency => "GetMaximumFrameLatency",
            Call::OfferResources => "OfferResources",
            Call::ReclaimResources => "ReclaimResources",
            Call::EnqueueSetEvent => "EnqueueSetEvent",
            Call::SurfaceRelease => "SurfaceRelease",
        }
    }

    pub fn id(self) -> SyscallId {
        SyscallId::new(MODULE_ID, self as u32)
    }
}

/// The guest-visible part of a surface wrapper. `CreateSurface` hands back
/// an array of these records' addresses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct GuestSurfaceRecord {
    pub handle: u32,
    pub device: u32,
}

unsafe impl Pod for GuestSurfaceRecord {}

#[cfg(test)]
pub(crate) mod fake {
    //! A host device and surfaces that count their references.

    use std::ffi::c_void;
    use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use openthunk_com::IUnknownVtbl;
    use openthunk_common::win::{Bool, Guid, HResult, IID_IUNKNOWN};
    use openthunk_layout::{SharedResource, SurfaceDesc};

    use super::host::{HostDevice, HostSurface};

    pub const IID_ID3D11DEVICE: Guid = Guid::from_u128(0xdb6f6ddb_ac77_4e88_8253_819df9bbf140);
    pub const IID_IDXGIADAPTER: Guid = Guid::from_u128(0x2411e7e1_12ac_4ccf_bd14_9798e8534dc0);

    /// A plain COM object answering `IUnknown` and `IDXGIAdapter` with itself.
    #[repr(C)]
    pub struct ComObject {
        vtbl: *const IUnknownVtbl,
        pub refs: AtomicU32,
    }

    unsafe extern "system" fn com_qi(
        this: *mut c_void,
        iid: *const Guid,
        out: *mut *mut c_void,
    ) -> i32 {
        if *iid == IID_IUNKNOWN || *iid == IID_IDXGIADAPTER {
            com_add_ref(this);
            *out = this;
            return HResult::S_OK.0;
        }
        *out = std::ptr::null_mut();
        HResult::E_NOINTERFACE.0
    }

    unsafe extern "system" fn com_add_ref(this: *mut c_void) -> u32 {
        (*(this as *const ComObject)).refs.fetch_add(1, Ordering::SeqCst) + 1
    }

    unsafe extern "system" fn com_release(this: *mut c_void) -> u32 {
        (*(this as *const ComObject)).refs.fetch_sub(1, Ordering::SeqCst) - 1
    }

    static COM_VTBL: IUnknownVtbl = IUnknownVtbl {
        query_interface: com_qi,
        add_ref: com_add_ref,
        release: com_release,
    };

    impl ComObject {
        pub fn new() -> Box<Self> {
            Box::new(Self {
                vtbl: &COM_VTBL,
                refs: AtomicU32::new(1),
            })
        }

        pub fn as_raw(&self) -> *mut c_void {
            self as *const Self as *mut c_void
        }
    }

    #[derive(Debug)]
    pub struct FakeSurface {
        pub id: u64,
        pub refs: AtomicU32,
        pub desc: SurfaceDesc,
    }

    impl HostSurface for FakeSurface {
        fn id(&self) -> u64 {
            self.id
        }

        fn release(&self) -> u32 {
            self.refs.fetch_sub(1, Ordering::SeqCst) - 1
        }
    }

    #[derive(Debug, Default)]
    pub struct FakeDevice {
        pub refs: AtomicU32,
        pub adapter: AtomicU64,
        pub priority: AtomicI32,
        pub latency: AtomicU32,
        pub next_surface: AtomicU64,
        pub surfaces: Mutex<Vec<Arc<FakeSurface>>>,
        pub last_shared: Mutex<Option<SharedResource>>,
        pub offered: AtomicUsize,
        pub events: Mutex<Vec<isize>>,
    }

    impl FakeDevice {
        pub fn new() -> Arc<Self> {
            let device = Self::default();
            device.refs.store(1, Ordering::SeqCst);
            device.adapter.store(0xada, Ordering::SeqCst);
            device.latency.store(3, Ordering::SeqCst);
            Arc::new(device)
        }

        pub fn live_surfaces(&self) -> usize {
            self.surfaces
                .lock()
                .unwrap()
                .iter()
                .filter(|s| s.refs.load(Ordering::SeqCst) > 0)
                .count()
        }
    }

    impl HostDevice for FakeDevice {
        fn add_ref(&self) -> u32 {
            self.refs.fetch_add(1, Ordering::SeqCst) + 1
        }

        fn release(&self) -> u32 {
            self.refs.fetch_sub(1, Ordering::SeqCst) - 1
        }

        fn query_interface(&self, iid: &Guid) -> HResult {
            if *iid == IID_ID3D11DEVICE {
                HResult::S_OK
            } else {
                HResult::E_NOINTERFACE
            }
        }

        fn adapter(&self) -> Result<u64, HResult> {
            Ok(self.adapter.load(Ordering::SeqCst))
        }

        fn create_surfaces(
            &self,
            desc: &SurfaceDesc,
            count: u32,
            _usage: u32,
            shared: Option<&SharedResource>,
        ) -> Result<Vec<Arc<dyn HostSurface>>, HResult> {
            if desc.width == 0 {
                return Err(HResult::E_INVALIDARG);
            }
            *self.last_shared.lock().unwrap() = shared.copied();
            let mut out: Vec<Arc<dyn HostSurface>> = Vec::new();
            for _ in 0..count {
                let surface = Arc::new(FakeSurface {
                    id: self.next_surface.fetch_add(1, Ordering::SeqCst) + 1,
                    refs: AtomicU32::new(1),
                    desc: *desc,
                });
                self.surfaces.lock().unwrap().push(surface.clone());
                out.push(surface);
            }
            Ok(out)
        }

        fn query_resource_residency(
            &self,
            resources: &[Arc<dyn HostSurface>],
        ) -> Result<Vec<u32>, HResult> {
            Ok(resources.iter().map(|r| r.id() as u32 % 3 + 1).collect())
        }

        fn set_gpu_thread_priority(&self, priority: i32) -> HResult {
            if !(-7..=7).contains(&priority) {
                return HResult::E_INVALIDARG;
            }
            self.priority.store(priority, Ordering::SeqCst);
            HResult::S_OK
        }

        fn gpu_thread_priority(&self) -> Result<i32, HResult> {
            Ok(self.priority.load(Ordering::SeqCst))
        }

        fn set_maximum_frame_latency(&self, latency: u32) -> HResult {
            self.latency.store(latency, Ordering::SeqCst);
            HResult::S_OK
        }

        fn maximum_frame_latency(&self) -> Result<u32, HResult> {
            Ok(self.latency.load(Ordering::SeqCst))
        }

        fn offer_resources(&self, resources: &[Arc<dyn HostSurface>], _priority: u32) -> HResult {
            self.offered.fetch_add(resources.len(), Ordering::SeqCst);
            HResult::S_OK
        }

        fn reclaim_resources(&self, resources: &[Arc<dyn HostSurface>]) -> Result<Vec<Bool>, HResult> {
            self.offered.fetch_sub(resources.len(), Ordering::SeqCst);
            Ok(resources.iter().map(|r| (r.id() % 2) as Bool).collect())
        }

        fn enqueue_set_event(&self, event: isize) -> HResult {
            self.events.lock().unwrap().push(event);
            HResult::S_OK
        }
    }
}
