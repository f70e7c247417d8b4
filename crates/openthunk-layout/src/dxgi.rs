//! DXGI structures passed to `IDXGIDevice::CreateSurface`

use openthunk_common::addr::AddressSpace;
use openthunk_common::arena::Pod;

use crate::{narrow_handle, widen_handle, LayoutPair, Result};

/// `DXGI_SURFACE_DESC` with its nested `DXGI_SAMPLE_DESC` flattened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct SurfaceDesc {
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub sample_count: u32,
    pub sample_quality: u32,
}

unsafe impl Pod for SurfaceDesc {}

impl LayoutPair for SurfaceDesc {
    type Guest = SurfaceDesc;
    const NAME: &'static str = "DXGI_SURFACE_DESC";

    fn to_host_layout(guest: &SurfaceDesc, _space: &AddressSpace) -> Result<Self> {
        Ok(*guest)
    }

    fn to_guest_layout(&self, _space: &AddressSpace) -> Result<SurfaceDesc> {
        Ok(*self)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct GuestSharedResource {
    pub handle: u32,
}

unsafe impl Pod for GuestSharedResource {}

/// `DXGI_SHARED_RESOURCE`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct SharedResource {
    pub handle: isize,
}

impl LayoutPair for SharedResource {
    type Guest = GuestSharedResource;
    const NAME: &'static str = "DXGI_SHARED_RESOURCE";

    fn to_host_layout(guest: &GuestSharedResource, _space: &AddressSpace) -> Result<Self> {
        Ok(Self {
            handle: widen_handle(guest.handle),
        })
    }

    fn to_guest_layout(&self, _space: &AddressSpace) -> Result<GuestSharedResource> {
        Ok(GuestSharedResource {
            handle: narrow_handle(Self::NAME, "Handle", self.handle)?,
        })
    }
}
