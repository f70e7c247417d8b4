//! `WM_NOTIFY` payloads: `NMHDR` and the rebar notification records that
//! start with it.

use openthunk_common::addr::AddressSpace;
use openthunk_common::arena::Pod;
use openthunk_common::win::{Bool, Hwnd, LParam};

use crate::geometry::Rect;
use crate::{narrow_handle, narrow_int_ptr, narrow_uint_ptr, widen_handle, widen_int_ptr};
use crate::{LayoutPair, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct GuestNmHdr {
    pub hwnd_from: u32,
    pub id_from: u32,
    pub code: u32,
}

unsafe impl Pod for GuestNmHdr {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct NmHdr {
    pub hwnd_from: Hwnd,
    pub id_from: usize,
    pub code: u32,
}

impl LayoutPair for NmHdr {
    type Guest = GuestNmHdr;
    const NAME: &'static str = "NMHDR";

    fn to_host_layout(guest: &GuestNmHdr, _space: &AddressSpace) -> Result<Self> {
        Ok(Self {
            hwnd_from: widen_handle(guest.hwnd_from),
            id_from: guest.id_from as usize,
            code: guest.code,
        })
    }

    fn to_guest_layout(&self, _space: &AddressSpace) -> Result<GuestNmHdr> {
        Ok(GuestNmHdr {
            hwnd_from: narrow_handle(Self::NAME, "hwndFrom", self.hwnd_from)?,
            id_from: narrow_uint_ptr(Self::NAME, "idFrom", self.id_from)?,
            code: self.code,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct GuestNmRebarChildSize {
    pub hdr: GuestNmHdr,
    pub u_band: u32,
    pub w_id: u32,
    pub rc_child: Rect,
    pub rc_band: Rect,
}

unsafe impl Pod for GuestNmRebarChildSize {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct NmRebarChildSize {
    pub hdr: NmHdr,
    pub u_band: u32,
    pub w_id: u32,
    pub rc_child: Rect,
    pub rc_band: Rect,
}

impl LayoutPair for NmRebarChildSize {
    type Guest = GuestNmRebarChildSize;
    const NAME: &'static str = "NMREBARCHILDSIZE";

    fn to_host_layout(guest: &GuestNmRebarChildSize, space: &AddressSpace) -> Result<Self> {
        Ok(Self {
            hdr: NmHdr::to_host_layout(&guest.hdr, space)?,
            u_band: guest.u_band,
            w_id: guest.w_id,
            rc_child: guest.rc_child,
            rc_band: guest.rc_band,
        })
    }

    fn to_guest_layout(&self, space: &AddressSpace) -> Result<GuestNmRebarChildSize> {
        Ok(GuestNmRebarChildSize {
            hdr: self.hdr.to_guest_layout(space)?,
            u_band: self.u_band,
            w_id: self.w_id,
            rc_child: self.rc_child,
            rc_band: self.rc_band,
        })
    }
}

/// Sent with band deletion and drag notifications.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct GuestNmRebar {
    pub hdr: GuestNmHdr,
    pub dw_mask: u32,
    pub u_band: u32,
    pub f_style: u32,
    pub w_id: u32,
    pub l_param: u32,
}

unsafe impl Pod for GuestNmRebar {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct NmRebar {
    pub hdr: NmHdr,
    pub dw_mask: u32,
    pub u_band: u32,
    pub f_style: u32,
    pub w_id: u32,
    pub l_param: LParam,
}

impl LayoutPair for NmRebar {
    type Guest = GuestNmRebar;
    const NAME: &'static str = "NMREBAR";

    fn to_host_layout(guest: &GuestNmRebar, space: &AddressSpace) -> Result<Self> {
        Ok(Self {
            hdr: NmHdr::to_host_layout(&guest.hdr, space)?,
            dw_mask: guest.dw_mask,
            u_band: guest.u_band,
            f_style: guest.f_style,
            w_id: guest.w_id,
            l_param: widen_int_ptr(guest.l_param),
        })
    }

    fn to_guest_layout(&self, space: &AddressSpace) -> Result<GuestNmRebar> {
        Ok(GuestNmRebar {
            hdr: self.hdr.to_guest_layout(space)?,
            dw_mask: self.dw_mask,
            u_band: self.u_band,
            f_style: self.f_style,
            w_id: self.w_id,
            l_param: narrow_int_ptr(Self::NAME, "lParam", self.l_param)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct GuestNmRebarAutoSize {
    pub hdr: GuestNmHdr,
    pub f_changed: Bool,
    pub rc_target: Rect,
    pub rc_actual: Rect,
}

unsafe impl Pod for GuestNmRebarAutoSize {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct NmRebarAutoSize {
    pub hdr: NmHdr,
    pub f_changed: Bool,
    pub rc_target: Rect,
    pub rc_actual: Rect,
}

impl LayoutPair for NmRebarAutoSize {
    type Guest = GuestNmRebarAutoSize;
    const NAME: &'static str = "NMRBAUTOSIZE";

    fn to_host_layout(guest: &GuestNmRebarAutoSize, space: &AddressSpace) -> Result<Self> {
        Ok(Self {
            hdr: NmHdr::to_host_layout(&guest.hdr, space)?,
            f_changed: guest.f_changed,
            rc_target: guest.rc_target,
            rc_actual: guest.rc_actual,
        })
    }

    fn to_guest_layout(&self, space: &AddressSpace) -> Result<GuestNmRebarAutoSize> {
        Ok(GuestNmRebarAutoSize {
            hdr: self.hdr.to_guest_layout(space)?,
            f_changed: self.f_changed,
            rc_target: self.rc_target,
            rc_actual: self.rc_actual,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct GuestNmRebarChevron {
    pub hdr: GuestNmHdr,
    pub u_band: u32,
    pub w_id: u32,
    pub l_param: u32,
    pub rc: Rect,
    pub l_param_nm: u32,
}

unsafe impl Pod for GuestNmRebarChevron {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct NmRebarChevron {
    pub hdr: NmHdr,
    pub u_band: u32,
    pub w_id: u32,
    pub l_param: LParam,
    pub rc: Rect,
    pub l_param_nm: LParam,
}

impl LayoutPair for NmRebarChevron {
    type Guest = GuestNmRebarChevron;
    const NAME: &'static str = "NMREBARCHEVRON";

    fn to_host_layout(guest: &GuestNmRebarChevron, space: &AddressSpace) -> Result<Self> {
        Ok(Self {
            hdr: NmHdr::to_host_layout(&guest.hdr, space)?,
            u_band: guest.u_band,
            w_id: guest.w_id,
            l_param: widen_int_ptr(guest.l_param),
            rc: guest.rc,
            l_param_nm: widen_int_ptr(guest.l_param_nm),
        })
    }

    fn to_guest_layout(&self, space: &AddressSpace) -> Result<GuestNmRebarChevron> {
        Ok(GuestNmRebarChevron {
            hdr: self.hdr.to_guest_layout(space)?,
            u_band: self.u_band,
            w_id: self.w_id,
            l_param: narrow_int_ptr(Self::NAME, "lParam", self.l_param)?,
            rc: self.rc,
            l_param_nm: narrow_int_ptr(Self::NAME, "lParamNM", self.l_param_nm)?,
        })
    }
}
