//! `REBARINFO` and `REBARBANDINFO`
//!
//! `REBARBANDINFO` grew over time; callers built against older headers pass a
//! smaller `cbSize`. Three revisions are recognised on each side:
//!
//! | revision | last field        | guest | host |
//! |----------|-------------------|-------|------|
//! | V3       | `wID`             | 56    | 76   |
//! | V6       | `cxHeader`        | 80    | 108  |
//! | full     | `uChevronState`   | 100   | 128  |

use std::mem;

use openthunk_common::addr::AddressSpace;
use openthunk_common::arena::Pod;

use crate::geometry::Rect;
use crate::{guest_ptr_to_host, host_ptr_to_guest, narrow_handle, narrow_int_ptr};
use crate::{widen_handle, widen_int_ptr, LayoutPair, Result, SelfSized};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct GuestRebarInfo {
    pub cb_size: u32,
    pub f_mask: u32,
    pub himl: u32,
}

unsafe impl Pod for GuestRebarInfo {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RebarInfo {
    pub cb_size: u32,
    pub f_mask: u32,
    pub himl: isize,
}

impl LayoutPair for RebarInfo {
    type Guest = GuestRebarInfo;
    const NAME: &'static str = "REBARINFO";

    fn to_host_layout(guest: &GuestRebarInfo, _space: &AddressSpace) -> Result<Self> {
        Ok(Self {
            cb_size: Self::HOST_SIZE,
            f_mask: guest.f_mask,
            himl: widen_handle(guest.himl),
        })
    }

    fn to_guest_layout(&self, _space: &AddressSpace) -> Result<GuestRebarInfo> {
        Ok(GuestRebarInfo {
            cb_size: Self::GUEST_SIZE,
            f_mask: self.f_mask,
            himl: narrow_handle(Self::NAME, "himl", self.himl)?,
        })
    }
}

impl SelfSized for RebarInfo {
    const GUEST_SIZE: u32 = mem::size_of::<GuestRebarInfo>() as u32;
    const HOST_SIZE: u32 = mem::size_of::<RebarInfo>() as u32;

    fn declared_size(guest: &GuestRebarInfo) -> u32 {
        guest.cb_size
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct GuestRebarBandInfo {
    pub cb_size: u32,
    pub f_mask: u32,
    pub f_style: u32,
    pub clr_fore: u32,
    pub clr_back: u32,
    pub lp_text: u32,
    pub cch: u32,
    pub i_image: i32,
    pub hwnd_child: u32,
    pub cx_min_child: u32,
    pub cy_min_child: u32,
    pub cx: u32,
    pub hbm_back: u32,
    pub w_id: u32,
    pub cy_child: u32,
    pub cy_max_child: u32,
    pub cy_integral: u32,
    pub cx_ideal: u32,
    pub l_param: u32,
    pub cx_header: u32,
    pub rc_chevron_location: Rect,
    pub u_chevron_state: u32,
}

unsafe impl Pod for GuestRebarBandInfo {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RebarBandInfo {
    pub cb_size: u32,
    pub f_mask: u32,
    pub f_style: u32,
    pub clr_fore: u32,
    pub clr_back: u32,
    pub lp_text: usize,
    pub cch: u32,
    pub i_image: i32,
    pub hwnd_child: isize,
    pub cx_min_child: u32,
    pub cy_min_child: u32,
    pub cx: u32,
    pub hbm_back: isize,
    pub w_id: u32,
    pub cy_child: u32,
    pub cy_max_child: u32,
    pub cy_integral: u32,
    pub cx_ideal: u32,
    pub l_param: isize,
    pub cx_header: u32,
    pub rc_chevron_location: Rect,
    pub u_chevron_state: u32,
}

impl RebarBandInfo {
    pub const GUEST_V3_SIZE: u32 = mem::offset_of!(GuestRebarBandInfo, cy_child) as u32;
    pub const GUEST_V6_SIZE: u32 = mem::offset_of!(GuestRebarBandInfo, rc_chevron_location) as u32;
    pub const HOST_V3_SIZE: u32 = (mem::offset_of!(RebarBandInfo, w_id) + 4) as u32;
    pub const HOST_V6_SIZE: u32 = (mem::offset_of!(RebarBandInfo, cx_header) + 4) as u32;

    /// Host `cbSize` matching a guest declared size, or 0 when the guest
    /// declared something smaller than the oldest revision. The host control
    /// rejects 0 the same way it would reject the guest's bad size.
    pub fn host_size_for(declared: u32) -> u32 {
        if declared >= Self::GUEST_SIZE {
            Self::HOST_SIZE
        } else if declared >= Self::GUEST_V6_SIZE {
            Self::HOST_V6_SIZE
        } else if declared >= Self::GUEST_V3_SIZE {
            Self::HOST_V3_SIZE
        } else {
            0
        }
    }

    pub fn guest_size_for(host: u32) -> u32 {
        if host >= Self::HOST_SIZE {
            Self::GUEST_SIZE
        } else if host >= Self::HOST_V6_SIZE {
            Self::GUEST_V6_SIZE
        } else if host >= Self::HOST_V3_SIZE {
            Self::GUEST_V3_SIZE
        } else {
            0
        }
    }
}

impl LayoutPair for RebarBandInfo {
    type Guest = GuestRebarBandInfo;
    const NAME: &'static str = "REBARBANDINFO";

    fn to_host_layout(guest: &GuestRebarBandInfo, space: &AddressSpace) -> Result<Self> {
        let cb_size = Self::host_size_for(guest.cb_size);
        let mut host = Self {
            cb_size,
            f_mask: guest.f_mask,
            f_style: guest.f_style,
            clr_fore: guest.clr_fore,
            clr_back: guest.clr_back,
            lp_text: guest_ptr_to_host(space, guest.lp_text)?,
            cch: guest.cch,
            i_image: guest.i_image,
            hwnd_child: widen_handle(guest.hwnd_child),
            cx_min_child: guest.cx_min_child,
            cy_min_child: guest.cy_min_child,
            cx: guest.cx,
            hbm_back: widen_handle(guest.hbm_back),
            w_id: guest.w_id,
            ..Self::default()
        };
        if cb_size >= Self::HOST_V6_SIZE {
            host.cy_child = guest.cy_child;
            host.cy_max_child = guest.cy_max_child;
            host.cy_integral = guest.cy_integral;
            host.cx_ideal = guest.cx_ideal;
            host.l_param = widen_int_ptr(guest.l_param);
            host.cx_header = guest.cx_header;
        }
        if cb_size >= Self::HOST_SIZE {
            host.rc_chevron_location = guest.rc_chevron_location;
            host.u_chevron_state = guest.u_chevron_state;
        }
        Ok(host)
    }

    fn to_guest_layout(&self, space: &AddressSpace) -> Result<GuestRebarBandInfo> {
        let cb_size = Self::guest_size_for(self.cb_size);
        let mut guest = GuestRebarBandInfo {
            cb_size,
            f_mask: self.f_mask,
            f_style: self.f_style,
            clr_fore: self.clr_fore,
            clr_back: self.clr_back,
            lp_text: host_ptr_to_guest(space, self.lp_text)?,
            cch: self.cch,
            i_image: self.i_image,
            hwnd_child: narrow_handle(Self::NAME, "hwndChild", self.hwnd_child)?,
            cx_min_child: self.cx_min_child,
            cy_min_child: self.cy_min_child,
            cx: self.cx,
            hbm_back: narrow_handle(Self::NAME, "hbmBack", self.hbm_back)?,
            w_id: self.w_id,
            ..GuestRebarBandInfo::default()
        };
        if cb_size >= Self::GUEST_V6_SIZE {
            guest.cy_child = self.cy_child;
            guest.cy_max_child = self.cy_max_child;
            guest.cy_integral = self.cy_integral;
            guest.cx_ideal = self.cx_ideal;
            guest.l_param = narrow_int_ptr(Self::NAME, "lParam", self.l_param)?;
            guest.cx_header = self.cx_header;
        }
        if cb_size >= Self::GUEST_SIZE {
            guest.rc_chevron_location = self.rc_chevron_location;
            guest.u_chevron_state = self.u_chevron_state;
        }
        Ok(guest)
    }
}

impl SelfSized for RebarBandInfo {
    const GUEST_SIZE: u32 = mem::size_of::<GuestRebarBandInfo>() as u32;
    const HOST_SIZE: u32 = mem::size_of::<RebarBandInfo>() as u32;

    fn declared_size(guest: &GuestRebarBandInfo) -> u32 {
        guest.cb_size
    }
}
