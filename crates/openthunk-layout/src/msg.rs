//! `MSG`

use openthunk_common::addr::AddressSpace;
use openthunk_common::arena::Pod;
use openthunk_common::win::{Hwnd, LParam, WParam};

use crate::geometry::Point;
use crate::{narrow_handle, narrow_int_ptr, narrow_uint_ptr, widen_handle, widen_int_ptr};
use crate::{LayoutPair, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct GuestMsg {
    pub hwnd: u32,
    pub message: u32,
    pub wparam: u32,
    pub lparam: u32,
    pub time: u32,
    pub pt: Point,
}

unsafe impl Pod for GuestMsg {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Msg {
    pub hwnd: Hwnd,
    pub message: u32,
    pub wparam: WParam,
    pub lparam: LParam,
    pub time: u32,
    pub pt: Point,
}

impl LayoutPair for Msg {
    type Guest = GuestMsg;
    const NAME: &'static str = "MSG";

    /// `lparam` is carried as an integer. Messages whose lParam is a pointer
    /// get it translated by whoever knows the message.
    fn to_host_layout(guest: &GuestMsg, _space: &AddressSpace) -> Result<Self> {
        Ok(Self {
            hwnd: widen_handle(guest.hwnd),
            message: guest.message,
            wparam: guest.wparam as WParam,
            lparam: widen_int_ptr(guest.lparam),
            time: guest.time,
            pt: guest.pt,
        })
    }

    fn to_guest_layout(&self, _space: &AddressSpace) -> Result<GuestMsg> {
        Ok(GuestMsg {
            hwnd: narrow_handle(Self::NAME, "hwnd", self.hwnd)?,
            message: self.message,
            wparam: narrow_uint_ptr(Self::NAME, "wParam", self.wparam)?,
            lparam: narrow_int_ptr(Self::NAME, "lParam", self.lparam)?,
            time: self.time,
            pt: self.pt,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::space;
    use crate::LayoutError;

    #[test]
    fn test_msg_round_trip() {
        let space = space();
        let guest = GuestMsg {
            hwnd: 0x0002_0044,
            message: 0x4e,
            wparam: 0x8000_0001,
            lparam: 0xffff_fffe,
            time: 1234,
            pt: Point { x: -3, y: 7 },
        };
        let host = Msg::to_host_layout(&guest, &space).unwrap();
        assert_eq!(host.wparam, 0x8000_0001);
        assert_eq!(host.lparam, -2);
        assert_eq!(host.to_guest_layout(&space).unwrap(), guest);
    }

    #[test]
    fn test_wide_wparam_is_rejected() {
        let host = Msg {
            wparam: 0x1_0000_0000,
            ..Msg::default()
        };
        assert!(matches!(
            host.to_guest_layout(&space()),
            Err(LayoutError::Narrowing { field: "wParam", .. })
        ));
    }
}
