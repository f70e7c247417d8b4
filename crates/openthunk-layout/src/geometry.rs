//! `RECT` and `POINT`, identical on both sides

use openthunk_common::addr::AddressSpace;
use openthunk_common::arena::Pod;

use crate::{LayoutPair, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

// SAFETY: 32-bit integers only, no padding.
unsafe impl Pod for Rect {}
unsafe impl Pod for Point {}

impl LayoutPair for Rect {
    type Guest = Rect;
    const NAME: &'static str = "RECT";

    fn to_host_layout(guest: &Rect, _space: &AddressSpace) -> Result<Self> {
        Ok(*guest)
    }

    fn to_guest_layout(&self, _space: &AddressSpace) -> Result<Rect> {
        Ok(*self)
    }
}

impl LayoutPair for Point {
    type Guest = Point;
    const NAME: &'static str = "POINT";

    fn to_host_layout(guest: &Point, _space: &AddressSpace) -> Result<Self> {
        Ok(*guest)
    }

    fn to_guest_layout(&self, _space: &AddressSpace) -> Result<Point> {
        Ok(*self)
    }
}
