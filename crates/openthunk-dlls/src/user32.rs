//! user32: cursor entry points and notification delivery to guest windows

use std::sync::Arc;

use openthunk_common::addr::GuestAddr;
use openthunk_common::error::AddrError;
use openthunk_common::win::{Bool, LResult, FALSE, TRUE};
use openthunk_dispatch::{CallEnvelope, HostOps, ModuleTable, RegistrationError, SyscallId};
use openthunk_layout::{GuestMsg, Msg, Point, Rect};
use openthunk_wndproc::{Delivery, NotifyError, NotifyRegistry};

use crate::{bool_from_slot, GuestSide};

pub const MODULE_ID: u32 = 0;
pub const MODULE_NAME: &str = "user32";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Call {
    ClipCursor,
    GetClipCursor,
    GetCursorPos,
    SetCursorPos,
}

impl Call {
    pub const ALL: [Call; 4] = [
        Call::ClipCursor,
        Call::GetClipCursor,
        Call::GetCursorPos,
        Call::SetCursorPos,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Call::ClipCursor => "ClipCursor",
            Call::GetClipCursor => "GetClipCursor",
            Call::GetCursorPos => "GetCursorPos",
            Call::SetCursorPos => "SetCursorPos",
        }
    }

    pub fn id(self) -> SyscallId {
        SyscallId::new(MODULE_ID, self as u32)
    }
}

/// The host's cursor, as far as these entry points need it.
pub trait CursorHost: Send + Sync {
    /// Confine the cursor to `rect`, or release it for `None`.
    fn clip_cursor(&self, rect: Option<&Rect>) -> bool;
    fn clip_rect(&self) -> Option<Rect>;
    fn cursor_pos(&self) -> Option<Point>;
    fn set_cursor_pos(&self, x: i32, y: i32) -> bool;
}

pub struct User32Host {
    ops: HostOps,
    cursor: Arc<dyn CursorHost>,
    notify: NotifyRegistry,
}

impl User32Host {
    pub fn new(ops: HostOps, cursor: Arc<dyn CursorHost>) -> Self {
        Self {
            ops,
            cursor,
            notify: NotifyRegistry::new(),
        }
    }

    /// Where controls register how their notifications reach guest windows.
    pub fn notify(&self) -> &NotifyRegistry {
        &self.notify
    }

    pub fn table(self: &Arc<Self>) -> Result<ModuleTable, RegistrationError> {
        let mut table = ModuleTable::new(MODULE_ID, MODULE_NAME);
        for call in Call::ALL {
            let host = self.clone();
            table = table.entry(call.name(), move |c| host.handle(call, c))?;
        }
        Ok(table)
    }

    fn handle(&self, call: Call, c: &mut CallEnvelope) {
        let ret = match call {
            Call::ClipCursor => self.clip_cursor(c),
            Call::GetClipCursor => self.get_clip_cursor(c),
            Call::GetCursorPos => self.get_cursor_pos(c),
            Call::SetCursorPos => self.set_cursor_pos(c),
        };
        let ret = ret.unwrap_or_else(|e| {
            tracing::warn!(call = call.name(), "{e}");
            FALSE
        });
        c.set_result(ret as u32 as u64);
    }

    fn set_cursor_pos(&self, c: &CallEnvelope) -> Result<Bool, AddrError> {
        let (x, y) = (c.arg_u32(0)? as i32, c.arg_u32(1)? as i32);
        Ok(self.cursor.set_cursor_pos(x, y) as Bool)
    }

    fn clip_cursor(&self, c: &CallEnvelope) -> Result<Bool, AddrError> {
        let addr = c.arg_addr(0)?;
        let rect = if addr.is_null() {
            None
        } else {
            Some(self.ops.arena().read::<Rect>(addr)?)
        };
        Ok(self.cursor.clip_cursor(rect.as_ref()) as Bool)
    }

    fn get_clip_cursor(&self, c: &CallEnvelope) -> Result<Bool, AddrError> {
        let addr = c.arg_addr(0)?;
        if addr.is_null() {
            return Ok(FALSE);
        }
        match self.cursor.clip_rect() {
            Some(rect) => {
                self.ops.arena().write(addr, &rect)?;
                Ok(TRUE)
            }
            None => Ok(FALSE),
        }
    }

    fn get_cursor_pos(&self, c: &CallEnvelope) -> Result<Bool, AddrError> {
        let addr = c.arg_addr(0)?;
        if addr.is_null() {
            return Ok(FALSE);
        }
        match self.cursor.cursor_pos() {
            Some(pt) => {
                self.ops.arena().write(addr, &pt)?;
                Ok(TRUE)
            }
            None => Ok(FALSE),
        }
    }

    /// Send a message from a control of `class` to the guest window
    /// procedure at `wndproc`, translating notification payloads on the way.
    ///
    /// # Safety
    ///
    /// For `WM_NOTIFY`, `host.lparam` must point to a live notification record.
    pub unsafe fn deliver_to_guest(
        &self,
        class: &str,
        host: &Msg,
        wndproc: GuestAddr,
    ) -> Result<Delivery, NotifyError> {
        self.notify.deliver(class, host, self.ops.arena(), |guest| {
            self.call_guest_wndproc(wndproc, guest)
        })
    }

    fn call_guest_wndproc(&self, wndproc: GuestAddr, msg: &GuestMsg) -> LResult {
        let arena = self.ops.arena();
        let addr = match arena.alloc_value(msg) {
            Ok(addr) => addr,
            Err(e) => {
                tracing::error!(?wndproc, "cannot pass message to the guest: {e}");
                return 0;
            }
        };
        let ret = self.ops.execute(wndproc, u64::from(addr.get())).unwrap_or(0);
        let _ = arena.free(addr);
        // The guest's LRESULT is 32 bits wide.
        ret as u32 as i32 as LResult
    }
}

impl std::fmt::Debug for User32Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("User32Host").field("notify", &self.notify).finish()
    }
}

/// Guest-side stubs.
#[derive(Debug, Clone)]
pub struct User32Guest {
    side: GuestSide,
}

impl User32Guest {
    pub fn new(side: GuestSide) -> Self {
        Self { side }
    }

    fn call(&self, call: Call, args: &[u64]) -> Bool {
        let mut envelope = CallEnvelope::new(call.id());
        for (i, &arg) in args.iter().enumerate() {
            envelope.set_arg(i, arg);
        }
        match self.side.syscall(&mut envelope) {
            Ok(()) => bool_from_slot(envelope.result()),
            Err(_) => FALSE,
        }
    }

    pub fn clip_cursor(&self, rect: Option<&Rect>) -> Bool {
        self.side
            .scratch(rect, |addr| self.call(Call::ClipCursor, &[u64::from(addr.get())]))
            .unwrap_or(FALSE)
    }

    pub fn get_clip_cursor(&self, rect: Option<&mut Rect>) -> Bool {
        let Some(rect) = rect else {
            return self.call(Call::GetClipCursor, &[0]);
        };
        match self
            .side
            .out_value::<Rect, _>(|addr| self.call(Call::GetClipCursor, &[u64::from(addr.get())]))
        {
            Ok((ret, value)) => {
                if ret != FALSE {
                    *rect = value;
                }
                ret
            }
            Err(_) => FALSE,
        }
    }

    pub fn get_cursor_pos(&self, pt: Option<&mut Point>) -> Bool {
        let Some(pt) = pt else {
            return self.call(Call::GetCursorPos, &[0]);
        };
        match self
            .side
            .out_value::<Point, _>(|addr| self.call(Call::GetCursorPos, &[u64::from(addr.get())]))
        {
            Ok((ret, value)) => {
                if ret != FALSE {
                    *pt = value;
                }
                ret
            }
            Err(_) => FALSE,
        }
    }

    pub fn set_cursor_pos(&self, x: i32, y: i32) -> Bool {
        self.call(
            Call::SetCursorPos,
            &[u64::from(x as u32), u64::from(y as u32)],
        )
    }
}
