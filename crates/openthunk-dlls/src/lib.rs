//! Translated modules
//!
//! Each module has a host side (a [`ModuleTable`] of handlers plus, where
//! the module hooks window classes, the replacement procedures) and a guest
//! side that packs calls into envelopes. Both sides agree on the entry order
//! through the module's `Call` enum.
//!
//! [`ModuleTable`]: openthunk_dispatch::ModuleTable

pub mod bridge;
pub mod comctl32;
pub mod dxgi;
pub mod riched20;
pub mod user32;

use std::sync::Arc;

use openthunk_common::addr::GuestAddr;
use openthunk_common::arena::{GuestArena, Pod};
use openthunk_common::error::AddrError;
use openthunk_common::win::{Bool, HResult, FALSE, TRUE};
use openthunk_dispatch::{CallEnvelope, ProtocolError, Transport};
use openthunk_wndproc::{
    install_classes, uninstall, CharSet, HookError, HookSlot, Interceptor, MessageTranslator,
    RawWndProc, WindowSystem,
};
use thiserror::Error;

pub use bridge::{Bridge, Hosts};

/// A guest-side call that never reached its handler.
#[derive(Error, Debug)]
pub enum GuestCallError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Addr(#[from] AddrError),
}

impl GuestCallError {
    /// The wrapped API's failure code for this error.
    pub fn hresult(&self) -> HResult {
        match self {
            Self::Addr(AddrError::OutOfMemory(_)) => HResult::E_OUTOFMEMORY,
            Self::Addr(_) => HResult::E_INVALIDARG,
            Self::Protocol(_) => HResult::E_FAIL,
        }
    }
}

/// What guest stubs need: the way across and the guest's memory.
#[derive(Clone)]
pub struct GuestSide {
    transport: Arc<dyn Transport>,
    arena: Arc<GuestArena>,
}

impl GuestSide {
    pub fn new(transport: Arc<dyn Transport>, arena: Arc<GuestArena>) -> Self {
        Self { transport, arena }
    }

    pub fn arena(&self) -> &GuestArena {
        &self.arena
    }

    pub fn syscall(&self, call: &mut CallEnvelope) -> Result<(), ProtocolError> {
        self.transport.syscall(call)
    }

    /// Copy `value` into the guest heap for the duration of `f`. `None`
    /// passes the null address.
    pub fn scratch<T: Pod, R>(
        &self,
        value: Option<&T>,
        f: impl FnOnce(GuestAddr) -> R,
    ) -> Result<R, AddrError> {
        let Some(value) = value else {
            return Ok(f(GuestAddr::NULL));
        };
        let addr = self.arena.alloc_value(value)?;
        let ret = f(addr);
        self.arena.free(addr)?;
        Ok(ret)
    }

    /// Run `f` with a zeroed guest buffer for an out-value, then read it.
    pub fn out_value<T: Pod, R>(
        &self,
        f: impl FnOnce(GuestAddr) -> R,
    ) -> Result<(R, T), AddrError> {
        let addr = self.arena.alloc(std::mem::size_of::<T>())?;
        let ret = f(addr);
        let value = self.arena.read::<T>(addr);
        self.arena.free(addr)?;
        Ok((ret, value?))
    }

    /// Like [`out_value`](Self::out_value) for `count` values. No buffer,
    /// and the null address, for zero.
    pub fn out_array<T: Pod, R>(
        &self,
        count: usize,
        f: impl FnOnce(GuestAddr) -> R,
    ) -> Result<(R, Vec<T>), AddrError> {
        if count == 0 {
            return Ok((f(GuestAddr::NULL), Vec::new()));
        }
        let addr = self.arena.alloc(count * std::mem::size_of::<T>())?;
        let ret = f(addr);
        let values = self.arena.read_array::<T>(addr, count);
        self.arena.free(addr)?;
        Ok((ret, values?))
    }
}

impl std::fmt::Debug for GuestSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestSide").field("arena", &self.arena).finish()
    }
}

/// A class procedure replaced at start-up, with what is needed to put the
/// original back.
pub struct InstalledHook {
    classes: &'static [&'static str],
    charset: CharSet,
    original: RawWndProc,
    slot: &'static HookSlot<Interceptor>,
}

impl InstalledHook {
    pub fn classes(&self) -> &'static [&'static str] {
        self.classes
    }

    pub fn original(&self) -> RawWndProc {
        self.original
    }

    /// Restore the original procedure, then empty the slot.
    pub fn remove(self, system: &dyn WindowSystem) -> Result<(), HookError> {
        let mut result = Ok(());
        for class in self.classes {
            if let Err(e) = uninstall(system, class, self.charset, self.original) {
                result = Err(e);
            }
        }
        self.slot.teardown();
        result
    }
}

impl std::fmt::Debug for InstalledHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstalledHook")
            .field("classes", &self.classes)
            .field("charset", &self.charset)
            .finish()
    }
}

/// Hook `classes` with `replacement` and fill `slot` with the interceptor
/// built around the original procedure.
pub(crate) fn hook_classes(
    system: &Arc<dyn WindowSystem>,
    classes: &'static [&'static str],
    charset: CharSet,
    replacement: RawWndProc,
    slot: &'static HookSlot<Interceptor>,
    translator: impl MessageTranslator + 'static,
) -> Result<InstalledHook, HookError> {
    if slot.is_installed() {
        return Err(HookError::AlreadyInstalled(classes.first().copied().unwrap_or("")));
    }
    let original = install_classes(system.as_ref(), classes, charset, replacement)?;
    let interceptor = Interceptor::new(
        classes.first().copied().unwrap_or(""),
        original,
        charset,
        system.clone(),
        translator,
    );
    let hook = InstalledHook {
        classes,
        charset,
        original,
        slot,
    };
    if let Err(e) = slot.install(interceptor) {
        let _ = hook.remove(system.as_ref());
        return Err(e);
    }
    Ok(hook)
}

pub(crate) fn bool_from_slot(slot: u64) -> Bool {
    if slot as u32 != 0 {
        TRUE
    } else {
        FALSE
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use openthunk_common::arena::GuestArena;
    use openthunk_dispatch::{GuestFunctions, HostOps};

    pub fn arena() -> Arc<GuestArena> {
        Arc::new(GuestArena::new(0x0001_0000, 0x0001_0000).unwrap())
    }

    pub fn ops() -> (HostOps, Arc<GuestFunctions>) {
        let arena = arena();
        let funcs = Arc::new(GuestFunctions::new(arena.clone()));
        (HostOps::new(arena, funcs.clone()), funcs)
    }
}
