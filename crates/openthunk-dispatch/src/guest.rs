//! Calls in the other direction: the host running guest code
//!
//! Callbacks, COM methods implemented by the guest and guest-side destructors
//! are all reached through [`GuestExecutor::execute`] with the guest address
//! of the function and one word-sized argument.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use openthunk_common::addr::{AddressSpace, GuestAddr};
use openthunk_common::arena::GuestArena;
use openthunk_common::error::AddrError;

use crate::ProtocolError;

pub trait GuestExecutor: Send + Sync {
    fn execute(&self, func: GuestAddr, arg: u64) -> Result<u64, ProtocolError>;
}

pub type GuestFn = Arc<dyn Fn(u64) -> u64 + Send + Sync>;

/// In-process guest code: closures registered at guest addresses.
///
/// Each function gets a small block of the guest heap so its address is a
/// real guest address that round-trips through the window.
pub struct GuestFunctions {
    arena: Arc<GuestArena>,
    funcs: RwLock<HashMap<GuestAddr, GuestFn>>,
}

impl GuestFunctions {
    pub fn new(arena: Arc<GuestArena>) -> Self {
        Self {
            arena,
            funcs: RwLock::new(HashMap::new()),
        }
    }

    pub fn register<F>(&self, func: F) -> Result<GuestAddr, AddrError>
    where
        F: Fn(u64) -> u64 + Send + Sync + 'static,
    {
        let addr = self.arena.alloc(16)?;
        self.funcs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(addr, Arc::new(func));
        tracing::debug!(?addr, "guest function registered");
        Ok(addr)
    }

    pub fn unregister(&self, addr: GuestAddr) -> bool {
        let removed = self
            .funcs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&addr)
            .is_some();
        if removed {
            let _ = self.arena.free(addr);
        }
        removed
    }
}

impl GuestExecutor for GuestFunctions {
    fn execute(&self, func: GuestAddr, arg: u64) -> Result<u64, ProtocolError> {
        // Clone out of the lock: guest code may call back into the host,
        // which may register or execute further guest functions.
        let target = self
            .funcs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&func)
            .cloned();
        let Some(target) = target else {
            let err = ProtocolError::UnknownGuestFunction(func);
            tracing::error!("{err}");
            return Err(err);
        };
        tracing::trace!(?func, arg = format_args!("{arg:#x}"), "execute guest function");
        Ok(target(arg))
    }
}

impl std::fmt::Debug for GuestFunctions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.funcs.read().map(|m| m.len()).unwrap_or(0);
        f.debug_struct("GuestFunctions").field("registered", &count).finish()
    }
}

/// What a host handler may use beyond its envelope.
#[derive(Clone)]
pub struct HostOps {
    arena: Arc<GuestArena>,
    executor: Arc<dyn GuestExecutor>,
}

impl HostOps {
    pub fn new(arena: Arc<GuestArena>, executor: Arc<dyn GuestExecutor>) -> Self {
        Self { arena, executor }
    }

    pub fn arena(&self) -> &GuestArena {
        &self.arena
    }

    pub fn arena_arc(&self) -> &Arc<GuestArena> {
        &self.arena
    }

    pub fn space(&self) -> &AddressSpace {
        self.arena.space()
    }

    pub fn execute(&self, func: GuestAddr, arg: u64) -> Result<u64, ProtocolError> {
        self.executor.execute(func, arg)
    }
}

impl std::fmt::Debug for HostOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostOps").field("arena", &self.arena).finish()
    }
}
