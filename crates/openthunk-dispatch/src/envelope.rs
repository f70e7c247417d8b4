//! The fixed-size record one cross-boundary call travels in

use std::fmt;

use openthunk_common::addr::{uint_ptr_to_guest, GuestAddr};
use openthunk_common::error::AddrError;
use openthunk_common::win::HResult;

/// Argument slots per envelope.
pub const MAX_ARGS: usize = 16;

/// Operation identifier: module id in the high 32 bits, sequence number in
/// the module's table in the low 32 bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SyscallId(u64);

impl SyscallId {
    pub const fn new(module: u32, seq: u32) -> Self {
        Self(((module as u64) << 32) | seq as u64)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn module(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub const fn seq(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Debug for SyscallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SyscallId({}:{})", self.module(), self.seq())
    }
}

impl fmt::Display for SyscallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module(), self.seq())
    }
}

/// Arguments and result of one call.
///
/// Filled by the caller, handed to [`crate::Transport::syscall`], updated in
/// place by the handler (result slot and out-value argument slots) and then
/// read back by the caller.
#[derive(Debug, Clone)]
pub struct CallEnvelope {
    id: SyscallId,
    iret: u64,
    argc: usize,
    args: [u64; MAX_ARGS],
}

impl CallEnvelope {
    pub fn new(id: SyscallId) -> Self {
        Self {
            id,
            iret: 0,
            argc: 0,
            args: [0; MAX_ARGS],
        }
    }

    pub fn id(&self) -> SyscallId {
        self.id
    }

    /// Builder form of [`set_arg`](Self::set_arg).
    pub fn with_arg(mut self, index: usize, value: u64) -> Self {
        self.set_arg(index, value);
        self
    }

    /// # Panics
    ///
    /// If `index >= MAX_ARGS`. Envelope shapes are fixed per operation, so an
    /// out-of-range slot is a bug in the stub, not a runtime condition.
    pub fn set_arg(&mut self, index: usize, value: u64) {
        assert!(index < MAX_ARGS, "envelope slot {index} out of range");
        self.args[index] = value;
        self.argc = self.argc.max(index + 1);
    }

    /// Unset slots read as 0.
    pub fn arg(&self, index: usize) -> u64 {
        self.args.get(index).copied().unwrap_or(0)
    }

    pub fn arg_u32(&self, index: usize) -> Result<u32, AddrError> {
        uint_ptr_to_guest(self.arg(index))
    }

    /// A slot holding a guest pointer.
    pub fn arg_addr(&self, index: usize) -> Result<GuestAddr, AddrError> {
        GuestAddr::from_slot(self.arg(index))
    }

    /// The slots written so far.
    pub fn args(&self) -> &[u64] {
        &self.args[..self.argc]
    }

    pub fn set_result(&mut self, value: u64) {
        self.iret = value;
    }

    pub fn result(&self) -> u64 {
        self.iret
    }

    pub fn set_hresult(&mut self, hr: HResult) {
        self.iret = hr.to_slot();
    }

    pub fn hresult(&self) -> HResult {
        HResult::from_slot(self.iret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_packing() {
        let id = SyscallId::new(3, 17);
        assert_eq!(id.raw(), 0x0000_0003_0000_0011);
        assert_eq!((id.module(), id.seq()), (3, 17));
        assert_eq!(SyscallId::from_raw(id.raw()), id);
        assert_eq!(id.to_string(), "3:17");
    }

    #[test]
    fn test_args_track_highest_slot() {
        let mut call = CallEnvelope::new(SyscallId::new(0, 0)).with_arg(2, 9);
        assert_eq!(call.args(), &[0, 0, 9]);
        call.set_arg(0, 1);
        assert_eq!(call.args().len(), 3);
        assert_eq!(call.arg(15), 0);
        assert_eq!(call.arg(99), 0);
    }

    #[test]
    fn test_address_slot_width_check() {
        let call = CallEnvelope::new(SyscallId::new(0, 0))
            .with_arg(0, 0x0040_1000)
            .with_arg(1, 0x1_0000_0000);
        assert_eq!(call.arg_addr(0).unwrap(), GuestAddr::new(0x0040_1000));
        assert!(matches!(call.arg_addr(1), Err(AddrError::SlotTooWide(_))));
        assert!(call.arg_u32(1).is_err());
    }

    #[test]
    fn test_hresult_slot() {
        let mut call = CallEnvelope::new(SyscallId::new(0, 0));
        call.set_hresult(HResult::E_OUTOFMEMORY);
        assert_eq!(call.result(), 0x8007_000e);
        assert_eq!(call.hresult(), HResult::E_OUTOFMEMORY);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_slot_past_end_panics() {
        CallEnvelope::new(SyscallId::new(0, 0)).set_arg(MAX_ARGS, 1);
    }
}
