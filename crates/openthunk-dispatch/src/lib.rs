//! Call Envelope and Dispatch Table
//!
//! Guest code packs a call into a [`CallEnvelope`] and hands it to a
//! [`Transport`]. On the host the [`Dispatcher`] looks up the handler by
//! module id and sequence number and runs it to completion on the calling
//! thread.

pub mod dispatcher;
pub mod envelope;
pub mod guest;
pub mod table;

use openthunk_common::addr::GuestAddr;
use thiserror::Error;

pub use dispatcher::{Dispatcher, DispatcherBuilder, Transport};
pub use envelope::{CallEnvelope, SyscallId, MAX_ARGS};
pub use guest::{GuestExecutor, GuestFn, GuestFunctions, HostOps};
pub use table::{fingerprint_names, Handler, ModuleTable};

/// The two sides disagree about the protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown module in operation {0}")]
    UnknownModule(SyscallId),

    #[error("operation {id} is past the end of {module} ({entries} entries)")]
    UnknownOperation {
        id: SyscallId,
        module: &'static str,
        entries: usize,
    },

    #[error("{module} table fingerprint mismatch: ours {expected:#018x}, theirs {actual:#018x}")]
    FingerprintMismatch {
        module: &'static str,
        expected: u64,
        actual: u64,
    },

    #[error("no guest function at {0}")]
    UnknownGuestFunction(GuestAddr),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("{module}: entry {name} registered twice")]
    DuplicateEntry {
        module: &'static str,
        name: &'static str,
    },

    #[error("module id {id} already taken by {existing}, cannot register {name}")]
    DuplicateModule {
        id: u32,
        existing: &'static str,
        name: &'static str,
    },

    #[error("required module {0} was not registered")]
    MissingModule(u32),
}
