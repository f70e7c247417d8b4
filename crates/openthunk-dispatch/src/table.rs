//! Per-module entry tables
//!
//! The position of an entry is its sequence number, and the sequence number
//! is the only thing the guest sends. Both sides must therefore build the
//! table from the same ordered list; [`ModuleTable::fingerprint`] lets them
//! check that they did.

use std::fmt;
use std::sync::Arc;

use crate::envelope::{CallEnvelope, SyscallId};
use crate::RegistrationError;

/// A host-side handler. Reads its arguments from the envelope and writes the
/// result (and any out-values) back into it.
pub type Handler = Arc<dyn Fn(&mut CallEnvelope) + Send + Sync>;

struct Entry {
    name: &'static str,
    handler: Handler,
}

pub struct ModuleTable {
    id: u32,
    name: &'static str,
    entries: Vec<Entry>,
}

impl ModuleTable {
    pub fn new(id: u32, name: &'static str) -> Self {
        Self {
            id,
            name,
            entries: Vec::new(),
        }
    }

    /// Append an entry. Its sequence number is the current table length.
    pub fn entry<F>(mut self, name: &'static str, handler: F) -> Result<Self, RegistrationError>
    where
        F: Fn(&mut CallEnvelope) + Send + Sync + 'static,
    {
        if self.entries.iter().any(|e| e.name == name) {
            return Err(RegistrationError::DuplicateEntry {
                module: self.name,
                name,
            });
        }
        self.entries.push(Entry {
            name,
            handler: Arc::new(handler),
        });
        Ok(self)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|e| e.name)
    }

    pub fn sequence_of(&self, name: &str) -> Option<u32> {
        self.entries
            .iter()
            .position(|e| e.name == name)
            .map(|i| i as u32)
    }

    pub fn syscall_id(&self, name: &str) -> Option<SyscallId> {
        self.sequence_of(name).map(|seq| SyscallId::new(self.id, seq))
    }

    pub(crate) fn handler(&self, seq: u32) -> Option<(&'static str, &Handler)> {
        self.entries
            .get(seq as usize)
            .map(|e| (e.name, &e.handler))
    }

    /// FNV-1a over the ordered entry names.
    pub fn fingerprint(&self) -> u64 {
        fingerprint_names(self.names())
    }
}

impl fmt::Debug for ModuleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleTable")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// Fingerprint an ordered list of entry names the same way [`ModuleTable`] does.
pub fn fingerprint_names<'a>(names: impl IntoIterator<Item = &'a str>) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET;
    for name in names {
        for &byte in name.as_bytes().iter().chain(std::iter::once(&0u8)) {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(PRIME);
        }
    }
    hash
}
