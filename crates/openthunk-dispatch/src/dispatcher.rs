//! Routing envelopes to handlers

use std::collections::BTreeMap;

use crate::envelope::CallEnvelope;
use crate::table::ModuleTable;
use crate::{ProtocolError, RegistrationError};

/// The single cross-boundary entry point.
pub trait Transport: Send + Sync {
    fn syscall(&self, call: &mut CallEnvelope) -> Result<(), ProtocolError>;
}

/// Immutable once built: routing takes no locks.
#[derive(Debug)]
pub struct Dispatcher {
    modules: BTreeMap<u32, ModuleTable>,
}

#[derive(Debug, Default)]
pub struct DispatcherBuilder {
    modules: BTreeMap<u32, ModuleTable>,
    required: Vec<u32>,
}

impl DispatcherBuilder {
    pub fn register(mut self, table: ModuleTable) -> Result<Self, RegistrationError> {
        if let Some(existing) = self.modules.get(&table.id()) {
            return Err(RegistrationError::DuplicateModule {
                id: table.id(),
                existing: existing.name(),
                name: table.name(),
            });
        }
        tracing::debug!(
            module = table.name(),
            id = table.id(),
            entries = table.len(),
            fingerprint = format_args!("{:#018x}", table.fingerprint()),
            "registered module table"
        );
        self.modules.insert(table.id(), table);
        Ok(self)
    }

    /// Make a missing module a build error rather than a runtime protocol error.
    pub fn require(mut self, id: u32) -> Self {
        self.required.push(id);
        self
    }

    pub fn build(self) -> Result<Dispatcher, RegistrationError> {
        if let Some(&id) = self.required.iter().find(|id| !self.modules.contains_key(id)) {
            return Err(RegistrationError::MissingModule(id));
        }
        Ok(Dispatcher {
            modules: self.modules,
        })
    }
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    pub fn module(&self, id: u32) -> Option<&ModuleTable> {
        self.modules.get(&id)
    }

    pub fn modules(&self) -> impl Iterator<Item = &ModuleTable> {
        self.modules.values()
    }

    /// Run the handler named by the envelope's id, synchronously.
    ///
    /// An id outside the registered tables means the two sides were built
    /// from different tables. That is logged and returned; nothing runs.
    pub fn dispatch(&self, call: &mut CallEnvelope) -> Result<(), ProtocolError> {
        let id = call.id();
        let Some(table) = self.modules.get(&id.module()) else {
            let err = ProtocolError::UnknownModule(id);
            tracing::error!("{err}");
            return Err(err);
        };
        let Some((name, handler)) = table.handler(id.seq()) else {
            let err = ProtocolError::UnknownOperation {
                id,
                module: table.name(),
                entries: table.len(),
            };
            tracing::error!("{err}");
            return Err(err);
        };

        tracing::trace!(module = table.name(), op = name, args = ?call.args(), "dispatch");
        handler(call);
        tracing::trace!(module = table.name(), op = name, ret = call.result(), "dispatch done");
        Ok(())
    }

    /// Compare the other side's fingerprint for `module` with ours.
    pub fn verify(&self, module: u32, fingerprint: u64) -> Result<(), ProtocolError> {
        let table = self
            .modules
            .get(&module)
            .ok_or(ProtocolError::UnknownModule(crate::SyscallId::new(module, 0)))?;
        let ours = table.fingerprint();
        if ours != fingerprint {
            let err = ProtocolError::FingerprintMismatch {
                module: table.name(),
                expected: ours,
                actual: fingerprint,
            };
            tracing::error!("{err}");
            return Err(err);
        }
        Ok(())
    }
}

impl Transport for Dispatcher {
    fn syscall(&self, call: &mut CallEnvelope) -> Result<(), ProtocolError> {
        self.dispatch(call)
    }
}
