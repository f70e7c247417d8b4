//! Host notifications delivered to guest listeners
//!
//! A control sends `WM_NOTIFY` to its parent with an lParam pointing at a
//! host-shaped record that starts with `NMHDR`. When the parent is a guest
//! window the record has to be rebuilt in guest memory first. Which records
//! a control sends depends on its class, so translations are registered per
//! window class.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use openthunk_common::addr::{int_ptr_to_host, GuestAddr};
use openthunk_common::arena::GuestArena;
use openthunk_common::error::AddrError;
use openthunk_common::win::{LResult, WM_NOTIFY};
use openthunk_layout::{GuestMsg, GuestNmHdr, LayoutPair, Msg, NmHdr};

use crate::NotifyError;

/// Translation of one class's notification records.
pub trait NotifyRule: Send + Sync {
    /// Build the guest copy of a notification record in the guest heap.
    /// `Ok(None)` means the code is not one this rule knows.
    ///
    /// # Safety
    ///
    /// `host` points to a live record that starts with `NMHDR` and whose
    /// shape is given by its code.
    unsafe fn to_guest(
        &self,
        host: *const NmHdr,
        arena: &GuestArena,
    ) -> Result<Option<GuestAddr>, NotifyError>;

    /// Copy fields the guest listener may have changed back into the host
    /// record.
    ///
    /// # Safety
    ///
    /// Same as [`NotifyRule::to_guest`], and the record is writable.
    unsafe fn from_guest(
        &self,
        _host: *mut NmHdr,
        _guest: GuestAddr,
        _arena: &GuestArena,
    ) -> Result<(), NotifyError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// Not a notification; delivered with lParam as an integer.
    Passthrough,
    /// The class rule built the guest record.
    Translated,
    /// The class rule does not know this code. The listener got the header only.
    Unhandled { code: u32 },
    /// No rule for this class. The listener got the header only.
    Untracked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub result: LResult,
    pub outcome: NotifyOutcome,
}

#[derive(Default)]
pub struct NotifyRegistry {
    rules: RwLock<HashMap<String, Arc<dyn NotifyRule>>>,
    unhandled: AtomicU64,
    /// Header records kept back for when the guest heap is exhausted.
    spare_headers: Mutex<Vec<GuestAddr>>,
}

impl NotifyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_callback_translation(
        &self,
        class: &str,
        rule: Arc<dyn NotifyRule>,
    ) -> Result<(), NotifyError> {
        let key = class.to_ascii_lowercase();
        let mut rules = self.rules.write().unwrap_or_else(|e| e.into_inner());
        if rules.contains_key(&key) {
            return Err(NotifyError::AlreadyRegistered(class.to_string()));
        }
        rules.insert(key, rule);
        tracing::debug!(class, "notification translation registered");
        Ok(())
    }

    /// Replace the rule for `class`, returning the previous one.
    pub fn reregister(&self, class: &str, rule: Arc<dyn NotifyRule>) -> Option<Arc<dyn NotifyRule>> {
        let previous = self
            .rules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(class.to_ascii_lowercase(), rule);
        tracing::debug!(class, replaced = previous.is_some(), "notification translation reregistered");
        previous
    }

    pub fn unregister(&self, class: &str) -> Result<Arc<dyn NotifyRule>, NotifyError> {
        self.rules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&class.to_ascii_lowercase())
            .ok_or_else(|| NotifyError::NotRegistered(class.to_string()))
    }

    pub fn rule(&self, class: &str) -> Option<Arc<dyn NotifyRule>> {
        self.rules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&class.to_ascii_lowercase())
            .cloned()
    }

    pub fn classes(&self) -> Vec<String> {
        let mut classes: Vec<_> = self
            .rules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        classes.sort();
        classes
    }

    /// Set aside `count` header records in `arena`. A header-only delivery
    /// that cannot allocate uses one of these instead of dropping the
    /// notification. Deliveries must use the same arena.
    pub fn reserve_headers(&self, arena: &GuestArena, count: usize) -> Result<(), NotifyError> {
        let mut spare = self.spare_headers.lock().unwrap_or_else(|e| e.into_inner());
        for _ in 0..count {
            spare.push(arena.alloc_value(&GuestNmHdr::default())?);
        }
        Ok(())
    }

    pub fn spare_headers(&self) -> usize {
        self.spare_headers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn put_spare(&self, addr: GuestAddr) {
        self.spare_headers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(addr);
    }

    /// Notifications whose code no rule recognised.
    pub fn unhandled_count(&self) -> u64 {
        self.unhandled.load(Ordering::Relaxed)
    }

    /// Deliver a message sent by a control of `class` to a guest listener.
    ///
    /// `call_guest` runs the listener with the guest-shaped message. A guest
    /// record allocated here is freed once it returns, unless the delivered
    /// lParam is the host's own.
    ///
    /// # Safety
    ///
    /// For `WM_NOTIFY` with a non-null lParam, `host.lparam` must point to a
    /// live writable notification record.
    pub unsafe fn deliver<F>(
        &self,
        class: &str,
        host: &Msg,
        arena: &GuestArena,
        call_guest: F,
    ) -> Result<Delivery, NotifyError>
    where
        F: FnOnce(&GuestMsg) -> LResult,
    {
        let space = arena.space();
        if host.message != WM_NOTIFY || host.lparam == 0 {
            let guest = host.to_guest_layout(space)?;
            let result = call_guest(&guest);
            return Ok(Delivery {
                result,
                outcome: NotifyOutcome::Passthrough,
            });
        }

        // Narrow everything but lParam before anything is allocated.
        let mut guest = Msg { lparam: 0, ..*host }.to_guest_layout(space)?;
        let record = host.lparam as *mut NmHdr;
        let hdr = *record;
        let rule = self.rule(class);

        let mut spare = false;
        let (payload, outcome) = match rule.as_ref() {
            Some(rule) => match rule.to_guest(record, arena)? {
                Some(addr) => (addr, NotifyOutcome::Translated),
                None => {
                    self.unhandled.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        class,
                        code = hdr.code as i32,
                        "unhandled notification, delivering the header only"
                    );
                    let (addr, reserved) = self.header_only(&hdr, arena)?;
                    spare = reserved;
                    (addr, NotifyOutcome::Unhandled { code: hdr.code })
                }
            },
            None => {
                tracing::debug!(class, code = hdr.code as i32, "no notification translation for class");
                let (addr, reserved) = self.header_only(&hdr, arena)?;
                spare = reserved;
                (addr, NotifyOutcome::Untracked)
            }
        };

        guest.lparam = payload.get();
        tracing::trace!(class, code = hdr.code as i32, ?payload, "delivering notification");
        let result = call_guest(&guest);

        if outcome == NotifyOutcome::Translated {
            if let Some(rule) = rule.as_ref() {
                if let Err(e) = rule.from_guest(record, payload, arena) {
                    tracing::warn!(class, code = hdr.code as i32, "copying back notification: {e}");
                }
            }
        }
        if spare {
            self.put_spare(payload);
        } else if int_ptr_to_host(guest.lparam) as isize != host.lparam {
            arena.free(payload)?;
        }
        Ok(Delivery { result, outcome })
    }
}

impl std::fmt::Debug for NotifyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyRegistry")
            .field("classes", &self.classes())
            .field("unhandled", &self.unhandled_count())
            .finish()
    }
}

impl NotifyRegistry {
    /// The guest copy of a bare header, and whether it is a spare record.
    fn header_only(&self, hdr: &NmHdr, arena: &GuestArena) -> Result<(GuestAddr, bool), NotifyError> {
        let guest = hdr.to_guest_layout(arena.space())?;
        let e = match arena.alloc_value(&guest) {
            Ok(addr) => return Ok((addr, false)),
            Err(e @ AddrError::OutOfMemory(_)) => e,
            Err(e) => return Err(e.into()),
        };
        let taken = self
            .spare_headers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop();
        let Some(addr) = taken else {
            return Err(e.into());
        };
        if let Err(e) = arena.write(addr, &guest) {
            self.put_spare(addr);
            return Err(e.into());
        }
        tracing::warn!(code = hdr.code as i32, "guest heap exhausted, header delivered from a spare record");
        Ok((addr, true))
    }
}
