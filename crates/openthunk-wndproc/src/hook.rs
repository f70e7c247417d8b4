//! Class procedure replacement
//!
//! A class procedure can only be swapped through a window of that class, so
//! [`install`] creates a throwaway window, swaps the procedure and destroys
//! the window again. Windows created afterwards use the replacement.

use std::sync::{Arc, RwLock};

use openthunk_common::win::{Hwnd, LParam, LResult, WParam};

use crate::intercept::Interceptor;
use crate::system::WindowSystem;
use crate::{CharSet, HookError, RawWndProc};

/// Replace the class procedure of `class` and return the original.
pub fn install(
    system: &dyn WindowSystem,
    class: &str,
    charset: CharSet,
    replacement: RawWndProc,
) -> Result<RawWndProc, HookError> {
    let hwnd = system.create_window(class, charset).map_err(|e| {
        tracing::error!(class, "{e}");
        e
    })?;
    let swapped = system.set_class_proc(hwnd, charset, replacement);
    system.destroy_window(hwnd);
    let original = swapped.map_err(|e| {
        tracing::error!(class, "{e}");
        e
    })?;
    tracing::debug!(
        class,
        ?charset,
        original = format_args!("{:#x}", original as usize),
        "class procedure replaced"
    );
    Ok(original)
}

/// Hook several classes that are registered with the same procedure, such
/// as the ANSI aliases of one control.
pub fn install_classes(
    system: &dyn WindowSystem,
    classes: &[&str],
    charset: CharSet,
    replacement: RawWndProc,
) -> Result<RawWndProc, HookError> {
    let (first, rest) = classes.split_first().ok_or(HookError::NoClasses)?;
    let original = install(system, first, charset, replacement)?;
    for class in rest {
        let other = install(system, class, charset, replacement)?;
        if other as usize != original as usize {
            let err = HookError::OriginalMismatch {
                class: class.to_string(),
                first: first.to_string(),
            };
            tracing::error!("{err}");
            return Err(err);
        }
    }
    Ok(original)
}

/// Put the original procedure back.
pub fn uninstall(
    system: &dyn WindowSystem,
    class: &str,
    charset: CharSet,
    original: RawWndProc,
) -> Result<(), HookError> {
    install(system, class, charset, original).map(|_| ())
}

/// Process-wide home of one installed hook.
///
/// The replacement procedure is a plain `extern "system"` function, so the
/// state it needs lives in a `static HookSlot` filled once at start-up.
pub struct HookSlot<T> {
    name: &'static str,
    inner: RwLock<Option<Arc<T>>>,
}

impl<T> HookSlot<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: RwLock::new(None),
        }
    }

    pub fn install(&self, value: T) -> Result<Arc<T>, HookError> {
        let mut slot = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Err(HookError::AlreadyInstalled(self.name));
        }
        let value = Arc::new(value);
        *slot = Some(value.clone());
        Ok(value)
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_installed(&self) -> bool {
        self.inner.read().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Empty the slot. Calls already in flight keep their own `Arc`.
    pub fn teardown(&self) -> Option<Arc<T>> {
        let taken = self.inner.write().unwrap_or_else(|e| e.into_inner()).take();
        if taken.is_some() {
            tracing::debug!(hook = self.name, "hook torn down");
        }
        taken
    }
}

impl HookSlot<Interceptor> {
    /// Body of a replacement class procedure.
    pub fn dispatch(&self, hwnd: Hwnd, msg: u32, wparam: WParam, lparam: LParam) -> LResult {
        match self.get() {
            Some(interceptor) => interceptor.handle(hwnd, msg, wparam, lparam),
            None => {
                tracing::error!(hook = self.name, msg, "message for a hook that is not installed");
                0
            }
        }
    }
}
