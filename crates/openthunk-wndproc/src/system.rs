//! The window manager the hooks are installed into
//!
//! [`WindowSystem`] is the four calls class hooking needs. [`SimWindows`] is
//! an in-process window manager with real class procedures, used by tests
//! and by embedders without a native one; `Win32Windows` (Windows only)
//! talks to user32.

use std::collections::HashMap;
use std::sync::Mutex;

use openthunk_common::win::{Hwnd, LParam, LResult, WParam};

use crate::{CharSet, HookError, RawWndProc};

pub trait WindowSystem: Send + Sync {
    fn create_window(&self, class: &str, charset: CharSet) -> Result<Hwnd, HookError>;

    /// Replace the class procedure of `hwnd`'s class and return the previous one.
    fn set_class_proc(
        &self,
        hwnd: Hwnd,
        charset: CharSet,
        replacement: RawWndProc,
    ) -> Result<RawWndProc, HookError>;

    fn destroy_window(&self, hwnd: Hwnd);

    fn call_window_proc(
        &self,
        proc_: RawWndProc,
        charset: CharSet,
        hwnd: Hwnd,
        msg: u32,
        wparam: WParam,
        lparam: LParam,
    ) -> LResult;
}

#[derive(Debug, Default)]
struct SimState {
    classes: HashMap<String, RawWndProc>,
    windows: HashMap<Hwnd, String>,
    next_hwnd: Hwnd,
}

/// In-process window manager.
#[derive(Debug, Default)]
pub struct SimWindows {
    state: Mutex<SimState>,
}

impl SimWindows {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register_class(&self, class: &str, proc_: RawWndProc) {
        self.lock().classes.insert(class.to_ascii_lowercase(), proc_);
    }

    pub fn class_proc(&self, class: &str) -> Option<RawWndProc> {
        self.lock().classes.get(&class.to_ascii_lowercase()).copied()
    }

    pub fn live_windows(&self) -> usize {
        self.lock().windows.len()
    }

    /// Deliver a message through the window's current class procedure.
    pub fn send_message(&self, hwnd: Hwnd, msg: u32, wparam: WParam, lparam: LParam) -> LResult {
        let proc_ = {
            let state = self.lock();
            state
                .windows
                .get(&hwnd)
                .and_then(|class| state.classes.get(class))
                .copied()
        };
        match proc_ {
            // SAFETY: class procedures are registered by the embedder.
            Some(proc_) => unsafe { proc_(hwnd, msg, wparam, lparam) },
            None => 0,
        }
    }
}

impl WindowSystem for SimWindows {
    fn create_window(&self, class: &str, _charset: CharSet) -> Result<Hwnd, HookError> {
        let key = class.to_ascii_lowercase();
        let mut state = self.lock();
        if !state.classes.contains_key(&key) {
            return Err(HookError::CreateWindow(class.to_string()));
        }
        state.next_hwnd += 0x10;
        let hwnd = 0x0001_0000 + state.next_hwnd;
        state.windows.insert(hwnd, key);
        Ok(hwnd)
    }

    fn set_class_proc(
        &self,
        hwnd: Hwnd,
        _charset: CharSet,
        replacement: RawWndProc,
    ) -> Result<RawWndProc, HookError> {
        let mut state = self.lock();
        let class = state
            .windows
            .get(&hwnd)
            .cloned()
            .ok_or_else(|| HookError::SetClassProc(format!("{hwnd:#x}")))?;
        state
            .classes
            .insert(class.clone(), replacement)
            .ok_or(HookError::SetClassProc(class))
    }

    fn destroy_window(&self, hwnd: Hwnd) {
        self.lock().windows.remove(&hwnd);
    }

    fn call_window_proc(
        &self,
        proc_: RawWndProc,
        _charset: CharSet,
        hwnd: Hwnd,
        msg: u32,
        wparam: WParam,
        lparam: LParam,
    ) -> LResult {
        // SAFETY: `proc_` came from set_class_proc.
        unsafe { proc_(hwnd, msg, wparam, lparam) }
    }
}
