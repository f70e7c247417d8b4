//! Window Procedure Interceptor
//!
//! Replaces the class procedure of a window class so messages carrying
//! guest-shaped structures are converted before the real procedure sees
//! them ([`hook`], [`intercept`]), and translates host notifications into
//! guest-shaped payloads on the way back to guest listeners ([`notify`]).

pub mod hook;
pub mod intercept;
pub mod notify;
pub mod system;
#[cfg(windows)]
pub mod win32;

use openthunk_common::error::AddrError;
use openthunk_common::win::{Hwnd, LParam, LResult, WParam};
use openthunk_dispatch::ProtocolError;
use openthunk_layout::LayoutError;
use thiserror::Error;

pub use hook::{install, install_classes, uninstall, HookSlot};
pub use intercept::{Interceptor, MessageTranslator, Payload, Translation};
pub use notify::{Delivery, NotifyOutcome, NotifyRegistry, NotifyRule};
pub use system::{SimWindows, WindowSystem};
#[cfg(windows)]
pub use win32::Win32Windows;

pub type RawWndProc = unsafe extern "system" fn(Hwnd, u32, WParam, LParam) -> LResult;

/// Which flavour of the class procedure is being replaced or called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharSet {
    Ansi,
    Wide,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    #[error("failed to create a {0} window")]
    CreateWindow(String),

    #[error("failed to replace the class procedure of {0}")]
    SetClassProc(String),

    #[error("{class} does not share its original procedure with {first}")]
    OriginalMismatch { class: String, first: String },

    #[error("no window classes given")]
    NoClasses,

    #[error("hook for {0} is already installed")]
    AlreadyInstalled(&'static str),
}

/// A message that could not be converted; the call is aborted.
#[derive(Error, Debug)]
pub enum TranslateError {
    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Addr(#[from] AddrError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error(transparent)]
    Addr(#[from] AddrError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error("notification translation for {0} is already registered")]
    AlreadyRegistered(String),

    #[error("no notification translation registered for {0}")]
    NotRegistered(String),
}
