//! Per-message translation around an original class procedure

use std::sync::Arc;

use openthunk_common::win::{Hwnd, LParam, LResult, WParam};

use crate::system::WindowSystem;
use crate::{CharSet, RawWndProc, TranslateError};

/// A converted lParam and whatever is needed to convert the answer back.
///
/// The payload is dropped once the original procedure has returned, which
/// frees its buffers, unless [`Payload::transferred`] says the receiver
/// now owns them.
pub trait Payload: Send {
    fn lparam(&self) -> LParam;

    /// Translate the response. Runs after the original procedure returned.
    fn complete(&mut self, ret: LResult) -> Result<LResult, TranslateError> {
        Ok(ret)
    }

    fn transferred(&self) -> bool {
        false
    }
}

pub enum Translation {
    /// Pass the message through unchanged.
    Forward,
    /// Forward with the payload's lParam, then complete.
    Translated(Box<dyn Payload>),
    /// Do not forward; return this value.
    Handled(LResult),
}

impl std::fmt::Debug for Translation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Forward => f.write_str("Forward"),
            Self::Translated(p) => write!(f, "Translated({:#x})", p.lparam()),
            Self::Handled(r) => write!(f, "Handled({r})"),
        }
    }
}

pub trait MessageTranslator: Send + Sync {
    fn translate(
        &self,
        hwnd: Hwnd,
        msg: u32,
        wparam: WParam,
        lparam: LParam,
    ) -> Result<Translation, TranslateError>;
}

impl<F> MessageTranslator for F
where
    F: Fn(Hwnd, u32, WParam, LParam) -> Result<Translation, TranslateError> + Send + Sync,
{
    fn translate(
        &self,
        hwnd: Hwnd,
        msg: u32,
        wparam: WParam,
        lparam: LParam,
    ) -> Result<Translation, TranslateError> {
        self(hwnd, msg, wparam, lparam)
    }
}

pub struct Interceptor {
    class: String,
    original: RawWndProc,
    charset: CharSet,
    system: Arc<dyn WindowSystem>,
    translator: Box<dyn MessageTranslator>,
}

impl Interceptor {
    pub fn new(
        class: impl Into<String>,
        original: RawWndProc,
        charset: CharSet,
        system: Arc<dyn WindowSystem>,
        translator: impl MessageTranslator + 'static,
    ) -> Self {
        Self {
            class: class.into(),
            original,
            charset,
            system,
            translator: Box::new(translator),
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn original(&self) -> RawWndProc {
        self.original
    }

    pub fn charset(&self) -> CharSet {
        self.charset
    }

    /// Call the original procedure with the message as given.
    pub fn forward(&self, hwnd: Hwnd, msg: u32, wparam: WParam, lparam: LParam) -> LResult {
        self.system
            .call_window_proc(self.original, self.charset, hwnd, msg, wparam, lparam)
    }

    /// Received, translated, forwarded, translated back, returned.
    ///
    /// A message whose lParam cannot be translated is logged and forwarded
    /// unchanged. It may carry a host pointer already. A response that cannot
    /// be translated back is returned as the original procedure gave it.
    pub fn handle(&self, hwnd: Hwnd, msg: u32, wparam: WParam, lparam: LParam) -> LResult {
        tracing::trace!(
            class = %self.class,
            hwnd = format_args!("{hwnd:#x}"),
            msg = format_args!("{msg:#x}"),
            wparam = format_args!("{wparam:#x}"),
            lparam = format_args!("{lparam:#x}"),
            "intercepted"
        );
        let translation = match self.translator.translate(hwnd, msg, wparam, lparam) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(
                    class = %self.class,
                    msg = format_args!("{msg:#x}"),
                    "{e}; forwarding unchanged"
                );
                return self.forward(hwnd, msg, wparam, lparam);
            }
        };
        match translation {
            Translation::Forward => self.forward(hwnd, msg, wparam, lparam),
            Translation::Handled(ret) => ret,
            Translation::Translated(mut payload) => {
                let ret = self.forward(hwnd, msg, wparam, payload.lparam());
                let ret = payload.complete(ret).unwrap_or_else(|e| {
                    tracing::error!(class = %self.class, msg = format_args!("{msg:#x}"), "{e}");
                    ret
                });
                if payload.transferred() {
                    tracing::debug!(class = %self.class, "payload ownership transferred");
                    std::mem::forget(payload);
                }
                ret
            }
        }
    }
}

impl std::fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptor")
            .field("class", &self.class)
            .field("original", &format_args!("{:#x}", self.original as usize))
            .field("charset", &self.charset)
            .finish()
    }
}
