//! `WindowSystem` over the real user32

use std::ffi::CString;

use windows::core::{PCSTR, PCWSTR};
use windows::Win32::Foundation::{HWND, LPARAM, LRESULT, WPARAM};
use windows::Win32::UI::WindowsAndMessaging::{
    CallWindowProcA, CallWindowProcW, CreateWindowExA, CreateWindowExW, DestroyWindow,
    SetClassLongPtrA, SetClassLongPtrW, GCLP_WNDPROC, WINDOW_EX_STYLE, WNDPROC, WS_POPUP,
};

use openthunk_common::win::{Hwnd, LParam, LResult, WParam};

use crate::system::WindowSystem;
use crate::{CharSet, HookError, RawWndProc};

#[derive(Debug, Default, Clone, Copy)]
pub struct Win32Windows;

fn to_wndproc(proc_: RawWndProc) -> WNDPROC {
    // SAFETY: HWND, WPARAM, LPARAM and LRESULT are transparent over the
    // integer types RawWndProc uses.
    Some(unsafe { std::mem::transmute::<RawWndProc, _>(proc_) })
}

impl WindowSystem for Win32Windows {
    fn create_window(&self, class: &str, charset: CharSet) -> Result<Hwnd, HookError> {
        let failed = |e: windows::core::Error| {
            tracing::error!(class, "CreateWindowEx: {e}");
            HookError::CreateWindow(class.to_string())
        };
        // SAFETY: the class name buffers outlive the call.
        let hwnd = unsafe {
            match charset {
                CharSet::Wide => {
                    let name: Vec<u16> = class.encode_utf16().chain(Some(0)).collect();
                    CreateWindowExW(
                        WINDOW_EX_STYLE(0),
                        PCWSTR(name.as_ptr()),
                        PCWSTR::null(),
                        WS_POPUP,
                        0,
                        0,
                        200,
                        60,
                        None,
                        None,
                        None,
                        None,
                    )
                    .map_err(failed)?
                }
                CharSet::Ansi => {
                    let name = CString::new(class)
                        .map_err(|_| HookError::CreateWindow(class.to_string()))?;
                    CreateWindowExA(
                        WINDOW_EX_STYLE(0),
                        PCSTR(name.as_ptr().cast()),
                        PCSTR::null(),
                        WS_POPUP,
                        0,
                        0,
                        200,
                        60,
                        None,
                        None,
                        None,
                        None,
                    )
                    .map_err(failed)?
                }
            }
        };
        Ok(hwnd.0 as Hwnd)
    }

    fn set_class_proc(
        &self,
        hwnd: Hwnd,
        charset: CharSet,
        replacement: RawWndProc,
    ) -> Result<RawWndProc, HookError> {
        let window = HWND(hwnd as *mut _);
        // SAFETY: hwnd is a window we just created.
        let previous = unsafe {
            match charset {
                CharSet::Wide => SetClassLongPtrW(window, GCLP_WNDPROC, replacement as isize),
                CharSet::Ansi => SetClassLongPtrA(window, GCLP_WNDPROC, replacement as isize),
            }
        };
        if previous == 0 {
            return Err(HookError::SetClassProc(format!("{hwnd:#x}")));
        }
        // SAFETY: GCLP_WNDPROC holds a window procedure.
        Ok(unsafe { std::mem::transmute::<usize, RawWndProc>(previous) })
    }

    fn destroy_window(&self, hwnd: Hwnd) {
        // SAFETY: destroying an invalid window only fails.
        if let Err(e) = unsafe { DestroyWindow(HWND(hwnd as *mut _)) } {
            tracing::warn!(hwnd = format_args!("{hwnd:#x}"), "DestroyWindow: {e}");
        }
    }

    fn call_window_proc(
        &self,
        proc_: RawWndProc,
        charset: CharSet,
        hwnd: Hwnd,
        msg: u32,
        wparam: WParam,
        lparam: LParam,
    ) -> LResult {
        let window = HWND(hwnd as *mut _);
        // SAFETY: proc_ is a class procedure returned by set_class_proc.
        let LRESULT(ret) = unsafe {
            match charset {
                CharSet::Wide => CallWindowProcW(to_wndproc(proc_), window, msg, WPARAM(wparam), LPARAM(lparam)),
                CharSet::Ansi => CallWindowProcA(to_wndproc(proc_), window, msg, WPARAM(wparam), LPARAM(lparam)),
            }
        };
        ret
    }
}
