//! riched20: guest `IRichEditOleCallback` objects behind host proxies
//!
//! The guest registers three thunks once (AddRef, Release, Invoke). When it
//! sends `EM_SETOLECALLBACK` to a rich edit control, the guest object is
//! wrapped in a host-side proxy whose methods go back through those thunks.

use std::ffi::c_void;
use std::sync::{Arc, RwLock};

use openthunk_com::proxy::{add_ref, query_interface, release};
use openthunk_com::{Proxy, ProxyClass, ProxyRef, VTable};
use openthunk_common::addr::{uint_ptr_to_guest, GuestAddr};
use openthunk_common::arena::Pod;
use openthunk_common::error::AddrError;
use openthunk_common::win::{Bool, Guid, HResult, Hwnd, LParam, LResult, WParam, FALSE, TRUE, WM_USER};
use openthunk_dispatch::{
    CallEnvelope, HostOps, ModuleTable, ProtocolError, RegistrationError, SyscallId,
};
use openthunk_wndproc::{
    CharSet, HookError, HookSlot, Interceptor, MessageTranslator, Payload, TranslateError,
    Translation, WindowSystem,
};

use crate::{bool_from_slot, hook_classes, GuestSide, InstalledHook};

pub const MODULE_ID: u32 = 2;
pub const MODULE_NAME: &str = "riched20";

pub const EM_SETOLECALLBACK: u32 = WM_USER + 70;

pub const ANSI_CLASSES: &[&str] = &["RichEdit20A", "RichEdit50A"];
pub const WIDE_CLASSES: &[&str] = &["RichEdit20W", "RICHEDIT50W"];

pub const IID_IRICHEDITOLECALLBACK: Guid =
    Guid::from_u128(0x00020403_0000_0000_c000_000000000046);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Call {
    SetOleCallbacks,
}

impl Call {
    pub const ALL: [Call; 1] = [Call::SetOleCallbacks];

    pub fn name(self) -> &'static str {
        match self {
            Call::SetOleCallbacks => "set_ole_callbacks",
        }
    }

    pub fn id(self) -> SyscallId {
        SyscallId::new(MODULE_ID, self as u32)
    }
}

/// Guest functions every callback proxy calls back into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OleThunks {
    pub add_ref: GuestAddr,
    pub release: GuestAddr,
    pub invoke: GuestAddr,
}

/// `IRichEditOleCallback` methods the invoke thunk understands, by vtable slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OleMethod {
    ShowContainerUI = 5,
    ContextSensitiveHelp = 9,
    GetDragDropEffect = 11,
}

/// The record the invoke thunk receives. `args[2]` is in/out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct GuestOleInvoke {
    pub iface: u32,
    pub method: u32,
    pub args: [u32; 3],
}

unsafe impl Pod for GuestOleInvoke {}

/// A guest `IRichEditOleCallback`, as held by its host proxy.
pub struct OleCallback {
    guest: GuestAddr,
    thunks: OleThunks,
    ops: HostOps,
}

impl OleCallback {
    /// Take a guest reference on `guest` and wrap it.
    pub fn wrap(
        guest: GuestAddr,
        thunks: OleThunks,
        ops: HostOps,
    ) -> Result<ProxyRef<OleCallback>, ProtocolError> {
        ops.execute(thunks.add_ref, u64::from(guest.get()))?;
        Ok(Proxy::create(OleCallback { guest, thunks, ops }))
    }

    pub fn guest(&self) -> GuestAddr {
        self.guest
    }

    fn invoke(&self, method: OleMethod, args: [u32; 3]) -> (HResult, [u32; 3]) {
        let arena = self.ops.arena();
        let record = GuestOleInvoke {
            iface: self.guest.get(),
            method: method as u32,
            args,
        };
        let addr = match arena.alloc_value(&record) {
            Ok(addr) => addr,
            Err(AddrError::OutOfMemory(_)) => return (HResult::E_OUTOFMEMORY, args),
            Err(e) => {
                tracing::error!(?method, "{e}");
                return (HResult::E_FAIL, args);
            }
        };
        let hr = match self.ops.execute(self.thunks.invoke, u64::from(addr.get())) {
            Ok(ret) => HResult::from_slot(ret),
            Err(_) => HResult::E_FAIL,
        };
        let out = arena.read::<GuestOleInvoke>(addr).map(|r| r.args).unwrap_or(args);
        let _ = arena.free(addr);
        tracing::trace!(?method, %hr, "guest OLE callback invoked");
        (hr, out)
    }
}

impl std::fmt::Debug for OleCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OleCallback")
            .field("guest", &self.guest)
            .field("thunks", &self.thunks)
            .finish()
    }
}

type This = *mut Proxy<OleCallback>;

fn unsupported(method: &str) -> i32 {
    tracing::warn!(method, "IRichEditOleCallback method carries COM objects; not forwarded");
    HResult::E_FAIL.0
}

unsafe extern "system" fn get_new_storage(_this: This, _stg: *mut *mut c_void) -> i32 {
    unsupported("GetNewStorage")
}

unsafe extern "system" fn get_in_place_context(
    _this: This,
    _frame: *mut *mut c_void,
    _doc: *mut *mut c_void,
    _info: *mut c_void,
) -> i32 {
    unsupported("GetInPlaceContext")
}

unsafe extern "system" fn show_container_ui(this: This, show: Bool) -> i32 {
    if this.is_null() {
        return HResult::E_POINTER.0;
    }
    let (hr, _) = (*this)
        .inner()
        .invoke(OleMethod::ShowContainerUI, [show as u32, 0, 0]);
    hr.0
}

unsafe extern "system" fn query_insert_object(
    _this: This,
    _clsid: *mut Guid,
    _stg: *mut c_void,
    _cp: i32,
) -> i32 {
    unsupported("QueryInsertObject")
}

unsafe extern "system" fn delete_object(_this: This, _obj: *mut c_void) -> i32 {
    unsupported("DeleteObject")
}

unsafe extern "system" fn query_accept_data(
    _this: This,
    _data: *mut c_void,
    _format: *mut u16,
    _reco: u32,
    _really: Bool,
    _metapict: isize,
) -> i32 {
    unsupported("QueryAcceptData")
}

unsafe extern "system" fn context_sensitive_help(this: This, enter: Bool) -> i32 {
    if this.is_null() {
        return HResult::E_POINTER.0;
    }
    let (hr, _) = (*this)
        .inner()
        .invoke(OleMethod::ContextSensitiveHelp, [enter as u32, 0, 0]);
    hr.0
}

unsafe extern "system" fn get_clipboard_data(
    _this: This,
    _range: *mut c_void,
    _reco: u32,
    _data: *mut *mut c_void,
) -> i32 {
    unsupported("GetClipboardData")
}

unsafe extern "system" fn get_drag_drop_effect(
    this: This,
    drag: Bool,
    key_state: u32,
    effect: *mut u32,
) -> i32 {
    if this.is_null() || effect.is_null() {
        return HResult::E_POINTER.0;
    }
    let (hr, out) = (*this).inner().invoke(
        OleMethod::GetDragDropEffect,
        [drag as u32, key_state, *effect],
    );
    *effect = out[2];
    hr.0
}

unsafe extern "system" fn get_context_menu(
    _this: This,
    _seltype: u16,
    _obj: *mut c_void,
    _range: *mut c_void,
    _menu: *mut isize,
) -> i32 {
    unsupported("GetContextMenu")
}

static OLE_CALLBACK_VTABLE: VTable<13> = VTable([
    query_interface::<OleCallback> as *const c_void,
    add_ref::<OleCallback> as *const c_void,
    release::<OleCallback> as *const c_void,
    get_new_storage as *const c_void,
    get_in_place_context as *const c_void,
    show_container_ui as *const c_void,
    query_insert_object as *const c_void,
    delete_object as *const c_void,
    query_accept_data as *const c_void,
    context_sensitive_help as *const c_void,
    get_clipboard_data as *const c_void,
    get_drag_drop_effect as *const c_void,
    get_context_menu as *const c_void,
]);

unsafe impl ProxyClass for OleCallback {
    const NAME: &'static str = "IRichEditOleCallback";
    const IIDS: &'static [Guid] = &[IID_IRICHEDITOLECALLBACK];

    fn vtable() -> *const *const c_void {
        OLE_CALLBACK_VTABLE.as_ptr()
    }

    fn release_underlying(&self) {
        if let Err(e) = self.ops.execute(self.thunks.release, u64::from(self.guest.get())) {
            tracing::error!(guest = ?self.guest, "guest OLE callback not released: {e}");
        }
    }
}

pub struct RichEditHost {
    ops: HostOps,
    thunks: RwLock<Option<OleThunks>>,
}

impl RichEditHost {
    pub fn new(ops: HostOps) -> Self {
        Self {
            ops,
            thunks: RwLock::new(None),
        }
    }

    pub fn thunks(&self) -> Option<OleThunks> {
        *self.thunks.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn table(self: &Arc<Self>) -> Result<ModuleTable, RegistrationError> {
        let mut table = ModuleTable::new(MODULE_ID, MODULE_NAME);
        for call in Call::ALL {
            let host = self.clone();
            table = table.entry(call.name(), move |c| host.handle(call, c))?;
        }
        Ok(table)
    }

    fn handle(&self, call: Call, c: &mut CallEnvelope) {
        let ret = match call {
            Call::SetOleCallbacks => self.set_ole_callbacks(c),
        };
        let ret = ret.unwrap_or_else(|e| {
            tracing::warn!(call = call.name(), "{e}");
            FALSE
        });
        c.set_result(ret as u32 as u64);
    }

    fn set_ole_callbacks(&self, c: &CallEnvelope) -> Result<Bool, AddrError> {
        let thunks = OleThunks {
            add_ref: c.arg_addr(0)?,
            release: c.arg_addr(1)?,
            invoke: c.arg_addr(2)?,
        };
        if thunks.add_ref.is_null() || thunks.release.is_null() || thunks.invoke.is_null() {
            return Err(AddrError::NullAccess);
        }
        *self.thunks.write().unwrap_or_else(|e| e.into_inner()) = Some(thunks);
        tracing::debug!(?thunks, "guest OLE callback thunks registered");
        Ok(TRUE)
    }

    fn translate(&self, msg: u32, lparam: LParam) -> Result<Translation, TranslateError> {
        if msg != EM_SETOLECALLBACK || lparam == 0 {
            return Ok(Translation::Forward);
        }
        let Some(thunks) = self.thunks() else {
            tracing::error!("EM_SETOLECALLBACK before the guest registered its thunks");
            return Ok(Translation::Handled(0));
        };
        let guest = match uint_ptr_to_guest(lparam as usize as u64) {
            Ok(raw) if self.ops.arena().space().contains_guest(GuestAddr::new(raw)) => {
                GuestAddr::new(raw)
            }
            // A host callback object needs no proxy.
            _ => return Ok(Translation::Forward),
        };
        match OleCallback::wrap(guest, thunks, self.ops.clone()) {
            Ok(proxy) => Ok(Translation::Translated(Box::new(CallbackPayload(proxy)))),
            Err(e) => {
                tracing::error!("cannot wrap the guest OLE callback: {e}");
                Ok(Translation::Handled(0))
            }
        }
    }
}

impl std::fmt::Debug for RichEditHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RichEditHost")
            .field("thunks", &self.thunks())
            .finish()
    }
}

/// Our reference on the proxy for the duration of the message. The control
/// takes its own if it keeps the callback.
struct CallbackPayload(ProxyRef<OleCallback>);

impl Payload for CallbackPayload {
    fn lparam(&self) -> LParam {
        self.0.as_raw() as LParam
    }
}

struct RichEditTranslator(Arc<RichEditHost>);

impl MessageTranslator for RichEditTranslator {
    fn translate(
        &self,
        _hwnd: Hwnd,
        msg: u32,
        _wparam: WParam,
        lparam: LParam,
    ) -> Result<Translation, TranslateError> {
        self.0.translate(msg, lparam)
    }
}

static RICHEDIT_ANSI_HOOK: HookSlot<Interceptor> = HookSlot::new("richedit-ansi");
static RICHEDIT_WIDE_HOOK: HookSlot<Interceptor> = HookSlot::new("richedit-wide");

unsafe extern "system" fn richedit_ansi_wndproc(
    hwnd: Hwnd,
    msg: u32,
    wparam: WParam,
    lparam: LParam,
) -> LResult {
    RICHEDIT_ANSI_HOOK.dispatch(hwnd, msg, wparam, lparam)
}

unsafe extern "system" fn richedit_wide_wndproc(
    hwnd: Hwnd,
    msg: u32,
    wparam: WParam,
    lparam: LParam,
) -> LResult {
    RICHEDIT_WIDE_HOOK.dispatch(hwnd, msg, wparam, lparam)
}

/// Hook the ANSI and wide rich edit classes. Both or neither.
pub fn hook_richedit(
    system: &Arc<dyn WindowSystem>,
    host: &Arc<RichEditHost>,
) -> Result<Vec<InstalledHook>, HookError> {
    let ansi = hook_classes(
        system,
        ANSI_CLASSES,
        CharSet::Ansi,
        richedit_ansi_wndproc,
        &RICHEDIT_ANSI_HOOK,
        RichEditTranslator(host.clone()),
    )?;
    let wide = match hook_classes(
        system,
        WIDE_CLASSES,
        CharSet::Wide,
        richedit_wide_wndproc,
        &RICHEDIT_WIDE_HOOK,
        RichEditTranslator(host.clone()),
    ) {
        Ok(hook) => hook,
        Err(e) => {
            let _ = ansi.remove(system.as_ref());
            return Err(e);
        }
    };
    Ok(vec![ansi, wide])
}

#[derive(Debug, Clone)]
pub struct RichEditGuest {
    side: GuestSide,
}

impl RichEditGuest {
    pub fn new(side: GuestSide) -> Self {
        Self { side }
    }

    pub fn register_ole_callbacks(
        &self,
        add_ref: GuestAddr,
        release: GuestAddr,
        invoke: GuestAddr,
    ) -> Bool {
        let mut call = CallEnvelope::new(Call::SetOleCallbacks.id())
            .with_arg(0, u64::from(add_ref.get()))
            .with_arg(1, u64::from(release.get()))
            .with_arg(2, u64::from(invoke.get()));
        match self.side.syscall(&mut call) {
            Ok(()) => bool_from_slot(call.result()),
            Err(_) => FALSE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use openthunk_com::unknown;
    use openthunk_dispatch::{Dispatcher, GuestFunctions};
    use openthunk_wndproc::SimWindows;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    struct GuestObject {
        refs: Arc<AtomicU32>,
        thunks: OleThunks,
    }

    /// A guest callback object with a count, plus the three thunks.
    fn guest_object(funcs: &GuestFunctions, ops: &HostOps) -> (GuestAddr, GuestObject) {
        let refs = Arc::new(AtomicU32::new(1));
        let add = refs.clone();
        let rel = refs.clone();
        let arena = ops.arena_arc().clone();
        let thunks = OleThunks {
            add_ref: funcs
                .register(move |_| u64::from(add.fetch_add(1, Ordering::SeqCst) + 1))
                .unwrap(),
            release: funcs
                .register(move |_| u64::from(rel.fetch_sub(1, Ordering::SeqCst) - 1))
                .unwrap(),
            invoke: funcs
                .register(move |addr| {
                    let addr = GuestAddr::new(addr as u32);
                    let mut rec = arena.read::<GuestOleInvoke>(addr).unwrap();
                    if rec.method == OleMethod::GetDragDropEffect as u32 {
                        rec.args[2] &= 0x1;
                        arena.write(addr, &rec).unwrap();
                        return 0;
                    }
                    HResult::E_NOTIMPL.to_slot()
                })
                .unwrap(),
        };
        let object = ops.arena().alloc_value(&0u32).unwrap();
        (object, GuestObject { refs, thunks })
    }

    #[test]
    fn test_proxy_holds_one_guest_reference() {
        let (ops, funcs) = test_support::ops();
        let (addr, object) = guest_object(&funcs, &ops);
        let proxy = OleCallback::wrap(addr, object.thunks, ops.clone()).unwrap();
        assert_eq!(object.refs.load(Ordering::SeqCst), 2);

        let extra = proxy.clone();
        drop(proxy);
        assert_eq!(object.refs.load(Ordering::SeqCst), 2);
        drop(extra);
        assert_eq!(object.refs.load(Ordering::SeqCst), 1);
    }

    type DragDropFn = unsafe extern "system" fn(*mut c_void, Bool, u32, *mut u32) -> i32;
    type ScalarFn = unsafe extern "system" fn(*mut c_void, Bool) -> i32;
    type DeleteFn = unsafe extern "system" fn(*mut c_void, *mut c_void) -> i32;

    #[test]
    fn test_methods_through_the_vtable() {
        let (ops, funcs) = test_support::ops();
        let (addr, object) = guest_object(&funcs, &ops);
        let proxy = OleCallback::wrap(addr, object.thunks, ops.clone()).unwrap();
        let raw = proxy.as_raw();
        unsafe {
            let vtbl = unknown::vtable_of(raw);
            let drag: DragDropFn = std::mem::transmute(*vtbl.add(11));
            let mut effect = 0x7u32;
            assert_eq!(drag(raw, TRUE, 0x8, &mut effect), 0);
            assert_eq!(effect, 0x1);
            assert_eq!(
                HResult(drag(raw, TRUE, 0, std::ptr::null_mut())),
                HResult::E_POINTER
            );

            let show: ScalarFn = std::mem::transmute(*vtbl.add(5));
            assert_eq!(HResult(show(raw, TRUE)), HResult::E_NOTIMPL);

            let delete: DeleteFn = std::mem::transmute(*vtbl.add(7));
            assert_eq!(HResult(delete(raw, std::ptr::null_mut())), HResult::E_FAIL);

            let mut out = std::ptr::null_mut();
            assert_eq!(
                unknown::query_interface(raw, &IID_IRICHEDITOLECALLBACK, &mut out),
                HResult::S_OK
            );
            unknown::release(out);
        }
        // Only the object and the three thunks remain.
        drop(proxy);
        assert_eq!(ops.arena().live_allocations(), 4);
    }

    static KEPT: AtomicUsize = AtomicUsize::new(0);

    /// A control that keeps the callback it is given.
    unsafe extern "system" fn native_richedit(
        _: Hwnd,
        msg: u32,
        _: WParam,
        lparam: LParam,
    ) -> LResult {
        if msg == EM_SETOLECALLBACK {
            let previous = KEPT.swap(lparam as usize, Ordering::SeqCst);
            if previous != 0 {
                unknown::release(previous as *mut c_void);
            }
            if lparam != 0 {
                unknown::add_ref(lparam as *mut c_void);
            }
            return 1;
        }
        0
    }

    #[test]
    fn test_set_ole_callback_hook() {
        let sim = Arc::new(SimWindows::new());
        for class in ANSI_CLASSES.iter().chain(WIDE_CLASSES) {
            sim.register_class(class, native_richedit);
        }
        let system: Arc<dyn WindowSystem> = sim.clone();
        let (ops, funcs) = test_support::ops();
        let arena = ops.arena_arc().clone();
        let host = Arc::new(RichEditHost::new(ops.clone()));
        let dispatcher = Dispatcher::builder()
            .register(host.table().unwrap())
            .unwrap()
            .build()
            .unwrap();
        let guest = RichEditGuest::new(GuestSide::new(Arc::new(dispatcher), arena));
        let hooks = hook_richedit(&system, &host).unwrap();

        let (addr, object) = guest_object(&funcs, &ops);
        let hwnd = sim.create_window("RichEdit20W", CharSet::Wide).unwrap();

        // No thunks yet: not forwarded.
        assert_eq!(sim.send_message(hwnd, EM_SETOLECALLBACK, 0, addr.get() as LParam), 0);
        assert_eq!(KEPT.load(Ordering::SeqCst), 0);

        let thunks = object.thunks;
        assert_eq!(
            guest.register_ole_callbacks(thunks.add_ref, thunks.release, thunks.invoke),
            TRUE
        );
        assert_eq!(sim.send_message(hwnd, EM_SETOLECALLBACK, 0, addr.get() as LParam), 1);
        let kept = KEPT.load(Ordering::SeqCst) as *mut c_void;
        assert!(unsafe { openthunk_com::resolve_proxy::<OleCallback>(kept) }.is_some());
        assert_eq!(object.refs.load(Ordering::SeqCst), 2);

        // A host callback object is handed to the control as is.
        assert!(matches!(
            host.translate(EM_SETOLECALLBACK, kept as LParam),
            Ok(Translation::Forward)
        ));
        assert_eq!(object.refs.load(Ordering::SeqCst), 2);

        // Clearing the callback drops the last proxy reference.
        assert_eq!(sim.send_message(hwnd, EM_SETOLECALLBACK, 0, 0), 1);
        assert_eq!(object.refs.load(Ordering::SeqCst), 1);

        for hook in hooks {
            hook.remove(system.as_ref()).unwrap();
        }
        assert_eq!(
            sim.class_proc("RichEdit50A").unwrap() as usize,
            native_richedit as usize
        );
    }

    #[test]
    fn test_set_ole_callbacks_rejects_null_thunks() {
        let (ops, _) = test_support::ops();
        let arena = ops.arena_arc().clone();
        let host = Arc::new(RichEditHost::new(ops));
        let dispatcher = Dispatcher::builder()
            .register(host.table().unwrap())
            .unwrap()
            .build()
            .unwrap();
        let guest = RichEditGuest::new(GuestSide::new(Arc::new(dispatcher), arena));
        assert_eq!(
            guest.register_ole_callbacks(GuestAddr::NULL, GuestAddr::NULL, GuestAddr::NULL),
            FALSE
        );
        assert!(host.thunks().is_none());
    }
}
