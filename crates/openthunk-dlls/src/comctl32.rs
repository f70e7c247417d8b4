//! comctl32: the rebar class hook and rebar notifications
//!
//! Guest code talks to a host rebar control with guest-shaped `REBARINFO`
//! and `REBARBANDINFO` structures. The class procedure is replaced so those
//! are converted before the control sees them, and the notifications the
//! control sends to a guest parent are rebuilt in guest memory.

use std::sync::Arc;

use openthunk_common::addr::{uint_ptr_to_guest, GuestAddr};
use openthunk_common::arena::{GuestArena, Pod};
use openthunk_common::error::AddrError;
use openthunk_common::win::{Bool, Hwnd, LParam, LResult, WParam, FALSE, WM_USER};
use openthunk_dispatch::{CallEnvelope, HostOps, ModuleTable, RegistrationError, SyscallId};
use openthunk_layout::{
    read_guest_sized, write_guest_sized, LayoutPair, NmHdr, NmRebar, NmRebarAutoSize,
    NmRebarChevron, NmRebarChildSize, RebarBandInfo, RebarInfo, SelfSized,
};
use openthunk_wndproc::{
    CharSet, HookError, HookSlot, Interceptor, MessageTranslator, NotifyError, NotifyRegistry,
    NotifyRule, Payload, TranslateError, Translation, WindowSystem,
};

use crate::{bool_from_slot, hook_classes, GuestSide, InstalledHook};

pub const MODULE_ID: u32 = 1;
pub const MODULE_NAME: &str = "comctl32";

pub const REBAR_CLASS: &str = "ReBarWindow32";

pub const RB_INSERTBANDA: u32 = WM_USER + 1;
pub const RB_GETBARINFO: u32 = WM_USER + 3;
pub const RB_SETBARINFO: u32 = WM_USER + 4;
pub const RB_SETBANDINFOA: u32 = WM_USER + 6;
pub const RB_INSERTBANDW: u32 = WM_USER + 10;
pub const RB_SETBANDINFOW: u32 = WM_USER + 11;
pub const RB_GETBANDINFOW: u32 = WM_USER + 28;
pub const RB_GETBANDINFOA: u32 = WM_USER + 29;

pub const NM_CUSTOMDRAW: u32 = -12i32 as u32;
pub const NM_NCHITTEST: u32 = -14i32 as u32;

pub const RBN_HEIGHTCHANGE: u32 = -831i32 as u32;
pub const RBN_LAYOUTCHANGED: u32 = -833i32 as u32;
pub const RBN_AUTOSIZE: u32 = -834i32 as u32;
pub const RBN_BEGINDRAG: u32 = -835i32 as u32;
pub const RBN_ENDDRAG: u32 = -836i32 as u32;
pub const RBN_DELETINGBAND: u32 = -837i32 as u32;
pub const RBN_DELETEDBAND: u32 = -838i32 as u32;
pub const RBN_CHILDSIZE: u32 = -839i32 as u32;
pub const RBN_CHEVRONPUSHED: u32 = -841i32 as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Call {
    InitCommonControlsEx,
}

impl Call {
    pub const ALL: [Call; 1] = [Call::InitCommonControlsEx];

    pub fn name(self) -> &'static str {
        match self {
            Call::InitCommonControlsEx => "InitCommonControlsEx",
        }
    }

    pub fn id(self) -> SyscallId {
        SyscallId::new(MODULE_ID, self as u32)
    }
}

/// `INITCOMMONCONTROLSEX`; both fields are 32 bits on either side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct InitCommonControlsEx {
    pub dw_size: u32,
    pub dw_icc: u32,
}

unsafe impl Pod for InitCommonControlsEx {}

pub trait ControlsHost: Send + Sync {
    fn init_common_controls_ex(&self, init: &InitCommonControlsEx) -> bool;
}

pub struct Comctl32Host {
    ops: HostOps,
    controls: Arc<dyn ControlsHost>,
}

impl Comctl32Host {
    pub fn new(ops: HostOps, controls: Arc<dyn ControlsHost>) -> Self {
        Self { ops, controls }
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
            Call::InitCommonControlsEx => self.init_common_controls_ex(c),
        };
        let ret = ret.unwrap_or_else(|e| {
            tracing::warn!(call = call.name(), "{e}");
            FALSE
        });
        c.set_result(ret as u32 as u64);
    }

    fn init_common_controls_ex(&self, c: &CallEnvelope) -> Result<Bool, AddrError> {
        let addr = c.arg_addr(0)?;
        if addr.is_null() {
            return Ok(FALSE);
        }
        let init = self.ops.arena().read::<InitCommonControlsEx>(addr)?;
        tracing::debug!(icc = format_args!("{:#x}", init.dw_icc), "InitCommonControlsEx");
        Ok(self.controls.init_common_controls_ex(&init) as Bool)
    }
}

impl std::fmt::Debug for Comctl32Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Comctl32Host").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct Comctl32Guest {
    side: GuestSide,
}

impl Comctl32Guest {
    pub fn new(side: GuestSide) -> Self {
        Self { side }
    }

    pub fn init_common_controls_ex(&self, init: Option<&InitCommonControlsEx>) -> Bool {
        self.side
            .scratch(init, |addr| {
                let mut call = CallEnvelope::new(Call::InitCommonControlsEx.id())
                    .with_arg(0, u64::from(addr.get()));
                match self.side.syscall(&mut call) {
                    Ok(()) => bool_from_slot(call.result()),
                    Err(_) => FALSE,
                }
            })
            .unwrap_or(FALSE)
    }
}

static REBAR_HOOK: HookSlot<Interceptor> = HookSlot::new("rebar");

unsafe extern "system" fn rebar_wndproc(
    hwnd: Hwnd,
    msg: u32,
    wparam: WParam,
    lparam: LParam,
) -> LResult {
    REBAR_HOOK.dispatch(hwnd, msg, wparam, lparam)
}

/// Replace the rebar class procedure.
pub fn hook_rebar(
    system: &Arc<dyn WindowSystem>,
    arena: Arc<GuestArena>,
    strict: bool,
) -> Result<InstalledHook, HookError> {
    hook_classes(
        system,
        &[REBAR_CLASS],
        CharSet::Wide,
        rebar_wndproc,
        &REBAR_HOOK,
        RebarTranslator { arena, strict },
    )
}

/// Converts the guest structures carried by rebar messages.
pub struct RebarTranslator {
    arena: Arc<GuestArena>,
    strict: bool,
}

impl RebarTranslator {
    pub fn new(arena: Arc<GuestArena>, strict: bool) -> Self {
        Self { arena, strict }
    }

    /// The guest structure behind `lparam`, converted for the host control.
    ///
    /// An lParam outside the guest window is not a guest structure; it is
    /// forwarded as given. A guest structure that cannot be converted aborts
    /// the message with result 0.
    fn to_host<T>(&self, msg: u32, lparam: LParam, write_back: bool) -> Translation
    where
        T: SelfSized + Send + 'static,
    {
        if lparam == 0 {
            return Translation::Forward;
        }
        let addr = match uint_ptr_to_guest(lparam as usize as u64) {
            Ok(raw) if self.arena.space().contains_guest(GuestAddr::new(raw)) => GuestAddr::new(raw),
            _ => {
                tracing::debug!(
                    msg = format_args!("{msg:#x}"),
                    lparam = format_args!("{lparam:#x}"),
                    "{} outside the guest window; forwarding unchanged",
                    T::NAME
                );
                return Translation::Forward;
            }
        };
        match self.convert::<T>(addr, write_back) {
            Ok(payload) => Translation::Translated(payload),
            Err(e) => {
                tracing::error!(msg = format_args!("{msg:#x}"), "{e}; not forwarded");
                Translation::Handled(0)
            }
        }
    }

    fn convert<T>(&self, addr: GuestAddr, write_back: bool) -> Result<Box<dyn Payload>, TranslateError>
    where
        T: SelfSized + Send + 'static,
    {
        let guest = read_guest_sized::<T>(&self.arena, addr)?;
        let declared = T::declared_size(&guest);
        if let Err(e) = T::check_declared(&guest) {
            if self.strict {
                return Err(e.into());
            }
            tracing::error!("{e}; converting anyway");
        }
        let host = Box::new(T::to_host_layout(&guest, self.arena.space())?);
        Ok(Box::new(StructPayload {
            host,
            guest: addr,
            declared,
            write_back,
            arena: self.arena.clone(),
        }))
    }
}

impl MessageTranslator for RebarTranslator {
    fn translate(
        &self,
        _hwnd: Hwnd,
        msg: u32,
        _wparam: WParam,
        lparam: LParam,
    ) -> Result<Translation, TranslateError> {
        let translation = match msg {
            RB_SETBARINFO => self.to_host::<RebarInfo>(msg, lparam, false),
            RB_GETBARINFO => self.to_host::<RebarInfo>(msg, lparam, true),
            RB_INSERTBANDA | RB_INSERTBANDW | RB_SETBANDINFOA | RB_SETBANDINFOW => {
                self.to_host::<RebarBandInfo>(msg, lparam, false)
            }
            RB_GETBANDINFOA | RB_GETBANDINFOW => self.to_host::<RebarBandInfo>(msg, lparam, true),
            _ => Translation::Forward,
        };
        Ok(translation)
    }
}

/// A host copy of a guest structure, written back for `GET` messages.
struct StructPayload<T: SelfSized> {
    host: Box<T>,
    guest: GuestAddr,
    declared: u32,
    write_back: bool,
    arena: Arc<GuestArena>,
}

impl<T: SelfSized + Send> Payload for StructPayload<T> {
    fn lparam(&self) -> LParam {
        &*self.host as *const T as LParam
    }

    fn complete(&mut self, ret: LResult) -> Result<LResult, TranslateError> {
        if self.write_back && ret != 0 {
            let guest = self.host.to_guest_layout(self.arena.space())?;
            write_guest_sized(&self.arena, self.guest, &guest, self.declared)?;
        }
        Ok(ret)
    }
}

/// Notifications a rebar sends to its parent.
#[derive(Debug, Default, Clone, Copy)]
pub struct RebarNotify;

impl RebarNotify {
    pub fn register(registry: &NotifyRegistry) -> Result<(), NotifyError> {
        registry.register_callback_translation(REBAR_CLASS, Arc::new(RebarNotify))
    }
}

/// # Safety
///
/// `host` points to a live `T`.
unsafe fn record_to_guest<T: LayoutPair>(
    host: *const NmHdr,
    arena: &GuestArena,
) -> Result<GuestAddr, NotifyError> {
    let record = &*(host as *const T);
    let guest = record.to_guest_layout(arena.space())?;
    Ok(arena.alloc_value(&guest)?)
}

impl NotifyRule for RebarNotify {
    unsafe fn to_guest(
        &self,
        host: *const NmHdr,
        arena: &GuestArena,
    ) -> Result<Option<GuestAddr>, NotifyError> {
        let code = (*host).code;
        let addr = match code {
            RBN_CHILDSIZE => record_to_guest::<NmRebarChildSize>(host, arena)?,
            RBN_HEIGHTCHANGE | RBN_LAYOUTCHANGED => record_to_guest::<NmHdr>(host, arena)?,
            RBN_AUTOSIZE => record_to_guest::<NmRebarAutoSize>(host, arena)?,
            RBN_DELETINGBAND | RBN_DELETEDBAND | RBN_BEGINDRAG | RBN_ENDDRAG => {
                record_to_guest::<NmRebar>(host, arena)?
            }
            RBN_CHEVRONPUSHED => record_to_guest::<NmRebarChevron>(host, arena)?,
            _ => return Ok(None),
        };
        tracing::trace!(code = code as i32, ?addr, "rebar notification translated");
        Ok(Some(addr))
    }

    unsafe fn from_guest(
        &self,
        host: *mut NmHdr,
        guest: GuestAddr,
        arena: &GuestArena,
    ) -> Result<(), NotifyError> {
        if (*host).code == RBN_CHILDSIZE {
            let guest = arena.read::<<NmRebarChildSize as LayoutPair>::Guest>(guest)?;
            let record = &mut *(host as *mut NmRebarChildSize);
            record.rc_child = guest.rc_child;
            record.rc_band = guest.rc_band;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use openthunk_common::win::{TRUE, WM_NOTIFY};
    use openthunk_dispatch::Dispatcher;
    use openthunk_layout::{GuestNmHdr, GuestRebarBandInfo, GuestRebarInfo, Msg, Rect};
    use openthunk_wndproc::{NotifyOutcome, SimWindows};
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    fn band(arena: &GuestArena, cb_size: u32) -> GuestAddr {
        let text = arena.alloc_value(&[0x41u8, 0x42, 0x43, 0]).unwrap();
        arena
            .alloc_value(&GuestRebarBandInfo {
                cb_size,
                f_mask: 0x4,
                lp_text: text.get(),
                cch: 3,
                cx: 150,
                w_id: 9,
                ..GuestRebarBandInfo::default()
            })
            .unwrap()
    }

    #[test]
    fn test_insert_band_is_converted() {
        let arena = test_support::arena();
        let translator = RebarTranslator::new(arena.clone(), true);
        let addr = band(&arena, RebarBandInfo::GUEST_V6_SIZE);

        let Translation::Translated(payload) = translator
            .translate(1, RB_INSERTBANDW, usize::MAX, addr.get() as LParam)
            .unwrap()
        else {
            panic!("band info not translated");
        };
        let host = unsafe { &*(payload.lparam() as *const RebarBandInfo) };
        assert_eq!(host.cb_size, RebarBandInfo::HOST_V6_SIZE);
        assert_eq!(host.cx, 150);
        assert_eq!(host.w_id, 9);
        let text = unsafe { std::slice::from_raw_parts(host.lp_text as *const u8, 3) };
        assert_eq!(text, b"ABC");
    }

    #[test]
    fn test_null_and_unrelated_messages_forward() {
        let translator = RebarTranslator::new(test_support::arena(), true);
        assert!(matches!(
            translator.translate(1, RB_SETBARINFO, 0, 0),
            Ok(Translation::Forward)
        ));
        assert!(matches!(
            translator.translate(1, WM_USER + 2, 0, 0x1234),
            Ok(Translation::Forward)
        ));
    }

    #[test]
    fn test_lparam_outside_guest_window_forwards() {
        let arena = test_support::arena();
        let translator = RebarTranslator::new(arena.clone(), true);
        let host = Box::new(RebarBandInfo {
            cb_size: RebarBandInfo::HOST_SIZE,
            ..RebarBandInfo::default()
        });
        let end = arena.space().guest_start().get() as LParam + arena.space().len() as LParam;
        for lparam in [&*host as *const RebarBandInfo as LParam, end, 0x1_0000_0000] {
            assert!(matches!(
                translator.translate(1, RB_SETBANDINFOW, 0, lparam),
                Ok(Translation::Forward)
            ));
        }
        assert_eq!(arena.live_allocations(), 0);
    }

    #[test]
    fn test_host_sized_guest_structure() {
        let arena = test_support::arena();
        let addr = band(&arena, RebarBandInfo::HOST_SIZE);

        let strict = RebarTranslator::new(arena.clone(), true);
        assert!(matches!(
            strict.translate(1, RB_INSERTBANDA, 0, addr.get() as LParam),
            Ok(Translation::Handled(0))
        ));

        let lenient = RebarTranslator::new(arena, false);
        assert!(matches!(
            lenient.translate(1, RB_INSERTBANDA, 0, addr.get() as LParam),
            Ok(Translation::Translated(_))
        ));
    }

    #[test]
    fn test_get_band_info_writes_back() {
        let arena = test_support::arena();
        let translator = RebarTranslator::new(arena.clone(), true);
        let addr = band(&arena, RebarBandInfo::GUEST_V3_SIZE);

        let Translation::Translated(mut payload) = translator
            .translate(1, RB_GETBANDINFOW, 0, addr.get() as LParam)
            .unwrap()
        else {
            panic!("band info not translated");
        };
        // The control fills in the host structure.
        let host = unsafe { &mut *(payload.lparam() as *mut RebarBandInfo) };
        host.cx = 320;
        host.cy_child = 77;
        assert_eq!(payload.complete(TRUE as LResult).unwrap(), 1);

        let guest = arena.read::<GuestRebarBandInfo>(addr).unwrap();
        assert_eq!(guest.cb_size, RebarBandInfo::GUEST_V3_SIZE);
        assert_eq!(guest.cx, 320);
        // Past the declared V3 size: untouched.
        assert_eq!(guest.cy_child, 0);
    }

    #[test]
    fn test_rebar_notifications() {
        let registry = NotifyRegistry::new();
        RebarNotify::register(&registry).unwrap();
        let arena = test_support::arena();

        let mut child = NmRebarChildSize {
            hdr: NmHdr {
                hwnd_from: 0x50,
                id_from: 1,
                code: RBN_CHILDSIZE,
            },
            u_band: 0,
            w_id: 4,
            rc_child: Rect::default(),
            rc_band: Rect::default(),
        };
        let msg = Msg {
            hwnd: 0x60,
            message: WM_NOTIFY,
            lparam: &mut child as *mut NmRebarChildSize as LParam,
            ..Msg::default()
        };
        let delivery = unsafe {
            registry.deliver(REBAR_CLASS, &msg, &arena, |guest| {
                let addr = GuestAddr::new(guest.lparam);
                let mut rec = arena
                    .read::<<NmRebarChildSize as LayoutPair>::Guest>(addr)
                    .unwrap();
                assert_eq!(rec.w_id, 4);
                rec.rc_child.right = 90;
                arena.write(addr, &rec).unwrap();
                0
            })
        }
        .unwrap();
        assert_eq!(delivery.outcome, NotifyOutcome::Translated);
        assert_eq!(child.rc_child.right, 90);
        assert_eq!(arena.live_allocations(), 0);

        let mut custom = NmHdr {
            hwnd_from: 0x50,
            id_from: 1,
            code: NM_CUSTOMDRAW,
        };
        let msg = Msg {
            lparam: &mut custom as *mut NmHdr as LParam,
            ..msg
        };
        let delivery = unsafe {
            registry.deliver(REBAR_CLASS, &msg, &arena, |guest| {
                let hdr = arena.read::<GuestNmHdr>(GuestAddr::new(guest.lparam)).unwrap();
                assert_eq!(hdr.code, NM_CUSTOMDRAW);
                0
            })
        }
        .unwrap();
        assert_eq!(delivery.outcome, NotifyOutcome::Unhandled { code: NM_CUSTOMDRAW });
        assert_eq!(arena.live_allocations(), 0);
    }

    static SEEN_CB_SIZE: AtomicU32 = AtomicU32::new(0);
    static SEEN_BAND_LPARAM: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "system" fn native_rebar(
        _: Hwnd,
        msg: u32,
        _: WParam,
        lparam: LParam,
    ) -> LResult {
        if msg == RB_SETBARINFO && lparam != 0 {
            SEEN_CB_SIZE.store((*(lparam as *const RebarInfo)).cb_size, Ordering::SeqCst);
            return 1;
        }
        if msg == RB_SETBANDINFOW {
            SEEN_BAND_LPARAM.store(lparam as usize, Ordering::SeqCst);
            return 1;
        }
        0
    }

    #[test]
    fn test_hooked_class_converts_set_bar_info() {
        let sim = Arc::new(SimWindows::new());
        sim.register_class(REBAR_CLASS, native_rebar);
        let system: Arc<dyn WindowSystem> = sim.clone();
        let arena = test_support::arena();

        let hook = hook_rebar(&system, arena.clone(), true).unwrap();
        assert!(matches!(
            hook_rebar(&system, arena.clone(), true),
            Err(HookError::AlreadyInstalled(_))
        ));

        let info = arena
            .alloc_value(&GuestRebarInfo {
                cb_size: 12,
                f_mask: 0,
                himl: 0,
            })
            .unwrap();
        let hwnd = sim.create_window(REBAR_CLASS, CharSet::Wide).unwrap();
        assert_eq!(sim.send_message(hwnd, RB_SETBARINFO, 0, info.get() as LParam), 1);
        assert_eq!(SEEN_CB_SIZE.load(Ordering::SeqCst), 16);

        // Host code in the same process hands the control host structures.
        let band = Box::new(RebarBandInfo {
            cb_size: RebarBandInfo::HOST_SIZE,
            cx: 40,
            ..RebarBandInfo::default()
        });
        let lparam = &*band as *const RebarBandInfo as LParam;
        assert_eq!(sim.send_message(hwnd, RB_SETBANDINFOW, 0, lparam), 1);
        assert_eq!(SEEN_BAND_LPARAM.load(Ordering::SeqCst), lparam as usize);

        hook.remove(system.as_ref()).unwrap();
        assert_eq!(
            sim.class_proc(REBAR_CLASS).unwrap() as usize,
            native_rebar as usize
        );
    }

    struct AcceptAll;

    impl ControlsHost for AcceptAll {
        fn init_common_controls_ex(&self, init: &InitCommonControlsEx) -> bool {
            init.dw_size == 8
        }
    }

    #[test]
    fn test_init_common_controls_ex() {
        let (ops, _) = test_support::ops();
        let arena = ops.arena_arc().clone();
        let host = Arc::new(Comctl32Host::new(ops, Arc::new(AcceptAll)));
        let dispatcher = Dispatcher::builder()
            .register(host.table().unwrap())
            .unwrap()
            .build()
            .unwrap();
        let guest = Comctl32Guest::new(GuestSide::new(Arc::new(dispatcher), arena));
        let init = InitCommonControlsEx {
            dw_size: 8,
            dw_icc: 0x400,
        };
        assert_eq!(guest.init_common_controls_ex(Some(&init)), TRUE);
        assert_eq!(guest.init_common_controls_ex(None), FALSE);
    }
}
