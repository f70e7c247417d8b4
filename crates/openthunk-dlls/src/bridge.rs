//! Start-up and shutdown of the whole bridge
//!
//! [`Bridge::new`] does what loading the translated modules does: carve the
//! guest heap window, build each module's host side, register the tables,
//! and hook the control classes that exchange structures through messages.
//! Dropping the bridge puts the original class procedures back.

use std::sync::Arc;

use anyhow::{Context, Result};
use openthunk_common::arena::GuestArena;
use openthunk_common::logging;
use openthunk_common::BridgeConfig;
use openthunk_dispatch::{Dispatcher, GuestFunctions, HostOps, Transport};
use openthunk_wndproc::WindowSystem;

use crate::comctl32::{self, Comctl32Host, ControlsHost, RebarNotify};
use crate::dxgi::{self, DxgiHost};
use crate::riched20::{self, RichEditHost};
use crate::user32::{self, CursorHost, User32Host};
use crate::{GuestSide, InstalledHook};

/// Header records kept for notifications delivered while the guest heap is
/// exhausted. One per level of nested delivery.
const SPARE_NOTIFY_HEADERS: usize = 4;

/// The host facilities the translated modules call into.
#[derive(Clone)]
pub struct Hosts {
    pub cursor: Arc<dyn CursorHost>,
    pub controls: Arc<dyn ControlsHost>,
}

pub struct Bridge {
    config: BridgeConfig,
    system: Arc<dyn WindowSystem>,
    arena: Arc<GuestArena>,
    functions: Arc<GuestFunctions>,
    dispatcher: Arc<Dispatcher>,
    user32: Arc<User32Host>,
    comctl32: Arc<Comctl32Host>,
    riched20: Arc<RichEditHost>,
    dxgi: Arc<DxgiHost>,
    hooks: Vec<InstalledHook>,
}

impl Bridge {
    pub fn new(config: &BridgeConfig, system: Arc<dyn WindowSystem>, hosts: Hosts) -> Result<Self> {
        logging::init(&config.log_level);
        config.validate().context("invalid bridge configuration")?;

        let arena = Arc::new(
            GuestArena::new(config.guest.window_base, config.guest.window_size)
                .context("cannot reserve the guest heap window")?,
        );
        let functions = Arc::new(GuestFunctions::new(arena.clone()));
        let ops = HostOps::new(arena.clone(), functions.clone());

        let user32 = Arc::new(User32Host::new(ops.clone(), hosts.cursor));
        let comctl32 = Arc::new(Comctl32Host::new(ops.clone(), hosts.controls));
        let riched20 = Arc::new(RichEditHost::new(ops.clone()));
        let dxgi = Arc::new(DxgiHost::new(ops));

        let dispatcher = Dispatcher::builder()
            .register(user32.table()?)?
            .register(comctl32.table()?)?
            .register(riched20.table()?)?
            .register(dxgi.table()?)?
            .require(user32::MODULE_ID)
            .require(comctl32::MODULE_ID)
            .require(riched20::MODULE_ID)
            .require(dxgi::MODULE_ID)
            .build()
            .context("cannot build the dispatch tables")?;

        RebarNotify::register(user32.notify())
            .context("cannot register rebar notification translation")?;
        user32
            .notify()
            .reserve_headers(&arena, SPARE_NOTIFY_HEADERS)
            .context("cannot reserve notification headers")?;

        let hooks = install_hooks(config, &system, &arena, &riched20)?;

        tracing::info!(
            window_base = format_args!("{:#x}", config.guest.window_base),
            window_size = format_args!("{:#x}", config.guest.window_size),
            modules = dispatcher.modules().count(),
            hooks = hooks.len(),
            "bridge ready"
        );

        Ok(Self {
            config: config.clone(),
            system,
            arena,
            functions,
            dispatcher: Arc::new(dispatcher),
            user32,
            comctl32,
            riched20,
            dxgi,
            hooks,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.dispatcher.clone()
    }

    /// What the guest-side stubs of every module are built from.
    pub fn guest(&self) -> GuestSide {
        GuestSide::new(self.transport(), self.arena.clone())
    }

    pub fn arena(&self) -> &Arc<GuestArena> {
        &self.arena
    }

    /// Guest code the host calls back into.
    pub fn functions(&self) -> &Arc<GuestFunctions> {
        &self.functions
    }

    pub fn user32(&self) -> &Arc<User32Host> {
        &self.user32
    }

    pub fn comctl32(&self) -> &Arc<Comctl32Host> {
        &self.comctl32
    }

    pub fn riched20(&self) -> &Arc<RichEditHost> {
        &self.riched20
    }

    pub fn dxgi(&self) -> &Arc<DxgiHost> {
        &self.dxgi
    }

    pub fn hooks(&self) -> &[InstalledHook] {
        &self.hooks
    }

    /// Restore every hooked class procedure. Dropping the bridge does the
    /// same but can only log failures.
    pub fn shutdown(mut self) -> Result<()> {
        remove_hooks(self.system.as_ref(), std::mem::take(&mut self.hooks))
    }
}

fn install_hooks(
    config: &BridgeConfig,
    system: &Arc<dyn WindowSystem>,
    arena: &Arc<GuestArena>,
    riched20: &Arc<RichEditHost>,
) -> Result<Vec<InstalledHook>> {
    let mut hooks = Vec::new();
    if config.hooks.rebar {
        let hook = comctl32::hook_rebar(system, arena.clone(), config.strict_layout)
            .context("cannot hook the rebar class")?;
        hooks.push(hook);
    }
    if config.hooks.richedit {
        match riched20::hook_richedit(system, riched20) {
            Ok(installed) => hooks.extend(installed),
            Err(e) => {
                let _ = remove_hooks(system.as_ref(), hooks);
                return Err(e).context("cannot hook the rich edit classes");
            }
        }
    }
    Ok(hooks)
}

fn remove_hooks(system: &dyn WindowSystem, hooks: Vec<InstalledHook>) -> Result<()> {
    let mut result = Ok(());
    for hook in hooks.into_iter().rev() {
        let classes = hook.classes();
        if let Err(e) = hook.remove(system) {
            tracing::error!(?classes, "hook not removed: {e}");
            result = Err(e).with_context(|| format!("cannot restore {classes:?}"));
        }
    }
    result
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if self.hooks.is_empty() {
            return;
        }
        let _ = remove_hooks(self.system.as_ref(), std::mem::take(&mut self.hooks));
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("config", &self.config)
            .field("arena", &self.arena)
            .field("hooks", &self.hooks)
            .finish()
    }
}
