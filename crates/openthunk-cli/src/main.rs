//! openthunk: inspect what the bridge would register and convert
//!
//! `tables` prints every module table with its fingerprint, `layouts` the
//! guest and host sizes of every converted structure, and `check-config`
//! validates a configuration file.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use openthunk_common::{logging, BridgeConfig, CONFIG_ENV};
use openthunk_dlls::comctl32::{ControlsHost, InitCommonControlsEx};
use openthunk_dlls::user32::CursorHost;
use openthunk_dlls::{Bridge, Hosts};
use openthunk_layout::{Point, Rect};
use openthunk_wndproc::SimWindows;

#[derive(Parser)]
#[command(name = "openthunk", version, about = "32-bit guest to 64-bit host call bridge")]
struct Cli {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List module tables, their entries and fingerprints
    Tables {
        /// Print the entry names of each table
        #[arg(long)]
        entries: bool,
    },
    /// List guest and host sizes of every converted structure
    Layouts,
    /// Parse and validate a configuration file
    CheckConfig {
        /// Defaults to the file named by OPENTHUNK_CONFIG
        file: Option<PathBuf>,
    },
}

/// Stands in for the host facilities when only the tables are wanted.
struct Inert;

impl CursorHost for Inert {
    fn clip_cursor(&self, _rect: Option<&Rect>) -> bool {
        false
    }

    fn clip_rect(&self) -> Option<Rect> {
        None
    }

    fn cursor_pos(&self) -> Option<Point> {
        None
    }

    fn set_cursor_pos(&self, _x: i32, _y: i32) -> bool {
        false
    }
}

impl ControlsHost for Inert {
    fn init_common_controls_ex(&self, _init: &InitCommonControlsEx) -> bool {
        false
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    match cli.command {
        Command::Tables { entries } => tables(&cli.log_level, entries),
        Command::Layouts => {
            layouts();
            Ok(())
        }
        Command::CheckConfig { file } => check_config(file),
    }
}

fn tables(log_level: &str, entries: bool) -> Result<()> {
    let mut config = BridgeConfig::default();
    config.log_level = log_level.to_string();
    config.hooks.rebar = false;
    config.hooks.richedit = false;

    let inert = Arc::new(Inert);
    let hosts = Hosts {
        cursor: inert.clone(),
        controls: inert,
    };
    let bridge = Bridge::new(&config, Arc::new(SimWindows::new()), hosts)?;

    for table in bridge.dispatcher().modules() {
        println!(
            "{:>2}  {:<10} {:>3} entries  {:#018x}",
            table.id(),
            table.name(),
            table.len(),
            table.fingerprint()
        );
        if entries {
            for (seq, name) in table.names().enumerate() {
                println!("      {seq:>3}  {name}");
            }
        }
    }
    Ok(())
}

fn layouts() {
    println!("{:<24} {:>6} {:>6}", "structure", "guest", "host");
    for info in openthunk_layout::catalog() {
        println!("{:<24} {:>6} {:>6}", info.name, info.guest_size, info.host_size);
    }
}

fn check_config(file: Option<PathBuf>) -> Result<()> {
    let Some(path) = file.or_else(BridgeConfig::env_path) else {
        bail!("no configuration file given and {CONFIG_ENV} is not set");
    };
    let config = BridgeConfig::load(&path)
        .with_context(|| format!("invalid configuration {}", path.display()))?;
    tracing::info!("{} is valid", path.display());
    println!("log_level     = {}", config.log_level);
    println!("strict_layout = {}", config.strict_layout);
    println!(
        "guest window  = {:#010x}..{:#010x}",
        config.guest.window_base,
        u64::from(config.guest.window_base) + u64::from(config.guest.window_size)
    );
    println!(
        "hooks         = rebar: {}, richedit: {}",
        config.hooks.rebar, config.hooks.richedit
    );
    Ok(())
}
