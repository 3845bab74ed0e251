mod config;
mod event;
mod hook;
mod hotkey;
mod keys;
mod lifecycle;
mod lockfile;
mod observer;
mod overlay;
mod paths;
mod state;
mod status;
mod suppressor;
#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, Settings, DEFAULT_HOTKEY};
use crate::event::{DaemonEvent, ToggleSender};
use crate::hook::{HookInstallError, KeyboardHook};
use crate::hotkey::{HotkeyBinding, HotkeyClaim, HotkeyListener};
use crate::lockfile::{InstanceLock, LockError};
use crate::observer::{LogNotifier, NotificationObserver, Notifier, ERROR_TITLE};
use crate::overlay::{Appearance, Overlay};
use crate::paths::AppPaths;
use crate::state::{LockCell, LockStateMachine};
use crate::status::StatusFile;
use crate::suppressor::{KeyFilter, SuppressionPolicy, Suppressor};

const EXIT_FAILURE: u8 = 1;
const EXIT_ALREADY_RUNNING: u8 = 2;
const EXIT_HOOK_INSTALL: u8 = 3;

#[derive(Debug, Default, PartialEq)]
struct Args {
    config: Option<PathBuf>,
}

/// Parses `--config <path>` / `--config=<path>`.  `args` excludes the program name.
fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args> {
    let mut parsed = Args::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--config" {
            let path = args.next().context("--config requires a path")?;
            parsed.config = Some(PathBuf::from(path));
        } else if let Some(path) = arg.strip_prefix("--config=") {
            parsed.config = Some(PathBuf::from(path));
        } else {
            bail!("unknown argument: {arg}");
        }
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "pawgate starting");

    let result = match parse_args(std::env::args().skip(1)) {
        Ok(args) => run(args).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = exit_code(&e);
            if code == EXIT_ALREADY_RUNNING {
                warn!("{e}");
                LogNotifier.notify(ERROR_TITLE, "PawGate is already running");
            } else {
                error!(error = %format!("{e:#}"), "pawgate stopped");
                if code == EXIT_HOOK_INSTALL {
                    LogNotifier.notify(ERROR_TITLE, "The keyboard hook could not be installed");
                }
            }
            ExitCode::from(code)
        }
    }
}

fn exit_code(e: &anyhow::Error) -> u8 {
    if matches!(e.downcast_ref::<LockError>(), Some(LockError::AlreadyRunning { .. })) {
        EXIT_ALREADY_RUNNING
    } else if e.downcast_ref::<HookInstallError>().is_some() {
        EXIT_HOOK_INSTALL
    } else {
        EXIT_FAILURE
    }
}

async fn run(args: Args) -> Result<()> {
    let paths = AppPaths::resolve(args.config)?;
    let mut daemon = start(&paths, Backends::platform())?;

    // ── Background tasks ──────────────────────────────────────────────────────
    tokio::spawn(config::watch_config(paths.config.clone(), daemon.sender.clone()));
    tokio::spawn(lifecycle::forward_shutdown(daemon.sender.clone()));

    match daemon.listener.binding() {
        Some(binding) => info!(hotkey = %binding, "pawgate ready"),
        None => info!("pawgate ready; no hotkey, unlock by clicking the overlay"),
    }

    // ── Event loop ────────────────────────────────────────────────────────────
    while let Some(evt) = daemon.events.recv().await {
        if !daemon.handle(evt) {
            break;
        }
    }

    daemon.stop();
    Ok(())
}

/// Platform pieces the daemon is assembled from.
struct Backends {
    hook: Box<dyn KeyboardHook>,
    claim: Box<dyn HotkeyClaim>,
    overlay: fn(Appearance, ToggleSender) -> Box<dyn Overlay>,
}

impl Backends {
    fn platform() -> Self {
        Self {
            hook: hook::platform_hook(),
            claim: hotkey::platform_claim(),
            overlay: overlay::platform_overlay,
        }
    }
}

/// A started daemon.  Fields drop in order, so the instance marker goes last.
struct Daemon {
    machine: LockStateMachine,
    listener: Arc<HotkeyListener>,
    events: mpsc::Receiver<DaemonEvent>,
    sender: mpsc::Sender<DaemonEvent>,
    instance: InstanceLock,
}

/// Takes the instance marker, then builds everything else.  Nothing is
/// installed, written or registered unless the marker was acquired.
fn start(paths: &AppPaths, backends: Backends) -> Result<Daemon> {
    let instance = InstanceLock::acquire(&paths.lock)?;

    // ── Configuration ─────────────────────────────────────────────────────────
    let config = config::load_or_default(&paths.config).unwrap_or_else(|e| {
        error!(error = %format!("{e:#}"), "config unreadable; using defaults");
        Config::default()
    });
    let mut settings = resolve_settings(&config);

    let (sender, events) = mpsc::channel::<DaemonEvent>(32);

    // ── Lock state, hotkey and hook ───────────────────────────────────────────
    let cell = LockCell::new();
    lifecycle::install_panic_guard(cell.emergency());

    let policy = SuppressionPolicy::default();
    for combo in policy.allowed() {
        debug!(combo = combo.name, key = %keys::key_name(combo.key), "never suppressed");
    }

    let listener = Arc::new(HotkeyListener::new(
        policy.clone(),
        backends.claim,
        cell.reader(),
        ToggleSender::new(sender.clone()),
    ));
    settings.hotkey = register_hotkey(&listener, settings.hotkey);

    let filter = Arc::new(KeyFilter::new(
        Arc::clone(&listener),
        policy,
        cell.reader(),
        ToggleSender::new(sender.clone()),
    ));
    let mut suppressor = Suppressor::new(backends.hook, filter);
    suppressor.install().context("failed to install the keyboard hook")?;

    let overlay = (backends.overlay)(settings.appearance, ToggleSender::new(sender.clone()));
    let mut machine = LockStateMachine::new(cell, suppressor, overlay);

    let status_file = StatusFile::new(paths.status.clone(), &settings);
    status_file.publish();
    machine.add_observer(Box::new(status_file));
    machine.add_observer(Box::new(NotificationObserver::new(Box::new(LogNotifier), &settings)));

    Ok(Daemon { machine, listener, events, sender, instance })
}

impl Daemon {
    /// Applies one event.  Returns `false` once the daemon should stop.
    fn handle(&mut self, evt: DaemonEvent) -> bool {
        match evt {
            DaemonEvent::Toggle(request) => {
                // Failures are logged and reported to observers by the machine.
                if let Ok(outcome) = self.machine.handle(request) {
                    debug!(?outcome, overlay = self.machine.overlay_visible(), "toggle handled");
                }
            }

            DaemonEvent::HookFault => {
                self.machine.recover();
            }

            DaemonEvent::ConfigReloaded(new_config) => {
                let mut new_settings = resolve_settings(&new_config);
                new_settings.hotkey = register_hotkey(&self.listener, new_settings.hotkey);
                self.machine.reconfigure(&new_settings);
                info!("config reloaded");
            }

            DaemonEvent::Shutdown => {
                info!("shutting down");
                return false;
            }
        }
        true
    }

    fn stop(&mut self) {
        self.machine.shutdown();
        self.listener.unregister();
        self.instance.release();
    }
}

fn resolve_settings(config: &Config) -> Settings {
    let (settings, problem) = Settings::resolve(config);
    if let Some(problem) = problem {
        warn!(error = %problem, default = DEFAULT_HOTKEY, "using default hotkey");
    }
    settings
}

/// Registers `binding`, returning whichever binding is active afterwards.  A
/// failed registration keeps the previous binding (none at startup).
fn register_hotkey(listener: &HotkeyListener, binding: Option<HotkeyBinding>) -> Option<HotkeyBinding> {
    let binding = binding?;
    match listener.register(binding) {
        Ok(()) => Some(binding),
        Err(e) => {
            warn!(error = %e, "hotkey unavailable; unlock by clicking the overlay");
            listener.binding()
        }
    }
}
