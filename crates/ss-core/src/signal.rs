//! Checkpoint signal entry point.
//!
//! Saves and restores run inside a signal handler on the reserved region's
//! alternate stack, so the interrupted frame (the caller of
//! [`SavestateHandle::save`] or [`SavestateHandle::load`]) is left intact
//! while its memory is captured or rewritten. A save records the handler's
//! execution context; a restore rewrites memory and then replaces the
//! handler's context with the one recorded in the restored snapshot, so the
//! handler returns into that snapshot's `save` call.
//!
//! Every static here is part of the snapshot like any other data. After a
//! restore they hold the values of the restored save, which is why the
//! restoring flag is asserted again once memory has been rewritten.
//!
//! Logging is muted while the handler runs. Each operation leaves a report
//! behind that the interrupted call logs once the handler has returned.

use std::cell::UnsafeCell;
use std::convert::Infallible;
use std::io;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::OnceLock;

use ss_common::SlotIndex;
use ss_config::{validate_settings, SavestateSettings};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::chain::SnapshotRegistry;
use crate::context::SAVED_CONTEXT;
use crate::logging::{mute, unmute};
use crate::orchestrator::{fatal, reap_async_save, Engine, EngineError, EngineSettings, RestoreReport, SaveReport};
use crate::preserve::PreservedFields;
use crate::result::SaveStateResult;
use crate::space::LiveAddressSpace;
use crate::storage::{RegionLayout, ReservedRegion};
use crate::threads::ThreadRegistry;

/// Signal used to enter the engine.
pub const CHECKPOINT_SIGNAL: libc::c_int = libc::SIGSYS;

static RESTORE_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
static LAST_RESULT: AtomicI32 = AtomicI32::new(0);
static FORKED_CHILD: AtomicI32 = AtomicI32::new(0);
static INSTALLED: OnceLock<Installed> = OnceLock::new();
static LAST_REPORT: ReportCell = ReportCell(UnsafeCell::new(None));

#[derive(Debug, Clone, Copy)]
enum HandlerReport {
    Saved(SaveReport),
    Restored(RestoreReport),
}

impl HandlerReport {
    fn log(&self) {
        match self {
            HandlerReport::Saved(report) => report.log(),
            HandlerReport::Restored(report) => report.log(),
        }
    }
}

struct ReportCell(UnsafeCell<Option<HandlerReport>>);

// SAFETY: written only inside the handler and read only by the checkpoint
// thread after `raise` returned, never both at once.
unsafe impl Sync for ReportCell {}

impl ReportCell {
    fn put(&self, report: HandlerReport) {
        // SAFETY: see the `Sync` impl.
        unsafe { *self.0.get() = Some(report) }
    }

    fn take(&self) -> Option<HandlerReport> {
        // SAFETY: see the `Sync` impl.
        unsafe { (*self.0.get()).take() }
    }
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("invalid settings: {0}")]
    Invalid(String),

    #[error("savestate engine is already installed")]
    AlreadyInstalled,

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("engine setup: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum HandleError {
    #[error("request refused: {0:?}")]
    Refused(SaveStateResult),

    #[error("engine is busy")]
    Busy,

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("raising checkpoint signal: {0}")]
    Signal(#[source] io::Error),
}

/// How control came back out of [`SavestateHandle::save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    /// The snapshot was written.
    Saved,
    /// A child process is writing the snapshot.
    Forked { child: i32 },
    /// A later load restored this snapshot and execution resumed here.
    Resumed,
}

struct Installed {
    region: ReservedRegion,
    space: UnsafeCell<LiveAddressSpace>,
    settings: EngineSettings,
    threads: Box<dyn ThreadRegistry + Send + Sync>,
    preserved: Box<dyn PreservedFields + Send + Sync>,
    busy: AtomicBool,
}

// SAFETY: `space` is only reached through `with_engine`, which the busy flag
// makes exclusive.
unsafe impl Sync for Installed {}

impl Installed {
    fn with_engine<R>(&self, run: impl FnOnce(&mut Engine<'_, LiveAddressSpace>) -> R) -> Option<R> {
        if self.busy.swap(true, Ordering::AcqRel) {
            return None;
        }
        // SAFETY: the busy flag grants exclusive use of the address space
        // and the region's working state.
        let result = unsafe {
            let mut engine = Engine::new(
                &mut *self.space.get(),
                self.region.scratch(),
                self.settings,
                &*self.threads,
                &*self.preserved,
                self.region.skip_policy(),
            );
            run(&mut engine)
        };
        // A restore may have rewritten the flag with its value at save time.
        self.busy.store(false, Ordering::Release);
        Some(result)
    }
}

/// Set up the engine for the calling thread and select slot 0.
///
/// The calling thread becomes the checkpoint thread: its alternate stack is
/// the one the handler runs on, and only it may use the returned handle.
pub fn install(
    settings: &SavestateSettings,
    threads: Box<dyn ThreadRegistry + Send + Sync>,
    preserved: Box<dyn PreservedFields + Send + Sync>,
) -> Result<SavestateHandle, InstallError> {
    let validation = validate_settings(settings);
    if !validation.is_valid() {
        return Err(InstallError::Invalid(validation.summary()));
    }
    for warning in &validation.warnings {
        warn!(%warning, "savestate settings");
    }
    if INSTALLED.get().is_some() {
        return Err(InstallError::AlreadyInstalled);
    }

    let engine_settings = EngineSettings::from_settings(settings)?;
    if !settings.in_ram {
        std::fs::create_dir_all(settings.savestate_dir())?;
    }
    let region = ReservedRegion::new(
        RegionLayout::default(),
        SnapshotRegistry::new(engine_settings.base_snapshot()?),
    )?;
    region.install_alt_stack()?;

    // SAFETY: the host parks its other threads before every checkpoint.
    let space = unsafe { LiveAddressSpace::new() };
    if !space.has_pagemap() && (settings.incremental || settings.present_tracking) {
        warn!("pagemap unavailable, every page is treated as present and dirty");
    }

    INSTALLED
        .set(Installed {
            region,
            space: UnsafeCell::new(space),
            settings: engine_settings,
            threads,
            preserved,
            busy: AtomicBool::new(false),
        })
        .map_err(|_| InstallError::AlreadyInstalled)?;

    // SAFETY: the action is fully initialised and the handler only touches
    // state that was set up above.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = checkpoint_handler as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(CHECKPOINT_SIGNAL, &action, ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error().into());
        }
    }

    let installed = INSTALLED.get().ok_or(InstallError::AlreadyInstalled)?;
    let handle = SavestateHandle { installed };
    handle
        .select_slot(SlotIndex(0))
        .map_err(|e| match e {
            HandleError::Engine(e) => InstallError::Engine(e),
            other => InstallError::Invalid(other.to_string()),
        })?;
    info!(
        incremental = settings.incremental,
        in_ram = settings.in_ram,
        compressed = settings.compressed,
        fork_to_save = settings.fork_to_save,
        "savestate engine installed"
    );
    Ok(handle)
}

extern "C" fn checkpoint_handler(_signal: libc::c_int, _info: *mut libc::siginfo_t, uc: *mut libc::c_void) {
    let Some(installed) = INSTALLED.get() else {
        return;
    };
    let marker = 0u8;
    if !installed.region.stack_contains(ptr::addr_of!(marker) as usize) {
        error!("checkpoint signal delivered outside the alternate stack");
        std::process::abort();
    }
    let _muted = mute();
    let uc = uc.cast::<libc::ucontext_t>();
    if RESTORE_IN_PROGRESS.load(Ordering::Acquire) {
        restore_in_handler(installed, uc);
    } else {
        save_in_handler(installed, uc);
    }
}

fn save_in_handler(installed: &Installed, uc: *mut libc::ucontext_t) {
    // SAFETY: `uc` is this handler's frame context.
    unsafe { SAVED_CONTEXT.capture(uc) };
    match installed.with_engine(|engine| engine.save()) {
        Some(Ok(report)) => {
            if let SaveReport::Forked { child, .. } = report {
                FORKED_CHILD.store(child, Ordering::Release);
            }
            LAST_REPORT.put(HandlerReport::Saved(report));
        }
        Some(Err(e)) => fatal("savestate failed", &e),
        None => fatal_busy(),
    }
    LAST_RESULT.store(SaveStateResult::Ok.as_i32(), Ordering::Release);
}

fn restore_in_handler(installed: &Installed, uc: *mut libc::ucontext_t) {
    match installed.with_engine(|engine| engine.restore()) {
        Some(Ok(report)) => {
            RESTORE_IN_PROGRESS.store(true, Ordering::Release);
            LAST_RESULT.store(SaveStateResult::Ok.as_i32(), Ordering::Release);
            LAST_REPORT.put(HandlerReport::Restored(report));
            // SAFETY: `uc` is this handler's frame context.
            if !unsafe { SAVED_CONTEXT.apply(uc) } {
                unmute();
                error!("restored snapshot carries no execution context");
                std::process::abort();
            }
        }
        Some(Err(EngineError::Refused(result))) => {
            RESTORE_IN_PROGRESS.store(false, Ordering::Release);
            LAST_RESULT.store(result.as_i32(), Ordering::Release);
        }
        Some(Err(e)) => fatal("restore failed", &e),
        None => fatal_busy(),
    }
}

fn fatal_busy() -> ! {
    unmute();
    error!("checkpoint signal raised while the engine was busy");
    std::process::abort()
}

fn raise_checkpoint() -> Result<(), HandleError> {
    // SAFETY: the handler for the signal is installed.
    if unsafe { libc::raise(CHECKPOINT_SIGNAL) } != 0 {
        return Err(HandleError::Signal(io::Error::last_os_error()));
    }
    Ok(())
}

/// Host-facing control of the installed engine.
#[derive(Clone, Copy)]
pub struct SavestateHandle {
    installed: &'static Installed,
}

impl std::fmt::Debug for SavestateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SavestateHandle")
            .field("settings", &self.installed.settings)
            .finish_non_exhaustive()
    }
}

impl SavestateHandle {
    fn run<R>(&self, op: impl FnOnce(&mut Engine<'_, LiveAddressSpace>) -> Result<R, EngineError>) -> Result<R, HandleError> {
        self.installed
            .with_engine(op)
            .ok_or(HandleError::Busy)?
            .map_err(HandleError::from)
    }

    /// Save into the selected slot.
    ///
    /// Returns twice for every snapshot: once when it is written, and again
    /// with [`Checkpoint::Resumed`] each time it is loaded.
    pub fn save(&self) -> Result<Checkpoint, HandleError> {
        match self.run(|engine| engine.check_checkpoint())? {
            SaveStateResult::Ok => {}
            refused => return Err(HandleError::Refused(refused)),
        }
        FORKED_CHILD.store(0, Ordering::Release);
        RESTORE_IN_PROGRESS.store(false, Ordering::Release);
        raise_checkpoint()?;
        if let Some(report) = LAST_REPORT.take() {
            report.log();
        }
        if RESTORE_IN_PROGRESS.swap(false, Ordering::AcqRel) {
            debug!("resumed from savestate");
            return Ok(Checkpoint::Resumed);
        }
        match FORKED_CHILD.load(Ordering::Acquire) {
            0 => Ok(Checkpoint::Saved),
            child => Ok(Checkpoint::Forked { child }),
        }
    }

    /// Restore the selected slot. On success control continues in the
    /// `save` call that wrote the snapshot, so this only returns on failure.
    pub fn load(&self) -> Result<Infallible, HandleError> {
        match self.run(|engine| engine.check_restore())? {
            SaveStateResult::Ok => {}
            refused => return Err(HandleError::Refused(refused)),
        }
        RESTORE_IN_PROGRESS.store(true, Ordering::Release);
        raise_checkpoint()?;
        RESTORE_IN_PROGRESS.store(false, Ordering::Release);
        let code = LAST_RESULT.load(Ordering::Acquire);
        Err(HandleError::Refused(
            SaveStateResult::from_i32(code).unwrap_or(SaveStateResult::NoState),
        ))
    }

    /// Whether a restore is running or has just completed.
    pub fn is_loading(&self) -> bool {
        RESTORE_IN_PROGRESS.load(Ordering::Acquire)
    }

    pub fn select_slot(&self, slot: SlotIndex) -> Result<(), HandleError> {
        self.run(|engine| engine.select_slot(slot))
    }

    pub fn select_path(&self, stem: &Path) -> Result<(), HandleError> {
        self.run(|engine| engine.select_path(stem))
    }

    /// Collect a finished forked save: the slot it wrote, or its failing
    /// exit status. `None` while none is pending or it is still running.
    pub fn reap(&self) -> Option<Result<SlotIndex, i32>> {
        let child = FORKED_CHILD.load(Ordering::Acquire);
        if child <= 0 {
            return None;
        }
        let reaped = reap_async_save(child)?;
        FORKED_CHILD.store(0, Ordering::Release);
        Some(reaped)
    }

    /// Code of the most recent checkpoint outcome.
    pub fn last_result(&self) -> SaveStateResult {
        SaveStateResult::from_i32(LAST_RESULT.load(Ordering::Acquire)).unwrap_or(SaveStateResult::Ok)
    }
}
