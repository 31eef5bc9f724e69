//! Logging setup and field formatting.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use ss_config::LogSettings;
use tracing::Metadata;
use tracing_subscriber::filter::{filter_fn, FilterFn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt as fmt_layer, EnvFilter, Registry};

/// Environment variable overriding the configured filter.
pub const ENV_LOG: &str = "SAVESTATE_LOG";

static MUTED: AtomicBool = AtomicBool::new(false);
static DEBUG_WHILE_MUTED: AtomicBool = AtomicBool::new(false);

/// Address or size rendered as `0x…` in log fields.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Hex(pub usize);

impl fmt::Display for Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("a global subscriber is already installed")]
    AlreadySet(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Build the filter: `SAVESTATE_LOG` when set, the configured level otherwise.
pub fn log_filter(settings: &LogSettings) -> Result<EnvFilter, LoggingError> {
    match std::env::var(ENV_LOG) {
        Ok(directives) if !directives.trim().is_empty() => Ok(EnvFilter::try_new(directives)?),
        _ => Ok(EnvFilter::try_new(&settings.level)?),
    }
}

/// Drops every event while [`mute`] is in effect.
///
/// Checkpoints run in a signal handler where formatting an event may
/// allocate, so the handler mutes logging and reports afterwards.
pub fn mute_gate() -> FilterFn<fn(&Metadata<'_>) -> bool> {
    filter_fn(not_muted as fn(&Metadata<'_>) -> bool)
}

fn not_muted(_: &Metadata<'_>) -> bool {
    !MUTED.load(Ordering::Relaxed)
}

/// Silences all events until the guard is dropped.
#[must_use = "logging is unmuted when the guard drops"]
pub struct MuteGuard(());

impl Drop for MuteGuard {
    fn drop(&mut self) {
        unmute();
    }
}

/// Mute logging, remembering whether debug diagnostics were enabled.
pub fn mute() -> MuteGuard {
    if !is_muted() {
        DEBUG_WHILE_MUTED.store(tracing::enabled!(tracing::Level::DEBUG), Ordering::Relaxed);
    }
    MUTED.store(true, Ordering::Release);
    MuteGuard(())
}

/// Lift a mute early, for a last message before the process aborts.
pub fn unmute() {
    MUTED.store(false, Ordering::Release);
}

pub fn is_muted() -> bool {
    MUTED.load(Ordering::Acquire)
}

/// Install the global subscriber: compact text on stderr, or JSON lines.
///
/// Must run before the engine is armed. Inside a checkpoint the subscriber
/// only sees callsite checks; [`mute_gate`] turns every event away.
pub fn init_logging(settings: &LogSettings) -> Result<(), LoggingError> {
    let subscriber = Registry::default().with(log_filter(settings)?).with(mute_gate());
    if settings.json {
        let layer = fmt_layer::layer()
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr);
        tracing::subscriber::set_global_default(subscriber.with(layer))?;
    } else {
        let layer = fmt_layer::layer()
            .compact()
            .with_target(true)
            .with_level(true)
            .with_writer(std::io::stderr);
        tracing::subscriber::set_global_default(subscriber.with(layer))?;
    }
    Ok(())
}

/// Whether verbose diagnostics (hash checks, assumption checks) should run.
///
/// While muted this answers as it did when the mute began.
pub fn debug_enabled() -> bool {
    if is_muted() {
        return DEBUG_WHILE_MUTED.load(Ordering::Relaxed);
    }
    tracing::enabled!(tracing::Level::DEBUG)
}
