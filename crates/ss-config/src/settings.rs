//! Engine settings.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default number of resident slots: ten user slots plus the base.
pub const DEFAULT_SLOT_COUNT: usize = 11;

/// How far the save path trusts the soft-dirty bit.
///
/// A clean page inherits its tag from the parent snapshot without its
/// bytes being looked at. The stricter levels re-inspect memory before
/// trusting that inheritance and fall back to storing the page when the
/// assumption fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strictness {
    /// Never re-inspect.
    Trusting,
    /// Re-inspect only while debug logging is enabled.
    #[default]
    VerifyWhenDebug,
    /// Always re-inspect.
    Verify,
}

impl Strictness {
    /// Whether inherited tags must be checked against live memory.
    pub fn verifies(self, debug_enabled: bool) -> bool {
        match self {
            Strictness::Trusting => false,
            Strictness::VerifyWhenDebug => debug_enabled,
            Strictness::Verify => true,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Default filter directive when `SAVESTATE_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Complete engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SavestateSettings {
    /// Diff every save against a parent/base chain.
    pub incremental: bool,
    /// Keep snapshots in memory file descriptors instead of files.
    pub in_ram: bool,
    /// Store modified pages through the streaming compressor.
    pub compressed: bool,
    /// Perform saves in a forked child while the caller keeps running.
    pub fork_to_save: bool,
    /// Tag pages the kernel reports as absent as `NO_PAGE`.
    pub present_tracking: bool,
    /// Trust level for soft-dirty based tag inheritance.
    pub strictness: Strictness,
    /// Size of the resident slot table; the last slot holds the base.
    pub slot_count: usize,
    /// Directory for path-mode snapshot pairs.
    pub savestate_dir: Option<PathBuf>,
    pub log: LogSettings,
}

impl Default for SavestateSettings {
    fn default() -> Self {
        Self {
            incremental: false,
            in_ram: false,
            compressed: true,
            fork_to_save: false,
            present_tracking: true,
            strictness: Strictness::default(),
            slot_count: DEFAULT_SLOT_COUNT,
            savestate_dir: None,
            log: LogSettings::default(),
        }
    }
}

impl SavestateSettings {
    pub fn with_incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    pub fn with_in_ram(mut self, in_ram: bool) -> Self {
        self.in_ram = in_ram;
        self
    }

    pub fn with_compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    pub fn with_fork_to_save(mut self, fork_to_save: bool) -> Self {
        self.fork_to_save = fork_to_save;
        self
    }

    pub fn with_strictness(mut self, strictness: Strictness) -> Self {
        self.strictness = strictness;
        self
    }

    pub fn with_savestate_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.savestate_dir = Some(dir.into());
        self
    }

    /// Slot reserved for the base snapshot.
    pub fn base_slot(&self) -> usize {
        self.slot_count.saturating_sub(1)
    }

    /// Directory for path-mode snapshots, falling back to the platform cache dir.
    pub fn savestate_dir(&self) -> PathBuf {
        self.savestate_dir
            .clone()
            .unwrap_or_else(crate::resolve::default_savestate_dir)
    }
}
