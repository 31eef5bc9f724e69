//! Savestate orchestration.
//!
//! [`Engine`] binds an address space, the working state in the reserved
//! region and the host collaborators, and runs complete save and restore
//! operations: slot selection, pre-checks, building the base of the
//! incremental chain, staging and committing snapshot files, promotion of
//! the parent, and fork-based asynchronous saves.
//!
//! Nothing here touches signals or execution contexts; see `signal` for the
//! handler that drives an engine from inside a checkpoint.

use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

use ss_common::SlotIndex;
use ss_config::{SavestateSettings, Strictness};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::area::{ProcMaps, SkipPolicy};
use crate::chain::{SnapshotPath, SnapshotRef};
use crate::classify::TagLookup;
use crate::codec::{CodecError, ContentWriter, StateHeader, AREA_RECORD_LEN};
use crate::logging::debug_enabled;
use crate::preserve::{PreservedBlock, PreservedFields};
use crate::reconcile::{reconcile, ReconcileError, ReconcileStats};
use crate::restore::{restore_pages, RestoreError, RestoreOptions, RestoreStats};
use crate::result::SaveStateResult;
use crate::save::{save_areas, SaveError, SaveOptions, SaveStats};
use crate::space::{AddressSpace, ForkOutcome};
use crate::state::{read_header, SavedState};
use crate::storage::{Scratch, SnapshotStore, StorageError, WriteKind};
use crate::threads::{threads_match, ThreadRegistry};

/// File name prefix of user-visible path-mode snapshots.
pub const SLOT_PREFIX: &str = "state";

/// File name of the path-mode base snapshot.
pub const BASE_NAME: &str = "base";

/// Exit status of a forked save child that failed.
pub const FORKED_SAVE_FAILED: i32 = 255;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Save(#[from] SaveError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Restore(#[from] RestoreError),

    #[error("reading live maps: {0}")]
    Maps(#[source] io::Error),

    #[error("no snapshot is selected")]
    NoTarget,

    #[error("slot {slot} is not a user slot (valid: 0..{limit})")]
    SlotOutOfRange { slot: SlotIndex, limit: usize },

    #[error("snapshot path does not fit the path buffer")]
    PathTooLong,

    #[error("restore refused: {0:?}")]
    Refused(SaveStateResult),
}

/// Engine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Saving,
    Restoring,
}

/// Settings the engine reads while running, without heap-owned parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub incremental: bool,
    pub in_ram: bool,
    pub compressed: bool,
    pub fork_to_save: bool,
    pub present_tracking: bool,
    pub strictness: Strictness,
    /// Number of resident slots, the base slot included.
    pub slot_count: usize,
    /// Directory of path-mode snapshots.
    pub dir: SnapshotPath,
}

impl EngineSettings {
    pub fn from_settings(settings: &SavestateSettings) -> Result<Self, EngineError> {
        let dir = SnapshotPath::new(&settings.savestate_dir()).ok_or(EngineError::PathTooLong)?;
        Ok(EngineSettings {
            incremental: settings.incremental,
            in_ram: settings.in_ram,
            compressed: settings.compressed,
            fork_to_save: settings.fork_to_save,
            present_tracking: settings.present_tracking,
            strictness: settings.strictness,
            slot_count: settings.slot_count,
            dir,
        })
    }

    /// Slot holding the base snapshot.
    pub fn base_slot(&self) -> SlotIndex {
        SlotIndex(self.slot_count.saturating_sub(1))
    }

    /// Storage identity of the base snapshot.
    pub fn base_snapshot(&self) -> Result<SnapshotRef, EngineError> {
        if self.in_ram {
            return Ok(SnapshotRef::Slot(self.base_slot()));
        }
        SnapshotPath::new(&self.dir.as_path().join(BASE_NAME))
            .map(SnapshotRef::Path)
            .ok_or(EngineError::PathTooLong)
    }
}

/// Outcome of a save.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SaveReport {
    /// Written in this process.
    Written {
        snapshot: SnapshotRef,
        slot: SlotIndex,
        stats: SaveStats,
        /// Present when the base had to be built first.
        base: Option<SaveStats>,
        elapsed: Duration,
    },
    /// A child process is writing the snapshot.
    Forked { snapshot: SnapshotRef, child: i32 },
}

impl SaveReport {
    /// Summary line for a finished save. Never called from the handler.
    pub fn log(&self) {
        match self {
            SaveReport::Written {
                snapshot,
                stats,
                base,
                elapsed,
                ..
            } => {
                if let Some(base) = base {
                    info!(pages = base.pages.total(), bytes = base.total_bytes(), "base snapshot built");
                }
                info!(
                    snapshot = %snapshot,
                    bytes = stats.total_bytes(),
                    pages = stats.pages.total(),
                    base_pages = stats.pages.base_page,
                    mismatches = stats.mismatches,
                    seconds = elapsed.as_secs_f64(),
                    "savestate written"
                );
            }
            SaveReport::Forked { snapshot, child } => debug!(child, snapshot = %snapshot, "save continues in child"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreReport {
    pub snapshot: SnapshotRef,
    pub layout: ReconcileStats,
    pub pages: RestoreStats,
    pub elapsed: Duration,
}

impl RestoreReport {
    /// Summary line for a finished restore, logged once control is back
    /// in the resumed `save` call.
    pub fn log(&self) {
        if self.layout.skip_drift > 0 {
            warn!(
                areas = self.layout.skip_drift,
                "saved areas were skipped but their live counterparts are not"
            );
        }
        info!(
            snapshot = %self.snapshot,
            pages = self.pages.pages.total(),
            from_base = self.pages.loaded_from_base,
            mapped = self.layout.mapped,
            unmapped = self.layout.unmapped,
            protected = self.layout.protected,
            resized = self.layout.resized,
            demoted = self.layout.demoted,
            seconds = self.elapsed.as_secs_f64(),
            "savestate restored"
        );
    }
}

/// Save/restore driver over one address space.
pub struct Engine<'a, S: AddressSpace> {
    space: &'a mut S,
    scratch: Scratch<'a>,
    settings: EngineSettings,
    threads: &'a dyn ThreadRegistry,
    preserved: &'a dyn PreservedFields,
    policy: SkipPolicy,
    phase: Phase,
}

impl<'a, S: AddressSpace> Engine<'a, S> {
    pub fn new(
        space: &'a mut S,
        scratch: Scratch<'a>,
        settings: EngineSettings,
        threads: &'a dyn ThreadRegistry,
        preserved: &'a dyn PreservedFields,
        policy: SkipPolicy,
    ) -> Self {
        Engine {
            space,
            scratch,
            settings,
            threads,
            preserved,
            policy,
            phase: Phase::Idle,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn space(&mut self) -> &mut S {
        self.space
    }

    /// Target user slot `slot`.
    pub fn select_slot(&mut self, slot: SlotIndex) -> Result<(), EngineError> {
        let limit = self.settings.base_slot().get();
        if slot.get() >= limit {
            return Err(EngineError::SlotOutOfRange { slot, limit });
        }
        let target = if self.settings.in_ram {
            SnapshotRef::Slot(slot)
        } else {
            SnapshotPath::in_dir(self.settings.dir.as_path(), SLOT_PREFIX, slot)
                .map(SnapshotRef::Path)
                .ok_or(EngineError::PathTooLong)?
        };
        self.scratch.registry.select(slot, target);
        Ok(())
    }

    /// Target an explicit path stem; the slot number is kept for reporting.
    pub fn select_path(&mut self, stem: &Path) -> Result<(), EngineError> {
        let path = SnapshotPath::new(stem).ok_or(EngineError::PathTooLong)?;
        let slot = self.scratch.registry.current_slot();
        self.scratch.registry.select(slot, SnapshotRef::Path(path));
        Ok(())
    }

    pub fn current(&self) -> SnapshotRef {
        *self.scratch.registry.current()
    }

    pub fn parent(&self) -> SnapshotRef {
        *self.scratch.registry.parent()
    }

    pub fn base(&self) -> SnapshotRef {
        *self.scratch.registry.base()
    }

    fn read_maps(&mut self) -> Result<usize, EngineError> {
        self.space.read_maps(self.scratch.maps).map_err(EngineError::Maps)
    }

    /// Advisory space check before a save. Never blocks a save when the
    /// free space cannot be determined.
    pub fn check_checkpoint(&mut self) -> Result<SaveStateResult, EngineError> {
        if self.settings.in_ram {
            return Ok(SaveStateResult::Ok);
        }
        let len = self.read_maps()?;
        let mut estimate = 0u64;
        for area in ProcMaps::new(&self.scratch.maps[..len], self.policy) {
            let area = area.map_err(ReconcileError::from)?;
            estimate += AREA_RECORD_LEN as u64;
            if !area.skip && !area.is_reservation() {
                estimate += (area.size() + area.page_count()) as u64;
            }
        }
        match self.space.available_space(self.settings.dir.as_path()) {
            Some(free) if free < estimate => {
                warn!(free, estimate, dir = %self.settings.dir.as_path().display(), "not enough space for a snapshot");
                Ok(SaveStateResult::NotEnoughSpace)
            }
            Some(_) => Ok(SaveStateResult::Ok),
            None => {
                debug!("free space unknown, saving anyway");
                Ok(SaveStateResult::Ok)
            }
        }
    }

    /// Whether the current target can be restored now.
    pub fn check_restore(&mut self) -> Result<SaveStateResult, EngineError> {
        let target = *self.scratch.registry.current();
        let store = SnapshotStore::new(self.scratch.descriptors);
        let Some(files) = store.open(&target)? else {
            return Ok(SaveStateResult::NoState);
        };
        let header = match read_header(&files.tags) {
            Ok(header) => header,
            Err(e) => {
                warn!(snapshot = %target, error = %e, "snapshot header unreadable");
                return Ok(SaveStateResult::NoState);
            }
        };
        if !threads_match(self.threads, &header) {
            warn!(snapshot = %target, "live threads differ from the snapshot");
            return Ok(SaveStateResult::ThreadMismatch);
        }
        Ok(SaveStateResult::Ok)
    }

    /// Save the live process into the current target.
    pub fn save(&mut self) -> Result<SaveReport, EngineError> {
        let target = *self.scratch.registry.current();
        if target.is_none() {
            return Err(EngineError::NoTarget);
        }
        let started = Instant::now();
        self.phase = Phase::Saving;
        let result = self.save_into(target, started);
        self.phase = Phase::Idle;
        result
    }

    fn save_into(&mut self, target: SnapshotRef, started: Instant) -> Result<SaveReport, EngineError> {
        let mut base_stats = None;
        if self.settings.incremental {
            let base = *self.scratch.registry.base();
            if !SnapshotStore::new(self.scratch.descriptors).exists(&base) {
                info!(snapshot = %base, "building base snapshot");
                base_stats = Some(self.write_snapshot(base, WriteKind::Fresh, true)?);
                self.scratch.registry.reset_parent();
            }
        }

        let mut forked_child = false;
        if self.settings.fork_to_save {
            match self.space.fork_for_save() {
                ForkOutcome::Parent { child } => {
                    return Ok(SaveReport::Forked { snapshot: target, child });
                }
                ForkOutcome::Child => forked_child = true,
                ForkOutcome::Unavailable => debug!("fork unavailable, saving inline"),
            }
        }

        let kind = if self.settings.incremental {
            WriteKind::Staged
        } else {
            WriteKind::Overwrite
        };
        let written = self.write_snapshot(target, kind, false);
        let slot = self.scratch.registry.current_slot();
        if forked_child {
            let code = match &written {
                Ok(_) => i32::try_from(slot.get()).unwrap_or(FORKED_SAVE_FAILED),
                Err(e) => {
                    error!(snapshot = %target, error = %e, "forked save failed");
                    FORKED_SAVE_FAILED
                }
            };
            self.space.finish_forked_save(code);
        }
        let stats = written?;
        self.scratch.registry.promote_to_parent(self.settings.incremental);

        Ok(SaveReport::Written {
            snapshot: target,
            slot,
            stats,
            base: base_stats,
            elapsed: started.elapsed(),
        })
    }

    fn write_snapshot(&mut self, target: SnapshotRef, kind: WriteKind, building_base: bool) -> Result<SaveStats, EngineError> {
        let header = StateHeader::from_registry(self.threads)?;
        let maps_len = self.space.read_maps(self.scratch.maps).map_err(EngineError::Maps)?;
        let maps_text = &self.scratch.maps[..maps_len];
        let registry = &*self.scratch.registry;
        let mut store = SnapshotStore::new(self.scratch.descriptors);

        let inherit = self.settings.incremental && !building_base;
        let parent_files = if inherit { store.open(registry.parent())? } else { None };
        let base_files = if inherit { store.open(registry.base())? } else { None };
        let mut parent_state = match &parent_files {
            Some(files) => Some(SavedState::open(&files.tags, &files.content, None)?.1),
            None => None,
        };
        let mut base_state = match &base_files {
            Some(files) => Some(SavedState::open(&files.tags, &files.content, None)?.1),
            None => None,
        };

        let pending = store.create(&target, kind)?;
        let compressor = if self.settings.compressed && !building_base {
            Some(&mut *self.scratch.compressor)
        } else {
            None
        };
        let mut tags = &pending.files.tags;
        let mut content = ContentWriter::new(&pending.files.content, compressor);
        let debug = debug_enabled();
        let options = SaveOptions {
            incremental: self.settings.incremental,
            building_base,
            present_tracking: self.settings.present_tracking,
            verify: self.settings.strictness.verifies(debug),
            hash_areas: debug,
        };
        let stats = save_areas(
            self.space,
            maps_text,
            self.policy,
            &header,
            &mut tags,
            &mut content,
            parent_state.as_mut().map(|s| s as &mut dyn TagLookup),
            base_state.as_mut().map(|s| s as &mut dyn TagLookup),
            options,
        )?;
        drop(content);
        store.commit(pending)?;
        Ok(stats)
    }

    /// Rewrite the live process to match the current target.
    ///
    /// Only structural refusals (missing snapshot, thread mismatch) leave
    /// the process untouched; any other error happens after memory was
    /// already being rewritten.
    pub fn restore(&mut self) -> Result<RestoreReport, EngineError> {
        self.phase = Phase::Restoring;
        let result = self.restore_current();
        self.phase = Phase::Idle;
        result
    }

    fn restore_current(&mut self) -> Result<RestoreReport, EngineError> {
        let target = *self.scratch.registry.current();
        let maps_len = self.space.read_maps(self.scratch.maps).map_err(EngineError::Maps)?;
        let maps_text = &self.scratch.maps[..maps_len];
        let registry = &mut *self.scratch.registry;
        let store = SnapshotStore::new(self.scratch.descriptors);

        let files = store
            .open(&target)?
            .ok_or(EngineError::Refused(SaveStateResult::NoState))?;
        let base_files = store.open(registry.base())?;
        let parent_files = if self.settings.incremental {
            store.open(registry.parent())?
        } else {
            None
        };

        let (header, mut saved) = SavedState::open(&files.tags, &files.content, Some(&mut *self.scratch.inflater))?;
        if !threads_match(self.threads, &header) {
            return Err(EngineError::Refused(SaveStateResult::ThreadMismatch));
        }
        let mut parent_state = match &parent_files {
            Some(files) => Some(SavedState::open(&files.tags, &files.content, None)?.1),
            None => None,
        };
        let mut base_state = match &base_files {
            Some(files) => Some(SavedState::open(&files.tags, &files.content, None)?.1),
            None => None,
        };

        let started = Instant::now();
        let mut preserved = PreservedBlock::new();
        self.preserved.capture(&mut preserved);

        let layout = reconcile(self.space, &mut saved, maps_text, self.policy)?;
        let options = RestoreOptions {
            incremental: self.settings.incremental,
            present_tracking: self.settings.present_tracking,
            verify_hash: debug_enabled(),
        };
        let pages = restore_pages(
            self.space,
            &mut saved,
            parent_state.as_mut().map(|s| s as &mut dyn TagLookup),
            base_state.as_mut(),
            options,
        )?;

        self.preserved.reinstate(&preserved);
        self.threads.restored(&header);
        registry.promote_to_parent(self.settings.incremental);
        Ok(RestoreReport {
            snapshot: target,
            layout,
            pages,
            elapsed: started.elapsed(),
        })
    }
}

/// Collect a finished asynchronous save without blocking. Returns the slot
/// the child wrote, `None` while it is still running or when it failed.
pub fn reap_async_save(child: i32) -> Option<Result<SlotIndex, i32>> {
    let mut status = 0;
    // SAFETY: plain non-blocking wait on our own child.
    let pid = unsafe { libc::waitpid(child, &mut status, libc::WNOHANG) };
    if pid <= 0 {
        return None;
    }
    if libc::WIFEXITED(status) {
        let code = libc::WEXITSTATUS(status);
        if code == FORKED_SAVE_FAILED {
            return Some(Err(code));
        }
        return Some(Ok(SlotIndex(code as usize)));
    }
    warn!(child, status, "save child terminated abnormally");
    Some(Err(status))
}

/// Log an unrecoverable engine failure and terminate the process.
pub fn fatal(what: &str, err: &dyn std::error::Error) -> ! {
    crate::logging::unmute();
    error!(error = %err, "{what}");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::SnapshotRegistry;
    use crate::preserve::NoPreservedFields;
    use crate::space::SimulatedAddressSpace;
    use crate::storage::HeapScratch;
    use crate::threads::StaticThreadRegistry;

    fn settings(dir: &Path) -> EngineSettings {
        EngineSettings::from_settings(&SavestateSettings::default().with_in_ram(true).with_savestate_dir(dir)).unwrap()
    }

    #[test]
    fn base_identity_follows_storage_mode() {
        let mut s = settings(Path::new("/tmp/states"));
        assert_eq!(s.base_snapshot().unwrap(), SnapshotRef::Slot(SlotIndex(10)));
        s.in_ram = false;
        match s.base_snapshot().unwrap() {
            SnapshotRef::Path(p) => assert_eq!(p.as_bytes(), b"/tmp/states/base"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn slots_are_validated_and_mapped_to_targets() {
        let dir = tempfile::tempdir().unwrap();
        let engine_settings = settings(dir.path());
        let mut heap = HeapScratch::new(SnapshotRegistry::new(engine_settings.base_snapshot().unwrap()));
        let mut space = SimulatedAddressSpace::new();
        let threads = StaticThreadRegistry::main_thread(1, 1);
        let mut engine = Engine::new(
            &mut space,
            heap.scratch(),
            engine_settings,
            &threads,
            &NoPreservedFields,
            SkipPolicy::default(),
        );

        engine.select_slot(SlotIndex(3)).unwrap();
        assert_eq!(engine.current(), SnapshotRef::Slot(SlotIndex(3)));
        assert!(matches!(
            engine.select_slot(SlotIndex(10)),
            Err(EngineError::SlotOutOfRange { limit: 10, .. })
        ));
        assert_eq!(engine.check_restore().unwrap(), SaveStateResult::NoState);

        engine.select_path(&dir.path().join("manual")).unwrap();
        assert!(matches!(engine.current(), SnapshotRef::Path(_)));
        assert_eq!(engine.phase(), Phase::Idle);
    }

    #[test]
    fn space_check_is_advisory() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine_settings = settings(dir.path());
        engine_settings.in_ram = false;
        let mut heap = HeapScratch::new(SnapshotRegistry::new(engine_settings.base_snapshot().unwrap()));
        let mut space = SimulatedAddressSpace::new();
        space.map_anonymous(0x10000, 0x10000, crate::area::Protection::READ | crate::area::Protection::WRITE);
        let threads = StaticThreadRegistry::main_thread(1, 1);

        space.set_free_space(None);
        let mut engine = Engine::new(
            &mut space,
            heap.scratch(),
            engine_settings,
            &threads,
            &NoPreservedFields,
            SkipPolicy::default(),
        );
        assert_eq!(engine.check_checkpoint().unwrap(), SaveStateResult::Ok);
        engine.space().set_free_space(Some(0x1000));
        assert_eq!(engine.check_checkpoint().unwrap(), SaveStateResult::NotEnoughSpace);
        engine.space().set_free_space(Some(1 << 30));
        assert_eq!(engine.check_checkpoint().unwrap(), SaveStateResult::Ok);
    }
}
