//! Savestate core engine.
//!
//! This crate provides:
//! - Memory area enumeration from the kernel's maps text
//! - The paired tag/content snapshot streams, with optional compression
//! - Incremental saves diffed against a parent/base chain via soft-dirty bits
//! - Address-space reconciliation and page restore
//! - The signal-driven save/restore entry point for host programs

pub mod area;
pub mod chain;
pub mod classify;
pub mod codec;
pub mod context;
pub mod logging;
pub mod orchestrator;
pub mod page;
pub mod pagemap;
pub mod preserve;
pub mod reconcile;
pub mod restore;
pub mod result;
pub mod save;
pub mod signal;
pub mod space;
pub mod state;
pub mod storage;
pub mod threads;

pub use area::{Area, AreaFlags, AreaName, ProcMaps, Protection, SkipPolicy};
pub use chain::{SnapshotPath, SnapshotRef, SnapshotRegistry};
pub use logging::{init_logging, Hex};
pub use orchestrator::{Engine, EngineError, EngineSettings, RestoreReport, SaveReport};
pub use page::{PageCounts, PageKind, PAGE_SIZE};
pub use preserve::{NoPreservedFields, PreservedCounters, PreservedFields};
pub use result::SaveStateResult;
pub use signal::{install, Checkpoint, HandleError, InstallError, SavestateHandle};
pub use space::{AddressSpace, LiveAddressSpace};
pub use state::SavedState;
pub use threads::{StaticThreadRegistry, ThreadRecord, ThreadRegistry, ThreadState};
