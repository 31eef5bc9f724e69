//! Execution context of the checkpointed thread.
//!
//! A save copies the signal frame's context into a static buffer before the
//! pages are written, so the buffer itself is part of every snapshot. After
//! a restore the buffer holds the context of the save being restored, and
//! writing it over the current frame makes the handler return to that save
//! point.
//!
//! On x86_64 the extended register state lives outside `ucontext_t`, behind
//! `uc_mcontext.fpregs`. It is saved by value and written back through the
//! current frame's pointer.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(all(target_arch = "x86_64", target_env = "gnu"))]
struct Saved {
    context: libc::ucontext_t,
    fpstate: libc::_libc_fpstate,
    has_fpstate: bool,
}

#[cfg(not(all(target_arch = "x86_64", target_env = "gnu")))]
struct Saved {
    context: libc::ucontext_t,
}

/// Statically allocated context buffer.
pub struct ContextCell {
    saved: UnsafeCell<MaybeUninit<Saved>>,
    captured: AtomicBool,
}

// SAFETY: only the checkpoint thread touches the buffer, and only while the
// other threads are parked.
unsafe impl Sync for ContextCell {}

/// Context of the most recent save.
pub static SAVED_CONTEXT: ContextCell = ContextCell::new();

impl Default for ContextCell {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextCell {
    pub const fn new() -> Self {
        ContextCell {
            saved: UnsafeCell::new(MaybeUninit::uninit()),
            captured: AtomicBool::new(false),
        }
    }

    pub fn is_captured(&self) -> bool {
        self.captured.load(Ordering::Acquire)
    }

    /// Copy the frame context `uc` into the buffer.
    ///
    /// # Safety
    ///
    /// `uc` must be the context argument of the running signal handler and
    /// no other reference to the buffer may be live.
    pub unsafe fn capture(&self, uc: *const libc::ucontext_t) {
        let saved = (*self.saved.get()).as_mut_ptr();
        std::ptr::copy_nonoverlapping(uc, std::ptr::addr_of_mut!((*saved).context), 1);
        #[cfg(all(target_arch = "x86_64", target_env = "gnu"))]
        {
            let fpregs = (*uc).uc_mcontext.fpregs;
            std::ptr::addr_of_mut!((*saved).has_fpstate).write(!fpregs.is_null());
            if !fpregs.is_null() {
                std::ptr::copy_nonoverlapping(fpregs, std::ptr::addr_of_mut!((*saved).fpstate), 1);
            }
        }
        self.captured.store(true, Ordering::Release);
    }

    /// Overwrite the frame context `uc` with the buffered one. Returns
    /// `false` when nothing was captured.
    ///
    /// # Safety
    ///
    /// As for [`capture`](Self::capture); `uc` must be writable.
    pub unsafe fn apply(&self, uc: *mut libc::ucontext_t) -> bool {
        if !self.is_captured() {
            return false;
        }
        let saved = &*(*self.saved.get()).as_ptr();
        #[cfg(all(target_arch = "x86_64", target_env = "gnu"))]
        {
            let fpregs = (*uc).uc_mcontext.fpregs;
            std::ptr::copy_nonoverlapping(&saved.context, uc, 1);
            (*uc).uc_mcontext.fpregs = fpregs;
            if saved.has_fpstate && !fpregs.is_null() {
                std::ptr::copy_nonoverlapping(&saved.fpstate, fpregs, 1);
            }
        }
        #[cfg(not(all(target_arch = "x86_64", target_env = "gnu")))]
        std::ptr::copy_nonoverlapping(&saved.context, uc, 1);
        true
    }
}
