//! Values carried across a restore.
//!
//! Some host state must keep its live value even though the memory holding
//! it is rewritten, typically sequence counters shared with an outside peer
//! such as a display server connection. Before a restore they are copied
//! into a fixed block on the alternate stack and written back afterwards.

/// Words the engine can carry across one restore.
pub const PRESERVED_WORDS: usize = 64;

/// Fixed-size holding area for preserved values.
#[derive(Debug, Clone, Copy)]
pub struct PreservedBlock {
    words: [u64; PRESERVED_WORDS],
    len: usize,
}

impl PreservedBlock {
    pub const fn new() -> Self {
        PreservedBlock {
            words: [0; PRESERVED_WORDS],
            len: 0,
        }
    }

    /// Append a word; `false` once the block is full.
    pub fn push(&mut self, word: u64) -> bool {
        if self.len == PRESERVED_WORDS {
            return false;
        }
        self.words[self.len] = word;
        self.len += 1;
        true
    }

    pub fn words(&self) -> &[u64] {
        &self.words[..self.len]
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

/// Host state to keep across restores.
pub trait PreservedFields {
    /// Copy the current values into `block`.
    fn capture(&self, block: &mut PreservedBlock);

    /// Write the values captured earlier back into live memory.
    fn reinstate(&self, block: &PreservedBlock);
}

/// Nothing to preserve.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPreservedFields;

impl PreservedFields for NoPreservedFields {
    fn capture(&self, _block: &mut PreservedBlock) {}
    fn reinstate(&self, _block: &PreservedBlock) {}
}

/// Counters at fixed addresses, read and written with volatile accesses.
#[derive(Debug, Default)]
pub struct PreservedCounters {
    slots: Vec<*mut u64>,
}

// SAFETY: the pointers are only dereferenced by the checkpoint thread while
// every other thread is parked.
unsafe impl Send for PreservedCounters {}
// SAFETY: see above.
unsafe impl Sync for PreservedCounters {}

impl PreservedCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track the counter at `counter`.
    ///
    /// # Safety
    ///
    /// `counter` must stay valid for reads and writes, and properly aligned,
    /// for as long as the engine is armed.
    pub unsafe fn register(&mut self, counter: *mut u64) -> bool {
        if self.slots.len() == PRESERVED_WORDS {
            return false;
        }
        self.slots.push(counter);
        true
    }
}

impl PreservedFields for PreservedCounters {
    fn capture(&self, block: &mut PreservedBlock) {
        block.clear();
        for slot in &self.slots {
            // SAFETY: guaranteed by `register`.
            block.push(unsafe { slot.read_volatile() });
        }
    }

    fn reinstate(&self, block: &PreservedBlock) {
        for (slot, word) in self.slots.iter().zip(block.words()) {
            // SAFETY: guaranteed by `register`.
            unsafe { slot.write_volatile(*word) };
        }
    }
}
