//! Direct-mapped guest address → host code table.
//!
//! The table is embedded in [`ExecutionState`](crate::ExecutionState) and read directly by the
//! dispatch trampoline, so the slot layout (`{ tag: u64, code: u64 }`) is part of the ABI.

use core::fmt;
use core::num::NonZeroUsize;

/// Number of index bits of the quick dispatch table.
pub const QUICK_TLB_BITS: u32 = 10;
pub const QUICK_TLB_ENTRIES: usize = 1 << QUICK_TLB_BITS;
pub const QUICK_TLB_INDEX_MASK: u64 = (QUICK_TLB_ENTRIES as u64) - 1;

/// Size of a single slot in bytes (`tag: u64` + `code: u64`).
pub const QUICK_TLB_ENTRY_SIZE: usize = 16;

const _: () = {
    // Indexing is a mask, never a modulo.
    assert!(QUICK_TLB_ENTRIES.is_power_of_two());
    assert!(QUICK_TLB_INDEX_MASK == (QUICK_TLB_ENTRIES as u64) - 1);

    assert!(QUICK_TLB_ENTRY_SIZE == core::mem::size_of::<[u64; 2]>());
    assert!(core::mem::size_of::<QuickTlb>() == QUICK_TLB_ENTRIES * QUICK_TLB_ENTRY_SIZE);
};

/// Host address of a translated function.
///
/// Never zero: a zero code word marks an empty slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CodePtr(NonZeroUsize);

impl CodePtr {
    pub const fn new(addr: usize) -> Option<Self> {
        match NonZeroUsize::new(addr) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    pub fn from_ptr(ptr: *const u8) -> Option<Self> {
        Self::new(ptr.expose_provenance())
    }

    pub const fn addr(self) -> usize {
        self.0.get()
    }

    pub fn as_ptr(self) -> *const u8 {
        core::ptr::with_exposed_provenance(self.addr())
    }
}

impl fmt::Display for CodePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.addr())
    }
}

/// Fixed-capacity dispatch table.
///
/// The tag is the full lookup key, so a hit can only ever return the code that was inserted for
/// exactly that key. Staleness across retranslation is handled by the owner flushing the table when
/// the translation generation changes (see [`ExecutionState::sync_generation`]).
///
/// [`ExecutionState::sync_generation`]: crate::ExecutionState::sync_generation
#[derive(Clone)]
#[repr(C, align(64))]
pub struct QuickTlb {
    slots: [[u64; 2]; QUICK_TLB_ENTRIES],
}

impl QuickTlb {
    pub const TAG_WORD: usize = 0;
    pub const CODE_WORD: usize = 1;

    pub const fn new() -> Self {
        Self {
            slots: [[0; 2]; QUICK_TLB_ENTRIES],
        }
    }

    #[inline]
    pub const fn index(key: u64) -> usize {
        (key & QUICK_TLB_INDEX_MASK) as usize
    }

    #[inline]
    pub fn lookup(&self, key: u64) -> Option<CodePtr> {
        let [tag, code] = self.slots[Self::index(key)];
        if tag != key {
            return None;
        }
        CodePtr::new(code as usize)
    }

    /// Overwrites whatever occupies the slot for `key`.
    #[inline]
    pub fn insert(&mut self, key: u64, code: CodePtr) {
        self.slots[Self::index(key)] = [key, code.addr() as u64];
    }

    pub fn clear(&mut self) {
        self.slots.fill([0; 2]);
    }

    /// Number of non-empty slots.
    pub fn occupied(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot[Self::CODE_WORD] != 0)
            .count()
    }
}

impl Default for QuickTlb {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for QuickTlb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuickTlb")
            .field("entries", &QUICK_TLB_ENTRIES)
            .field("occupied", &self.occupied())
            .finish()
    }
}
