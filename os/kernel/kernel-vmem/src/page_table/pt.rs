//! # Page Table (second level)
//!
//! Every present entry maps exactly one 4 KiB page; there is no further level.

use super::{PageEntry, TableIndex};
use kernel_info::memory::TABLE_ENTRIES;

/// The page table: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PT")]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; TABLE_ENTRIES],
}

impl PageTable {
    /// Create a fully zeroed page table (all entries non-present).
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageEntry::zero(); TABLE_ENTRIES],
        }
    }

    /// Plain load; does not imply any TLB synchronization.
    #[inline]
    #[must_use]
    pub const fn get(&self, i: TableIndex) -> PageEntry {
        self.entries[i.as_usize()]
    }

    /// Caller must handle any required TLB invalidation when changing active mappings.
    #[inline]
    pub const fn set(&mut self, i: TableIndex, e: PageEntry) {
        self.entries[i.as_usize()] = e;
    }

    /// Set every entry to zero.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageEntry::zero());
    }

    /// Number of present entries.
    #[must_use]
    pub fn mapped(&self) -> usize {
        self.entries.iter().filter(|e| e.is_present()).count()
    }
}
