//! # Page Directory (first level)
//!
//! Each present entry points at a [`PageTable`](super::PageTable) covering 4 MiB.
//! Slot [`SELF_MAP_SLOT`] points back at the directory itself, which makes
//! every page table of the *active* directory visible at a fixed window.

use super::{DirectoryIndex, PageEntry};
use crate::VmFlags;
use kernel_info::memory::{SELF_MAP_SLOT, SHARED_SLOTS, TABLE_ENTRIES};
use kernel_memory_addresses::{PhysicalPage, Size4K};

/// The page directory: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PD")]
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PageEntry; TABLE_ENTRIES],
}

impl PageDirectory {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageEntry::zero(); TABLE_ENTRIES],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: DirectoryIndex) -> PageEntry {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: DirectoryIndex, e: PageEntry) {
        self.entries[i.as_usize()] = e;
    }

    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageEntry::zero());
    }

    /// Point the self-map slot at `own`, the frame holding this directory.
    #[inline]
    pub const fn install_self_map(&mut self, own: PhysicalPage<Size4K>) {
        self.set(DirectoryIndex::new(SELF_MAP_SLOT), PageEntry::new(own, VmFlags::KERNEL));
    }

    /// The entries of the range shared by every address space.
    #[must_use]
    pub fn shared(&self) -> &[PageEntry] {
        &self.entries[SHARED_SLOTS]
    }

    /// Copy the shared range from `entries` (as returned by [`shared`](Self::shared)).
    pub fn link_shared(&mut self, entries: &[PageEntry]) {
        self.entries[SHARED_SLOTS].copy_from_slice(entries);
    }

    /// Present entries owned by this directory alone, i.e. neither the
    /// self-map nor the shared range.
    pub fn private_tables(&self) -> impl Iterator<Item = PageEntry> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(slot, e)| *slot != SELF_MAP_SLOT && !SHARED_SLOTS.contains(slot) && e.is_present())
            .map(|(_, e)| *e)
    }
}
