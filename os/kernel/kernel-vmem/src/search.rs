//! # Free-range search
//!
//! Linear scan for `pages` consecutive non-present entries inside a window.
//! An absent page table is a whole run of free pages and is never
//! materialized; the self-map slot is never handed out.

use crate::VmError;
use crate::page_table::{DirectoryIndex, PageTable, TableIndex, join_indices};
use crate::tables::TableAccess;
use core::ops::Range;
use kernel_info::memory::{SELF_MAP_SLOT, TABLE_ENTRIES};
use kernel_memory_addresses::{Size4K, VirtualAddress, VirtualPage};

#[allow(clippy::cast_possible_truncation)]
const ENTRIES: u32 = TABLE_ENTRIES as u32;

/// The run of free pages found so far.
#[derive(Default)]
struct Run {
    start: u32,
    len: u32,
}

impl Run {
    const fn reset(&mut self) {
        self.len = 0;
    }

    /// Add `count` free pages starting at page number `at`; returns the new length.
    const fn extend(&mut self, at: u32, count: u32) -> u32 {
        if self.len == 0 {
            self.start = at;
        }
        self.len += count;
        self.len
    }
}

/// Find `pages` free pages inside `window`.
///
/// With `other` given, a page only counts as free when it is free in both
/// directories; the two are scanned in lock-step.
///
/// # Errors
/// [`VmError::OutOfMemory`] when no such run exists inside the window.
pub(crate) fn find_free_range(
    tables: &mut dyn TableAccess,
    mut other: Option<&mut dyn TableAccess>,
    pages: u32,
    window: Range<VirtualAddress>,
) -> Result<VirtualPage<Size4K>, VmError> {
    debug_assert!(pages > 0);

    let first = window.start.page::<Size4K>().index();
    let end = window.end.page::<Size4K>().index();

    let mut run = Run::default();
    let mut page = first;
    while page < end {
        let slot = DirectoryIndex::new((page / ENTRIES) as usize);
        let span_end = ((page / ENTRIES + 1) * ENTRIES).min(end);

        if slot.as_usize() == SELF_MAP_SLOT {
            run.reset();
            page = span_end;
            continue;
        }

        let mine = tables.table_if_present(slot);
        let theirs = match other.as_deref_mut() {
            Some(t) => t.table_if_present(slot),
            None => None,
        };

        if mine.is_none() && theirs.is_none() {
            if run.extend(page, span_end - page) >= pages {
                return Ok(found(run.start));
            }
        } else {
            for p in page..span_end {
                let index = TableIndex::new((p % ENTRIES) as usize);
                if is_used(mine, index) || is_used(theirs, index) {
                    run.reset();
                } else if run.extend(p, 1) >= pages {
                    return Ok(found(run.start));
                }
            }
        }

        page = span_end;
    }

    log::trace!(
        "no {pages} free pages in {}..{}",
        window.start,
        window.end
    );
    Err(VmError::OutOfMemory)
}

#[inline]
fn is_used(table: Option<&PageTable>, index: TableIndex) -> bool {
    table.is_some_and(|t| t.get(index).is_present())
}

#[inline]
fn found(page: u32) -> VirtualPage<Size4K> {
    let slot = DirectoryIndex::new((page / ENTRIES) as usize);
    let index = TableIndex::new((page % ENTRIES) as usize);
    join_indices(slot, index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VmFlags;
    use crate::page_table::{PageDirectory, PageEntry};
    use alloc::boxed::Box;
    use alloc::collections::BTreeMap;
    use kernel_memory_addresses::{PhysicalPage, Size4K};

    /// Directory and tables as plain host memory.
    struct HostTables {
        directory: Box<PageDirectory>,
        tables: BTreeMap<usize, Box<PageTable>>,
    }

    impl HostTables {
        fn new() -> Self {
            Self {
                directory: Box::new(PageDirectory::zeroed()),
                tables: BTreeMap::new(),
            }
        }

        fn map(&mut self, va: u32) {
            let (slot, index) = crate::page_table::split_indices(VirtualAddress::new(va));
            let frame = PhysicalPage::<Size4K>::from_index(0x100 + slot.as_usize() as u32);
            self.directory.set(slot, PageEntry::new(frame, VmFlags::KERNEL));
            self.tables
                .entry(slot.as_usize())
                .or_insert_with(|| Box::new(PageTable::zeroed()))
                .set(index, PageEntry::new(PhysicalPage::from_index(1), VmFlags::KERNEL));
        }
    }

    impl TableAccess for HostTables {
        fn directory(&mut self) -> &mut PageDirectory {
            &mut self.directory
        }

        fn table(&mut self, slot: DirectoryIndex) -> &mut PageTable {
            self.tables.get_mut(&slot.as_usize()).expect("present table")
        }

        fn mapping_changed(&mut self, _page: VirtualPage<Size4K>) {}
    }

    fn window(lower: u32, upper: u32) -> Range<VirtualAddress> {
        VirtualAddress::new(lower)..VirtualAddress::new(upper)
    }

    #[test]
    fn empty_directory_starts_at_the_lower_bound() {
        let mut t = HostTables::new();
        let page = find_free_range(&mut t, None, 3, window(0x1000, 0xFFFF_F000)).unwrap();
        assert_eq!(page.base().as_u32(), 0x1000);
    }

    #[test]
    fn skips_used_pages() {
        let mut t = HostTables::new();
        t.map(0x1000);
        t.map(0x3000);
        let page = find_free_range(&mut t, None, 2, window(0x1000, 0x10_0000)).unwrap();
        assert_eq!(page.base().as_u32(), 0x4000);

        let single = find_free_range(&mut t, None, 1, window(0x1000, 0x10_0000)).unwrap();
        assert_eq!(single.base().as_u32(), 0x2000);
    }

    #[test]
    fn runs_cross_table_boundaries() {
        let mut t = HostTables::new();
        // Slot 0 only has its last page free; slot 1 has no table at all.
        for va in (0x1000..0x3F_F000).step_by(0x1000) {
            t.map(va);
        }
        let page = find_free_range(&mut t, None, 5, window(0x1000, 0x80_0000)).unwrap();
        assert_eq!(page.base().as_u32(), 0x3F_F000);
    }

    #[test]
    fn respects_the_upper_bound() {
        let mut t = HostTables::new();
        assert_eq!(
            find_free_range(&mut t, None, 4, window(0x1000, 0x4000)),
            Err(VmError::OutOfMemory)
        );
        assert!(find_free_range(&mut t, None, 3, window(0x1000, 0x4000)).is_ok());
    }

    #[test]
    fn never_hands_out_the_self_map_slot() {
        let mut t = HostTables::new();
        let lower = 0x3FBF_F000;
        let page = find_free_range(&mut t, None, 2, window(lower, 0x4100_0000)).unwrap();
        assert_eq!(page.base().as_u32(), 0x4000_0000);
    }

    #[test]
    fn two_sided_needs_both_free() {
        let mut user = HostTables::new();
        let mut kernel = HostTables::new();
        user.map(0x1000);
        kernel.map(0x2000);
        kernel.map(0x4000);

        let page = find_free_range(&mut user, Some(&mut kernel), 2, window(0x1000, 0x10_0000)).unwrap();
        assert_eq!(page.base().as_u32(), 0x5000);
    }
}
