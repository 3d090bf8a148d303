//! # Zones
//!
//! A zone is a run of kernel pages. The first page holds a [`ZonePage`]: the
//! zone's bookkeeping and its record table. The remaining pages hold the
//! data the records describe.
//!
//! ```text
//!  ┌────────────┬──────────────────────────────────────────┐
//!  │ ZonePage   │ data                                     │
//!  │ header     │ ┌──────┬──────┬────────────────┬───────┐ │
//!  │ records ───┼▶│ used │ free │ used           │ free  │ │
//!  │            │ └──────┴──────┴────────────────┴───────┘ │
//!  └────────────┴──────────────────────────────────────────┘
//!   zone base     begin                                  end
//! ```

use super::ALLOCATION_PADDING;
use super::record::{
    GENERIC_RECORDS, GenericRecord, Record, RecordInfo, RecordKind, Records, TINY_RECORDS, TinyRecord,
};
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{VirtualAddress, page_count};

/// Size class of a zone.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ZoneClass {
    /// Up to 64 bytes.
    Tiny = 0,
    /// Up to 256 bytes.
    Small = 1,
    /// Up to 2048 bytes.
    Medium = 2,
    /// Anything larger; one zone per allocation.
    Large = 3,
}

impl ZoneClass {
    #[must_use]
    pub const fn for_size(size: u32) -> Self {
        match size {
            0..=64 => Self::Tiny,
            65..=256 => Self::Small,
            257..=2048 => Self::Medium,
            _ => Self::Large,
        }
    }

    /// Data pages of a new zone serving `size` bytes, not counting the header page.
    #[must_use]
    pub const fn data_pages(self, size: u32) -> u32 {
        match self {
            Self::Tiny => 1,
            Self::Small => 5,
            Self::Medium => 20,
            #[allow(clippy::cast_possible_truncation)]
            Self::Large => page_count(size as usize) as u32,
        }
    }

    /// Changes after which a zone of this class tries to merge free records.
    #[must_use]
    pub const fn defragment_threshold(self) -> u32 {
        match self {
            Self::Tiny => 100,
            _ => 20,
        }
    }
}

#[repr(C)]
pub(crate) struct ZoneHeader {
    /// Next zone of the heap; null ends the list.
    pub(crate) next: VirtualAddress,
    pub(crate) class: ZoneClass,
    /// Pages of the whole zone, header page included.
    pub(crate) pages: u32,
    pub(crate) begin: VirtualAddress,
    pub(crate) end: VirtualAddress,
    pub(crate) free_size: u32,
    /// Records that are not `Unused`.
    pub(crate) allocations: u32,
    pub(crate) free_allocations: u32,
    pub(crate) changes: u32,
}

/// The header page of a zone.
///
/// All-zero bytes are a valid (empty tiny) value, so a zeroed page may be
/// viewed as a `ZonePage` before [`init`](Self::init) runs.
#[repr(C, align(4096))]
pub(crate) struct ZonePage {
    pub(crate) header: ZoneHeader,
    records: Records,
}

const _: () = assert!(size_of::<ZonePage>() == PAGE_SIZE as usize);

/// Run `$body` with `$t` bound to a [`Table`] over the zone's records.
macro_rules! with_table {
    ($zone:expr, |$t:ident| $body:expr) => {
        match &mut $zone.records {
            Records::Tiny(records) => {
                let mut $t = Table::new(&mut $zone.header, records);
                $body
            }
            Records::Generic(records) => {
                let mut $t = Table::new(&mut $zone.header, records);
                $body
            }
        }
    };
}

impl ZonePage {
    /// Lay out a fresh zone of `pages` pages whose header page is at `base`.
    pub(crate) fn init(&mut self, class: ZoneClass, pages: u32, base: VirtualAddress) {
        let free_size = (pages - 1) * PAGE_SIZE;
        self.header = ZoneHeader {
            next: VirtualAddress::zero(),
            class,
            pages,
            begin: base + PAGE_SIZE,
            end: base + pages * PAGE_SIZE,
            free_size,
            allocations: 0,
            free_allocations: 0,
            changes: 0,
        };
        self.records = match class {
            ZoneClass::Tiny => Records::Tiny([TinyRecord::unused(); TINY_RECORDS]),
            _ => Records::Generic([GenericRecord::unused(); GENERIC_RECORDS]),
        };

        with_table!(self, |t| t.carve(free_size));
    }

    #[inline]
    pub(crate) fn contains(&self, va: VirtualAddress) -> bool {
        self.header.begin <= va && va < self.header.end
    }

    #[inline]
    pub(crate) const fn is_empty(&self) -> bool {
        self.header.allocations == self.header.free_allocations
    }

    pub(crate) fn max_allocations(&self) -> usize {
        match &self.records {
            Records::Tiny(r) => r.len(),
            Records::Generic(r) => r.len(),
        }
    }

    pub(crate) fn can_allocate(&self, size: u32) -> bool {
        self.header.free_size >= size && (self.header.allocations as usize) < self.max_allocations()
    }

    /// Take `size` bytes from the first free record that fits.
    pub(crate) fn allocate(&mut self, size: u32) -> Option<VirtualAddress> {
        let offset = with_table!(self, |t| t.allocate(size))?;
        Some(self.header.begin + offset)
    }

    /// Mark the used record starting at `va` free; returns its size.
    pub(crate) fn release(&mut self, va: VirtualAddress) -> Option<u32> {
        let offset = va.checked_offset_from(self.header.begin)?;
        with_table!(self, |t| t.release(offset))
    }

    /// Merge free neighbours once enough changes have piled up.
    pub(crate) fn maybe_defragment(&mut self) -> bool {
        let header = &self.header;
        if header.changes >= header.class.defragment_threshold() && header.free_allocations >= 2 {
            self.defragment();
            true
        } else {
            false
        }
    }

    /// Merge every free record with the free record right after it.
    pub(crate) fn defragment(&mut self) -> u32 {
        with_table!(self, |t| t.merge_free())
    }

    pub(crate) fn record(&self, index: usize) -> Option<RecordInfo> {
        match &self.records {
            Records::Tiny(r) => r.get(index).map(RecordInfo::of),
            Records::Generic(r) => r.get(index).map(RecordInfo::of),
        }
    }
}

/// The record algorithms, written once for both layouts.
struct Table<'z, R: Record> {
    header: &'z mut ZoneHeader,
    records: &'z mut [R],
}

impl<'z, R: Record> Table<'z, R> {
    fn new(header: &'z mut ZoneHeader, records: &'z mut [R]) -> Self {
        Self { header, records }
    }

    /// Cover `free_size` bytes with free records no larger than `R::MAX_SIZE`.
    fn carve(&mut self, free_size: u32) {
        let mut offset = 0;
        for record in self.records.iter_mut() {
            if offset == free_size {
                break;
            }
            let size = (free_size - offset).min(R::MAX_SIZE);
            *record = R::new(RecordKind::Free, size, offset);
            offset += size;
            self.header.allocations += 1;
            self.header.free_allocations += 1;
        }
    }

    fn position(&self, f: impl Fn(&R) -> bool) -> Option<usize> {
        self.records.iter().position(f)
    }

    fn allocate(&mut self, size: u32) -> Option<u32> {
        let index = self.position(|r| r.is(RecordKind::Free) && r.size() >= size)?;
        let record = self.records[index];
        let required = size + ALLOCATION_PADDING;

        let mut taken = record.size();
        if record.size() > required
            && let Some(spare) = self.position(|r| r.is(RecordKind::Unused))
        {
            self.records[spare] = R::new(RecordKind::Free, record.size() - required, record.offset() + required);
            taken = required;
            self.header.allocations += 1;
            self.header.free_allocations += 1;
        }

        self.records[index] = R::new(RecordKind::Used, taken, record.offset());
        self.header.free_allocations -= 1;
        self.header.free_size -= taken;
        Some(record.offset())
    }

    fn release(&mut self, offset: u32) -> Option<u32> {
        let index = self.position(|r| r.is(RecordKind::Used) && r.offset() == offset)?;
        let record = self.records[index];
        self.records[index] = R::new(RecordKind::Free, record.size(), record.offset());
        self.header.free_size += record.size();
        self.header.free_allocations += 1;
        self.header.changes += 1;
        Some(record.size())
    }

    fn merge_free(&mut self) -> u32 {
        let mut merged = 0;
        for i in 0..self.records.len() {
            while self.records[i].is(RecordKind::Free) {
                let current = self.records[i];
                let end = current.offset() + current.size();
                let Some(j) = self.position(|r| r.is(RecordKind::Free) && r.offset() == end) else {
                    break;
                };
                let next = self.records[j];
                if u64::from(current.size()) + u64::from(next.size()) > u64::from(R::MAX_SIZE) {
                    break;
                }

                self.records[i] = R::new(RecordKind::Free, current.size() + next.size(), current.offset());
                self.records[j] = R::unused();
                self.header.allocations -= 1;
                self.header.free_allocations -= 1;
                merged += 1;
            }
        }
        self.header.changes = 0;
        merged
    }
}
