//! # Zone Heap
//!
//! Byte-granular allocation on top of kernel pages. Requests are sorted into
//! four size classes; each class is served from zones of a fixed page count,
//! except large requests, which get a zone of their own.
//!
//! ## Allocation
//! 1. Round the size up to a multiple of 4 if the heap is [`HeapFlags::ALIGNED`].
//! 2. Pick the [`ZoneClass`].
//! 3. Take the first free record that fits from the first zone of that class
//!    that has room; split off the remainder when it exceeds the request by
//!    more than [`ALLOCATION_PADDING`].
//! 4. Otherwise create a new zone and allocate from it.
//!
//! ## Freeing
//! The record is marked free. A zone whose records are all free is returned
//! to the page allocator at once; otherwise enough changes trigger a merge
//! of adjacent free records.
//!
//! The zone list and all zone metadata are only touched under the heap lock.

mod record;
mod zone;

pub use record::{RecordInfo, RecordKind};
pub use zone::ZoneClass;

use crate::pages::{alloc_pages, free_pages};
use kernel_info::memory::PAGE_SIZE;
use kernel_info::status::KernError;
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::SpinLock;
use kernel_vmem::{FrameAlloc, Mmu, Vm, VmError, VmFlags};
use log::{debug, error, info, trace, warn};
use zone::ZonePage;

/// Slack a free record must have beyond the request before it is split.
pub const ALLOCATION_PADDING: u32 = 16;

bitflags::bitflags! {
    /// Behaviour switches of a [`Heap`].
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct HeapFlags: u32 {
        /// Zero memory when it is handed out and when it is freed.
        const SECURE  = 1 << 0;
        /// Round every request up to a multiple of four bytes.
        const ALIGNED = 1 << 1;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("pointer {0} was not allocated from this heap")]
    UnknownPointer(VirtualAddress),
}

impl From<VmError> for HeapError {
    fn from(e: VmError) -> Self {
        match e {
            VmError::OutOfMemory => Self::OutOfMemory,
            VmError::InvalidAddress | VmError::InvalidArgument => Self::InvalidArgument,
        }
    }
}

impl From<HeapError> for KernError {
    fn from(e: HeapError) -> Self {
        match e {
            HeapError::OutOfMemory => Self::NoMemory,
            HeapError::InvalidArgument => Self::InvalidArgument,
            HeapError::UnknownPointer(_) => Self::InvalidAddress,
        }
    }
}

/// Zones of a heap, linked through their header pages.
struct ZoneList {
    head: VirtualAddress,
    count: usize,
}

/// A zone heap in the kernel directory.
pub struct Heap<'v, 'a, M: Mmu, A: FrameAlloc> {
    vm: &'v Vm<'a, M, A>,
    flags: HeapFlags,
    zones: SpinLock<ZoneList>,
}

impl<'v, 'a, M: Mmu, A: FrameAlloc> Heap<'v, 'a, M, A> {
    /// An empty heap; zones are created on first use.
    #[must_use]
    pub const fn new(vm: &'v Vm<'a, M, A>, flags: HeapFlags) -> Self {
        Self {
            vm,
            flags,
            zones: SpinLock::new(ZoneList {
                head: VirtualAddress::zero(),
                count: 0,
            }),
        }
    }

    /// The kernel's generic heap.
    #[must_use]
    pub fn init(vm: &'v Vm<'a, M, A>) -> Self {
        let heap = Self::new(vm, HeapFlags::ALIGNED);
        info!("generic heap ready ({:?})", heap.flags);
        heap
    }

    #[inline]
    #[must_use]
    pub const fn flags(&self) -> HeapFlags {
        self.flags
    }

    /// Allocate `size` bytes.
    ///
    /// # Errors
    /// - [`HeapError::InvalidArgument`]: `size == 0`.
    /// - [`HeapError::OutOfMemory`]: no zone could be created.
    pub fn allocate(&self, size: u32) -> Result<VirtualAddress, HeapError> {
        if size == 0 {
            return Err(HeapError::InvalidArgument);
        }
        let size = if self.flags.contains(HeapFlags::ALIGNED) {
            size.checked_next_multiple_of(4).ok_or(HeapError::InvalidArgument)?
        } else {
            size
        };
        let class = ZoneClass::for_size(size);

        let va = {
            let mut zones = self.zones.lock();
            let reused = if class == ZoneClass::Large {
                None
            } else {
                self.allocate_in_existing(&zones, class, size)
            };
            match reused {
                Some(va) => va,
                None => self.allocate_in_new_zone(&mut zones, class, size)?,
            }
        };

        if self.flags.contains(HeapFlags::SECURE) {
            // Safety: the range was just handed out and is mapped.
            unsafe { self.vm.zero(va, size) };
        }
        trace!("heap allocated {size} bytes at {va}");
        Ok(va)
    }

    /// Free an allocation.
    ///
    /// # Errors
    /// [`HeapError::UnknownPointer`] if `va` is not the start of a live
    /// allocation of this heap.
    pub fn free(&self, va: VirtualAddress) -> Result<(), HeapError> {
        let mut zones = self.zones.lock();
        let mut prev = VirtualAddress::zero();
        let mut at = zones.head;

        while !at.is_null() {
            // Safety: list entries are live zone header pages.
            let zone = unsafe { self.zone(at) };
            if !zone.contains(va) {
                prev = at;
                at = zone.header.next;
                continue;
            }

            let Some(size) = zone.release(va) else {
                break;
            };
            if self.flags.contains(HeapFlags::SECURE) {
                // Safety: the record still lies inside the zone's mapped data pages.
                unsafe { self.vm.zero(va, size) };
            }

            if zone.is_empty() {
                let next = zone.header.next;
                self.unlink(&mut zones, prev, next);
                self.release_zone(at);
            } else if zone.maybe_defragment() {
                trace!("defragmented zone at {at}");
            }
            return Ok(());
        }

        drop(zones);
        error!("heap free of unknown pointer {va}");
        Err(HeapError::UnknownPointer(va))
    }

    /// Merge adjacent free records in every zone, regardless of thresholds.
    ///
    /// Returns the number of merges.
    pub fn defragment(&self) -> u32 {
        let zones = self.zones.lock();
        let mut merged = 0;
        let mut at = zones.head;
        while !at.is_null() {
            // Safety: list entries are live zone header pages.
            let zone = unsafe { self.zone(at) };
            merged += zone.defragment();
            at = zone.header.next;
        }
        merged
    }

    #[must_use]
    pub fn zone_count(&self) -> usize {
        self.zones.lock().count
    }

    #[must_use]
    pub fn zone_count_of(&self, class: ZoneClass) -> usize {
        let mut count = 0;
        self.inspect(|zone| {
            if zone.class() == class {
                count += 1;
            }
        });
        count
    }

    /// Call `f` for every zone, in list order, with the heap locked.
    pub fn inspect(&self, mut f: impl FnMut(&ZoneView<'_>)) {
        let zones = self.zones.lock();
        let mut at = zones.head;
        while !at.is_null() {
            // Safety: list entries are live zone header pages.
            let zone: &ZonePage = unsafe { self.zone(at) };
            f(&ZoneView { base: at, page: zone });
            at = zone.header.next;
        }
    }

    /// # Safety
    /// `base` must be the header page of a live zone, and the caller must
    /// hold the heap lock.
    unsafe fn zone<'z>(&self, base: VirtualAddress) -> &'z mut ZonePage {
        unsafe { self.vm.virt_to_mut(base) }
    }

    fn allocate_in_existing(&self, zones: &ZoneList, class: ZoneClass, size: u32) -> Option<VirtualAddress> {
        let mut at = zones.head;
        while !at.is_null() {
            // Safety: list entries are live zone header pages.
            let zone = unsafe { self.zone(at) };
            if zone.header.class == class
                && zone.can_allocate(size)
                && let Some(va) = zone.allocate(size)
            {
                return Some(va);
            }
            at = zone.header.next;
        }
        None
    }

    fn allocate_in_new_zone(
        &self,
        zones: &mut ZoneList,
        class: ZoneClass,
        size: u32,
    ) -> Result<VirtualAddress, HeapError> {
        let pages = class.data_pages(size).checked_add(1).ok_or(HeapError::OutOfMemory)?;
        let base = alloc_pages(&self.vm.kernel_space(), pages, VmFlags::KERNEL)?;

        // Safety: the header page was just mapped for us; all-zero bytes are a valid `ZonePage`.
        let zone = unsafe {
            self.vm.zero(base, PAGE_SIZE);
            self.zone(base)
        };
        zone.init(class, pages, base);
        let Some(va) = zone.allocate(size) else {
            self.release_zone(base);
            return Err(HeapError::OutOfMemory);
        };

        self.push(zones, base);
        debug!("created {class:?} zone at {base} ({pages} pages)");
        Ok(va)
    }

    fn push(&self, zones: &mut ZoneList, base: VirtualAddress) {
        zones.count += 1;
        if zones.head.is_null() {
            zones.head = base;
            return;
        }
        let mut at = zones.head;
        loop {
            // Safety: list entries are live zone header pages.
            let zone = unsafe { self.zone(at) };
            if zone.header.next.is_null() {
                zone.header.next = base;
                return;
            }
            at = zone.header.next;
        }
    }

    fn unlink(&self, zones: &mut ZoneList, prev: VirtualAddress, next: VirtualAddress) {
        zones.count -= 1;
        if prev.is_null() {
            zones.head = next;
        } else {
            // Safety: `prev` is the live zone in front of the one being removed.
            unsafe { self.zone(prev) }.header.next = next;
        }
    }

    fn release_zone(&self, base: VirtualAddress) {
        // Safety: `base` is a zone that is no longer linked.
        let (class, pages) = {
            let zone = unsafe { self.zone(base) };
            (zone.header.class, zone.header.pages)
        };
        match free_pages(&self.vm.kernel_space(), base, pages) {
            Ok(()) => debug!("destroyed {class:?} zone at {base}"),
            Err(e) => warn!("failed to release {class:?} zone at {base}: {e}"),
        }
    }
}

impl<M: Mmu, A: FrameAlloc> Drop for Heap<'_, '_, M, A> {
    fn drop(&mut self) {
        let list = self.zones.get_mut();
        let mut at = core::mem::replace(&mut list.head, VirtualAddress::zero());
        list.count = 0;
        while !at.is_null() {
            // Safety: the list was detached above; every entry is still a live zone.
            let next = unsafe { self.zone(at) }.header.next;
            self.release_zone(at);
            at = next;
        }
    }
}

/// Read-only view of one zone, handed out by [`Heap::inspect`].
pub struct ZoneView<'z> {
    base: VirtualAddress,
    page: &'z ZonePage,
}

impl ZoneView<'_> {
    /// Address of the zone's header page.
    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    #[must_use]
    pub const fn class(&self) -> ZoneClass {
        self.page.header.class
    }

    /// Pages of the zone, header page included.
    #[must_use]
    pub const fn pages(&self) -> u32 {
        self.page.header.pages
    }

    /// First byte of the data pages.
    #[must_use]
    pub const fn begin(&self) -> VirtualAddress {
        self.page.header.begin
    }

    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        self.page.header.end
    }

    #[must_use]
    pub const fn free_size(&self) -> u32 {
        self.page.header.free_size
    }

    /// Records that are free or used.
    #[must_use]
    pub const fn allocations(&self) -> u32 {
        self.page.header.allocations
    }

    #[must_use]
    pub const fn free_allocations(&self) -> u32 {
        self.page.header.free_allocations
    }

    #[must_use]
    pub fn max_allocations(&self) -> usize {
        self.page.max_allocations()
    }

    /// Changes since the last defragmentation.
    #[must_use]
    pub const fn changes(&self) -> u32 {
        self.page.header.changes
    }

    /// Every free or used record, in table order.
    pub fn records(&self) -> impl Iterator<Item = RecordInfo> + '_ {
        (0..self.max_allocations())
            .filter_map(|i| self.page.record(i))
            .filter(|r| r.kind != RecordKind::Unused)
    }
}

/// Allocate from `heap`.
///
/// # Errors
/// As [`Heap::allocate`].
#[inline]
pub fn halloc<M: Mmu, A: FrameAlloc>(heap: &Heap<'_, '_, M, A>, size: u32) -> Result<VirtualAddress, HeapError> {
    heap.allocate(size)
}

/// Free into `heap`.
///
/// # Panics
/// If `va` was not allocated from `heap`: the kernel cannot continue with
/// a corrupted view of its own memory.
#[inline]
pub fn hfree<M: Mmu, A: FrameAlloc>(heap: &Heap<'_, '_, M, A>, va: VirtualAddress) {
    if let Err(e) = heap.free(va) {
        panic!("hfree: {e}");
    }
}
