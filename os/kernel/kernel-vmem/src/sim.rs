//! # Software MMU
//!
//! A few megabytes of "physical" memory plus a model of CR0, CR3 and the
//! TLB, so the paging code can run in ordinary host tests.
//!
//! The model is deliberately strict where real hardware is:
//! - With paging on, every access walks the active directory; a missing
//!   entry panics with a page fault.
//! - Translations are cached until [`Mmu::invalidate`] or a CR3 reload, so
//!   a forgotten invalidation shows up as a stale read.

use crate::page_table::{PageEntry, split_indices};
use crate::{FrameAlloc, Mmu};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ops::Range;
use kernel_info::boot::{BootInfo, BootModule, MemoryRegion, PhysicalRegion};
use kernel_info::memory::{PAGE_SIZE, REAL_MODE_END};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage};
use kernel_registers::cr0::Cr0;
use kernel_registers::cr3::Cr3;
use kernel_sync::SpinLock;

#[repr(C, align(4096))]
struct Frame([u8; PAGE_SIZE as usize]);

struct SimState {
    cr0: Cr0,
    cr3: Cr3,
    /// Cached translations, virtual page number to frame number.
    tlb: BTreeMap<u32, u32>,
}

/// Simulated physical memory and paging hardware.
pub struct SimMemory {
    frames: Box<[UnsafeCell<Frame>]>,
    state: SpinLock<SimState>,
}

// Safety: the `Mmu` accessors are `unsafe`; their callers guarantee that no
// two live references alias, exactly as with real memory.
unsafe impl Sync for SimMemory {}

impl SimMemory {
    /// `frames` zeroed frames of physical memory, paging off.
    #[must_use]
    pub fn new(frames: u32) -> Self {
        let frames = (0..frames)
            .map(|_| UnsafeCell::new(Frame([0; PAGE_SIZE as usize])))
            .collect();
        Self {
            frames,
            state: SpinLock::new(SimState {
                cr0: Cr0::new().with_pe_protection_enable(true),
                cr3: Cr3::new(),
                tlb: BTreeMap::new(),
            }),
        }
    }

    /// Size of physical memory in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.frames.len() as u64 * u64::from(PAGE_SIZE)
    }

    #[must_use]
    pub fn cr3(&self) -> Cr3 {
        self.state.lock().cr3
    }

    #[must_use]
    pub fn paging_enabled(&self) -> bool {
        self.state.lock().cr0.pg_paging()
    }

    /// Number of cached translations.
    #[must_use]
    pub fn tlb_len(&self) -> usize {
        self.state.lock().tlb.len()
    }

    /// Translate `va` the way the next access would, without faulting.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let mut state = self.state.lock();
        if !state.cr0.pg_paging() {
            return Some(PhysicalAddress::new(va.as_u32()));
        }
        let page = va.page::<Size4K>();
        let frame = match state.tlb.get(&page.index()) {
            Some(&frame) => PhysicalPage::<Size4K>::from_index(frame),
            None => {
                let frame = self.walk(state.cr3.directory(), page)?;
                state.tlb.insert(page.index(), frame.index());
                frame
            }
        };
        Some(frame.join(va.offset::<Size4K>()))
    }

    /// Walk the tables under `directory` for `page`, bypassing the TLB.
    #[must_use]
    pub fn walk(&self, directory: PhysicalPage<Size4K>, page: VirtualPage<Size4K>) -> Option<PhysicalPage<Size4K>> {
        let (slot, index) = split_indices(page.base());
        let link = self.entry(directory, slot.as_usize());
        if !link.is_present() {
            return None;
        }
        let leaf = self.entry(link.frame(), index.as_usize());
        leaf.is_present().then_some(leaf.frame())
    }

    fn entry(&self, table: PhysicalPage<Size4K>, index: usize) -> PageEntry {
        let frame = self.frame_ptr(table.base());
        // Safety: entries are plain `u32`s inside a frame we own.
        let raw = unsafe { frame.cast::<u32>().add(index).read() };
        PageEntry::from_raw(raw)
    }

    fn frame_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        let frame = pa.page::<Size4K>().index() as usize;
        let cell = self
            .frames
            .get(frame)
            .unwrap_or_else(|| panic!("physical access beyond simulated memory: {pa}"));
        cell.get().cast::<u8>()
    }

    fn pointer<T>(&self, pa: PhysicalAddress) -> *mut T {
        let offset = pa.offset::<Size4K>().as_u32() as usize;
        debug_assert!(offset + size_of::<T>() <= PAGE_SIZE as usize, "access straddles a frame");
        debug_assert!(offset.is_multiple_of(align_of::<T>()), "misaligned access at {pa}");
        // Safety: the offset stays inside the frame.
        unsafe { self.frame_ptr(pa).add(offset).cast::<T>() }
    }
}

impl Mmu for SimMemory {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        // Safety: the caller guarantees the type and the absence of aliases.
        unsafe { &mut *self.pointer(pa) }
    }

    unsafe fn virt_to_mut<'a, T>(&self, va: VirtualAddress) -> &'a mut T {
        let Some(pa) = self.translate(va) else {
            panic!("page fault at {va}");
        };
        // Safety: forwarded from the caller.
        unsafe { &mut *self.pointer(pa) }
    }

    fn invalidate(&self, page: VirtualPage<Size4K>) {
        self.state.lock().tlb.remove(&page.index());
    }

    unsafe fn activate(&self, directory: PhysicalPage<Size4K>) {
        let mut state = self.state.lock();
        state.cr3 = Cr3::from_directory(directory);
        state.tlb.clear();
    }

    unsafe fn enable_paging(&self) {
        let mut state = self.state.lock();
        assert!(state.cr3.directory_address().as_u32() != 0, "paging enabled without a directory");
        state.cr0.set_pg_paging(true);
        state.tlb.clear();
    }
}

struct FrameState {
    used: Vec<bool>,
    outstanding: u32,
    limit: u32,
}

/// First-fit frame allocator over [`SimMemory`], for the paging tests.
pub struct SimFrames {
    state: SpinLock<FrameState>,
}

impl SimFrames {
    /// Manage `frames` frames; everything in `reserved` is never handed out.
    #[must_use]
    pub fn new(frames: u32, reserved: &[Range<u32>]) -> Self {
        let mut used = vec![false; frames as usize];
        used[0] = true;
        for range in reserved {
            for frame in range.clone() {
                if let Some(slot) = used.get_mut(frame as usize) {
                    *slot = true;
                }
            }
        }
        Self {
            state: SpinLock::new(FrameState {
                used,
                outstanding: 0,
                limit: u32::MAX,
            }),
        }
    }

    /// Frames handed out and not yet returned.
    #[must_use]
    pub fn outstanding(&self) -> u32 {
        self.state.lock().outstanding
    }

    /// Fail every allocation that would push [`outstanding`](Self::outstanding) past `limit`.
    pub fn set_limit(&self, limit: u32) {
        self.state.lock().limit = limit;
    }

    #[must_use]
    pub fn is_used(&self, frame: PhysicalPage<Size4K>) -> bool {
        self.state.lock().used.get(frame.index() as usize).copied().unwrap_or(true)
    }
}

impl FrameAlloc for SimFrames {
    fn alloc_frames(&self, pages: u32) -> Option<PhysicalAddress> {
        let mut state = self.state.lock();
        if pages == 0 || state.outstanding.saturating_add(pages) > state.limit {
            return None;
        }
        let n = pages as usize;
        let start = state.used.windows(n).position(|w| w.iter().all(|used| !used))?;
        state.used[start..start + n].fill(true);
        state.outstanding += pages;
        let frame = u32::try_from(start).ok()?;
        Some(PhysicalPage::<Size4K>::from_index(frame).base())
    }

    fn free_frames(&self, base: PhysicalAddress, pages: u32) {
        let mut state = self.state.lock();
        let start = base.page::<Size4K>().index() as usize;
        for slot in &mut state.used[start..start + pages as usize] {
            assert!(*slot, "double free of a simulated frame");
            *slot = false;
        }
        state.outstanding -= pages;
    }
}

/// An owned description of a small machine, lendable as [`BootInfo`].
///
/// Layout: boot information at 0x9000, the kernel image at 1 MiB followed
/// by its stack, one module after that, RAM up to the end of [`SimMemory`].
pub struct SimBoot {
    pub memory_map: Vec<MemoryRegion>,
    pub kernel_image: PhysicalRegion,
    pub kernel_stack: PhysicalRegion,
    pub info_block: PhysicalRegion,
    pub modules: Vec<BootModule>,
}

impl SimBoot {
    #[must_use]
    pub fn new(memory: &SimMemory) -> Self {
        let region = |start: u32, length: u32| PhysicalRegion::new(PhysicalAddress::new(start), length);
        Self {
            memory_map: vec![
                MemoryRegion::available(0, 0x9_F000),
                MemoryRegion::available(u64::from(REAL_MODE_END), memory.size() - u64::from(REAL_MODE_END)),
            ],
            kernel_image: region(REAL_MODE_END, 0x8000),
            kernel_stack: region(REAL_MODE_END + 0x8000, 0x4000),
            info_block: region(0x9000, 0x200),
            modules: vec![BootModule {
                payload: region(REAL_MODE_END + 0xC000, 0x1800),
                name: region(REAL_MODE_END + 0xD800, 0x10),
            }],
        }
    }

    #[must_use]
    pub fn info(&self) -> BootInfo<'_> {
        BootInfo {
            memory_map: &self.memory_map,
            kernel_image: self.kernel_image,
            kernel_stack: self.kernel_stack,
            info_block: self.info_block,
            modules: &self.modules,
        }
    }

    /// Frames the loader has already used: the first megabyte up to the end
    /// of the module name.
    #[must_use]
    pub fn reserved(&self) -> Range<u32> {
        let end = self
            .modules
            .iter()
            .map(|m| m.name.frames().end)
            .chain([self.kernel_stack.frames().end])
            .max()
            .unwrap_or(0);
        0..end
    }
}
