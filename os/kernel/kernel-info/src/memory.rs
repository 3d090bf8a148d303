//! # Memory Layout

use core::ops::Range;

/// Size of one page and one physical frame.
pub const PAGE_SIZE: u32 = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Number of low address bits covered by one directory entry (4 MiB).
pub const DIRECTORY_SHIFT: u32 = 22;

/// Entries per page directory and per page table.
pub const TABLE_ENTRIES: usize = 1024;

/// Lowest virtual address handed out by a search. Page 0 stays unmapped.
pub const VM_LOWER_LIMIT: u32 = 0x1000;

/// Exclusive upper bound for virtual searches and physical allocation windows.
pub const VM_UPPER_LIMIT: u32 = 0xFFFF_F000;

/// End of the real-mode megabyte, which is never handed out by the frame allocator.
pub const REAL_MODE_END: u32 = 0x10_0000;

/// Legacy VGA memory, identity mapped during bootstrap.
pub const VIDEO_MEMORY: Range<u32> = 0xA_0000..0xC_0000;

/// Directory slot that maps the directory onto itself.
pub const SELF_MAP_SLOT: usize = 0xFF;

/// Virtual window through which the page tables of the active directory are visible.
///
/// Table `i` lives at `KERNEL_TABLE_WINDOW + i * PAGE_SIZE`.
pub const KERNEL_TABLE_WINDOW: u32 = (SELF_MAP_SLOT as u32) << DIRECTORY_SHIFT;

/// Virtual address of the active directory itself (table `SELF_MAP_SLOT` of the window).
pub const KERNEL_DIRECTORY_WINDOW: u32 = KERNEL_TABLE_WINDOW + SELF_MAP_SLOT as u32 * PAGE_SIZE;

/// Temporary mapping slot used to edit a foreign directory.
pub const SCRATCH_DIRECTORY_PAGE: u32 = 0x3FBF_E000;

/// Temporary mapping slot used to edit a foreign page table.
pub const SCRATCH_TABLE_PAGE: u32 = 0x3FBF_F000;

/// Directory slots of the kernel range that every address space shares.
pub const SHARED_SLOTS: Range<usize> = 1020..1024;

/// Words in the physical allocator bitmap; one bit per frame of the 4 GiB space.
pub const PM_BITMAP_WORDS: usize = 32768;

/// Number of frames tracked by the physical allocator.
pub const PM_FRAMES: usize = PM_BITMAP_WORDS * 32;

const _: () = {
    assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
    assert!(DIRECTORY_SHIFT == PAGE_SHIFT + 10);
    assert!(TABLE_ENTRIES == 1 << (DIRECTORY_SHIFT - PAGE_SHIFT));
    assert!(VM_LOWER_LIMIT.is_multiple_of(PAGE_SIZE));
    assert!(VM_UPPER_LIMIT.is_multiple_of(PAGE_SIZE));
    assert!(VM_LOWER_LIMIT < VM_UPPER_LIMIT);
    assert!(VIDEO_MEMORY.end <= REAL_MODE_END);
    assert!(KERNEL_TABLE_WINDOW == 0x3FC0_0000);
    assert!(KERNEL_DIRECTORY_WINDOW == 0x3FCF_F000);

    // Both scratch pages live in the slot right below the self-map window.
    assert!(SCRATCH_DIRECTORY_PAGE >> DIRECTORY_SHIFT == SELF_MAP_SLOT as u32 - 1);
    assert!(SCRATCH_TABLE_PAGE >> DIRECTORY_SHIFT == SELF_MAP_SLOT as u32 - 1);
    assert!(SCRATCH_TABLE_PAGE == SCRATCH_DIRECTORY_PAGE + PAGE_SIZE);

    assert!(SHARED_SLOTS.start > SELF_MAP_SLOT);
    assert!(SHARED_SLOTS.end == TABLE_ENTRIES);
    assert!(PM_FRAMES == 1 << (32 - PAGE_SHIFT));
};
