//! Whole-machine scenarios on the software MMU.

use crate::page_table::{DirectoryIndex, PageDirectory};
use crate::sim::{SimBoot, SimFrames, SimMemory};
use crate::{FrameAlloc, FrameRun, Mmu, Vm, VmError, VmFlags};
use kernel_info::memory::{KERNEL_DIRECTORY_WINDOW, KERNEL_TABLE_WINDOW, SCRATCH_DIRECTORY_PAGE, SCRATCH_TABLE_PAGE};
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};

const FRAMES: u32 = 4096;

struct Machine {
    memory: SimMemory,
    boot: SimBoot,
    frames: SimFrames,
}

impl Machine {
    fn new() -> Self {
        let memory = SimMemory::new(FRAMES);
        let boot = SimBoot::new(&memory);
        let frames = SimFrames::new(FRAMES, &[boot.reserved()]);
        Self { memory, boot, frames }
    }

    fn boot(&self) -> Vm<'_, SimMemory, SimFrames> {
        unsafe { Vm::init(&self.boot.info(), &self.frames, &self.memory) }.expect("bootstrap")
    }

    fn frame(&self) -> PhysicalAddress {
        self.frames.alloc_frames(1).expect("frame")
    }
}

fn va(v: u32) -> VirtualAddress {
    VirtualAddress::new(v)
}

#[test]
fn bootstrap_identity_maps_what_the_kernel_uses() {
    let m = Machine::new();
    let vm = m.boot();
    let kernel = vm.kernel_space();

    assert!(m.memory.paging_enabled());
    assert_eq!(m.memory.cr3().directory(), vm.kernel_directory().root());

    for addr in [0x10_0123, 0x10_8000, 0x10_C000, 0x10_D800, 0xA_0000, 0xB_F000, 0x9000] {
        assert_eq!(kernel.resolve_address(va(addr)), Ok(PhysicalAddress::new(addr)), "{addr:#x}");
    }
    assert_eq!(kernel.resolve_address(va(0)), Err(VmError::InvalidAddress));
    assert_eq!(kernel.resolve_address(va(0x20_0000)), Err(VmError::InvalidAddress));
}

#[test]
fn self_map_window_shows_the_directory() {
    let m = Machine::new();
    let vm = m.boot();
    let root = vm.kernel_directory().root();

    assert_eq!(m.memory.translate(va(KERNEL_DIRECTORY_WINDOW)), Some(root.base()));
    let table0 = m.memory.translate(va(KERNEL_TABLE_WINDOW)).expect("table 0 is mapped");
    assert!(m.memory.walk(root, va(0x10_0000).page()).is_some());
    assert_ne!(table0, root.base());
}

#[test]
fn scratch_pages_rest_on_the_guard_frame() {
    let m = Machine::new();
    let vm = m.boot();
    let root = vm.kernel_directory().root();

    let dir = vm.create_directory().expect("directory");
    vm.space(&dir).map_page(m.frame(), va(0x40_0000), VmFlags::USERLAND).expect("map");

    for page in [SCRATCH_DIRECTORY_PAGE, SCRATCH_TABLE_PAGE] {
        assert_eq!(m.memory.walk(root, va(page).page()), Some(vm.guard_frame));
    }
}

#[test]
fn map_resolve_and_access() {
    let m = Machine::new();
    let vm = m.boot();
    let kernel = vm.kernel_space();
    let frame = m.frame();

    kernel.map_page(frame, va(0x4000_0000), VmFlags::KERNEL).expect("map");
    assert_eq!(kernel.resolve_address(va(0x4000_0123)), Ok(frame + 0x123));

    unsafe { vm.write_bytes(va(0x4000_0FFC), b"page") };
    let raw: &mut [u8; 4096] = unsafe { m.memory.phys_to_mut(frame) };
    assert_eq!(&raw[0xFFC..], b"page");
}

#[test]
fn remapping_is_visible_immediately() {
    let m = Machine::new();
    let vm = m.boot();
    let kernel = vm.kernel_space();
    let (first, second) = (m.frame(), m.frame());
    *unsafe { m.memory.phys_to_mut::<u32>(second) } = 0xC0FF_EE00;

    kernel.map_page(first, va(0x5000_0000), VmFlags::KERNEL).expect("map");
    assert_eq!(*unsafe { vm.virt_to_mut::<u32>(va(0x5000_0000)) }, 0);

    kernel.map_page(second, va(0x5000_0000), VmFlags::KERNEL).expect("remap");
    assert_eq!(*unsafe { vm.virt_to_mut::<u32>(va(0x5000_0000)) }, 0xC0FF_EE00);

    kernel.free(va(0x5000_0000), 1).expect("unmap");
    assert_eq!(m.memory.translate(va(0x5000_0000)), None);
}

#[test]
fn changed_kernel_pages_leave_the_tlb() {
    let m = Machine::new();
    let vm = m.boot();
    let kernel = vm.kernel_space();
    let (first, second) = (m.frame(), m.frame());

    kernel.map_page(first, va(0x5000_0000), VmFlags::KERNEL).expect("map");
    assert_eq!(m.memory.translate(va(0x5000_0000)), Some(first));
    let cached = m.memory.tlb_len();

    kernel.map_page(second, va(0x5000_0000), VmFlags::KERNEL).expect("remap");
    assert_eq!(m.memory.tlb_len(), cached - 1);
    assert_eq!(m.memory.translate(va(0x5000_0000)), Some(second));
    assert_eq!(m.memory.tlb_len(), cached);

    kernel.free(va(0x5000_0000), 1).expect("unmap");
    assert_eq!(m.memory.tlb_len(), cached - 1);
}

#[test]
fn null_mapping_clears_the_entry() {
    let m = Machine::new();
    let vm = m.boot();
    let kernel = vm.kernel_space();

    kernel.map_page(m.frame(), va(0x6000_0000), VmFlags::KERNEL).expect("map");
    kernel
        .map_page(PhysicalAddress::zero(), va(0x6000_0000), VmFlags::empty())
        .expect("clear");
    assert_eq!(kernel.resolve_address(va(0x6000_0000)), Err(VmError::InvalidAddress));
}

#[test]
fn free_never_allocates_tables() {
    let m = Machine::new();
    let vm = m.boot();
    let kernel = vm.kernel_space();
    let outstanding = m.frames.outstanding();
    let tables = kernel.page_tables();

    kernel.free(va(0x8000_0000), 2048).expect("free");
    kernel
        .map_page_range(PhysicalAddress::zero(), va(0x9000_0000), 4, VmFlags::empty())
        .expect("clear");

    assert_eq!(m.frames.outstanding(), outstanding);
    assert_eq!(kernel.page_tables(), tables);
}

#[test]
fn self_map_window_is_off_limits() {
    let m = Machine::new();
    let vm = m.boot();
    let kernel = vm.kernel_space();
    let frame = m.frame();

    assert_eq!(
        kernel.map_page(frame, va(KERNEL_TABLE_WINDOW), VmFlags::KERNEL),
        Err(VmError::InvalidAddress)
    );
    assert_eq!(
        kernel.map_page_range(frame, va(KERNEL_TABLE_WINDOW - 0x1000), 2, VmFlags::KERNEL),
        Err(VmError::InvalidAddress)
    );
    assert_eq!(kernel.free(va(KERNEL_DIRECTORY_WINDOW), 1), Err(VmError::InvalidAddress));
}

#[test]
fn scratch_pages_are_off_limits_in_the_kernel_directory() {
    let m = Machine::new();
    let vm = m.boot();
    let kernel = vm.kernel_space();
    let frame = m.frame();

    for page in [SCRATCH_DIRECTORY_PAGE, SCRATCH_TABLE_PAGE] {
        assert_eq!(kernel.map_page(frame, va(page), VmFlags::KERNEL), Err(VmError::InvalidAddress));
        assert_eq!(kernel.free(va(page), 1), Err(VmError::InvalidAddress));
    }
    assert_eq!(
        kernel.map_page_range(frame, va(SCRATCH_DIRECTORY_PAGE - 0x1000), 2, VmFlags::KERNEL),
        Err(VmError::InvalidAddress)
    );

    // Other directories are free to use the same addresses.
    let dir = vm.create_directory().expect("directory");
    let space = vm.space(&dir);
    space.map_page(frame, va(SCRATCH_TABLE_PAGE), VmFlags::USERLAND).expect("foreign map");
    assert_eq!(space.resolve_address(va(SCRATCH_TABLE_PAGE)), Ok(frame));
    let root = vm.kernel_directory().root();
    assert_eq!(m.memory.walk(root, va(SCRATCH_TABLE_PAGE).page()), Some(vm.guard_frame));
}

#[test]
fn invalid_requests_are_rejected() {
    let m = Machine::new();
    let vm = m.boot();
    let kernel = vm.kernel_space();
    let frame = m.frame();

    assert_eq!(kernel.map_page(frame, va(0), VmFlags::KERNEL), Err(VmError::InvalidAddress));
    assert_eq!(kernel.map_page(frame, va(0x4000_0010), VmFlags::KERNEL), Err(VmError::InvalidAddress));
    assert_eq!(kernel.map_page(frame + 8, va(0x4000_0000), VmFlags::KERNEL), Err(VmError::InvalidAddress));
    assert_eq!(
        kernel.map_page(frame, va(0x4000_0000), VmFlags::from_bits_retain(0x100)),
        Err(VmError::InvalidArgument)
    );
    assert_eq!(kernel.map_page_range(frame, va(0x4000_0000), 0, VmFlags::KERNEL), Err(VmError::InvalidArgument));
    assert_eq!(kernel.alloc(frame, 0, VmFlags::KERNEL), Err(VmError::InvalidArgument));
    assert_eq!(kernel.free(va(0x4000_0000), 0), Err(VmError::InvalidArgument));
    assert_eq!(
        kernel.alloc_limit(frame, 1, va(0), va(0x10_0000), VmFlags::KERNEL),
        Err(VmError::InvalidArgument)
    );
    assert_eq!(
        kernel.alloc_limit(frame, 1, va(0x1000), va(0x1_0800), VmFlags::KERNEL),
        Err(VmError::InvalidAddress)
    );
}

#[test]
fn alloc_takes_the_lowest_free_run() {
    let m = Machine::new();
    let vm = m.boot();
    let kernel = vm.kernel_space();

    // Pages 1..=8 are free, page 9 holds the boot information.
    assert_eq!(kernel.alloc(m.frame(), 2, VmFlags::KERNEL), Ok(va(0x1000)));
    let run = m.frames.alloc_frames(8).expect("frames");
    assert_eq!(kernel.alloc(run, 8, VmFlags::KERNEL), Ok(va(0xA000)));
    assert_eq!(kernel.resolve_address(va(0xA000 + 7 * 0x1000)), Ok(run + 7 * 0x1000));
}

#[test]
fn alloc_limit_stays_inside_the_window() {
    let m = Machine::new();
    let vm = m.boot();
    let kernel = vm.kernel_space();
    let frame = m.frame();

    assert_eq!(
        kernel.alloc_limit(frame, 3, va(0x5000_0000), va(0x5000_2000), VmFlags::KERNEL),
        Err(VmError::OutOfMemory)
    );
    assert_eq!(
        kernel.alloc_limit(frame, 2, va(0x5000_0000), va(0x5000_2000), VmFlags::KERNEL),
        Ok(va(0x5000_0000))
    );
    assert_eq!(
        kernel.alloc_limit(frame, 1, va(0x5000_0000), va(0x5000_2000), VmFlags::KERNEL),
        Err(VmError::OutOfMemory)
    );
}

#[test]
fn failed_range_mapping_leaves_nothing_behind() {
    let m = Machine::new();
    let vm = m.boot();
    let kernel = vm.kernel_space();
    let run = m.frames.alloc_frames(2).expect("frames");

    // Straddles two absent tables; only the first one can be allocated.
    m.frames.set_limit(m.frames.outstanding() + 1);
    assert_eq!(
        kernel.map_page_range(run, va(0x803F_F000), 2, VmFlags::KERNEL),
        Err(VmError::OutOfMemory)
    );
    assert_eq!(kernel.resolve_address(va(0x803F_F000)), Err(VmError::InvalidAddress));
    assert_eq!(kernel.resolve_address(va(0x8040_0000)), Err(VmError::InvalidAddress));
}

#[test]
fn scattered_runs_are_mapped_back_to_back() {
    let m = Machine::new();
    let vm = m.boot();
    let kernel = vm.kernel_space();
    let a = m.frames.alloc_frames(2).expect("frames");
    let _gap = m.frame();
    let b = m.frame();

    let at = kernel
        .map_scattered(&[FrameRun::new(a, 2), FrameRun::new(b, 1)], VmFlags::KERNEL)
        .expect("map");
    assert_eq!(kernel.resolve_address(at), Ok(a));
    assert_eq!(kernel.resolve_address(at + 0x1000), Ok(a + 0x1000));
    assert_eq!(kernel.resolve_address(at + 0x2000), Ok(b));
    assert_eq!(kernel.map_scattered(&[], VmFlags::KERNEL), Err(VmError::InvalidArgument));
}

#[test]
fn foreign_directory_is_edited_through_scratch_slots() {
    let m = Machine::new();
    let vm = m.boot();
    let dir = vm.create_directory().expect("directory");
    let space = vm.space(&dir);
    let frame = m.frame();

    space.map_page(frame, va(0x1000), VmFlags::USERLAND).expect("map");
    assert_eq!(space.resolve_address(va(0x1234)), Ok(frame + 0x234));
    assert_eq!(vm.kernel_space().resolve_address(va(0x1000)), Err(VmError::InvalidAddress));
    assert_eq!(m.memory.walk(dir.root(), va(0x1000).page()), Some(frame.page::<Size4K>()));

    // The table link is user accessible because the mapping is.
    let pd: &mut PageDirectory = unsafe { m.memory.phys_to_mut(dir.root().base()) };
    assert!(pd.get(DirectoryIndex::new(0)).flags().contains(VmFlags::USER));
}

#[test]
fn shared_range_is_visible_everywhere() {
    let m = Machine::new();
    let vm = m.boot();
    let dir = vm.create_directory().expect("directory");
    let frame = m.frame();

    vm.kernel_space().map_page(frame, va(0xFF80_0000), VmFlags::KERNEL).expect("map");
    assert_eq!(vm.space(&dir).resolve_address(va(0xFF80_0000)), Ok(frame));
}

#[test]
fn two_sided_alloc_needs_both_sides_free() {
    let m = Machine::new();
    let vm = m.boot();
    let kernel = vm.kernel_space();
    let dir = vm.create_directory().expect("directory");
    let space = vm.space(&dir);

    kernel.map_page(m.frame(), va(0x1000), VmFlags::KERNEL).expect("map");
    let run = m.frames.alloc_frames(2).expect("frames");

    let at = space
        .alloc_two_sided_limit(run, 2, va(0x1000), va(0x10_0000), VmFlags::KERNEL)
        .expect("two-sided");
    assert_eq!(at, va(0x2000));
    assert_eq!(space.resolve_address(at + 0x1000), Ok(run + 0x1000));
    assert_eq!(kernel.resolve_address(at + 0x1000), Ok(run + 0x1000));

    assert_eq!(
        kernel.alloc_two_sided_limit(run, 1, va(0x1000), va(0x10_0000), VmFlags::KERNEL),
        Err(VmError::InvalidArgument)
    );
}

#[test]
fn destroy_returns_directory_and_tables() {
    let m = Machine::new();
    let vm = m.boot();
    let before = m.frames.outstanding();

    let dir = vm.create_directory().expect("directory");
    let space = vm.space(&dir);
    let frame = m.frame();
    for base in [0x40_0000, 0x80_0000, 0x4000_0000] {
        space.map_page(frame, va(base), VmFlags::USERLAND).expect("map");
    }
    assert_eq!(space.page_tables(), 3 + 4);

    vm.destroy_directory(dir);
    m.frames.free_frames(frame, 1);
    assert_eq!(m.frames.outstanding(), before);
}

#[test]
fn create_directory_reports_exhaustion() {
    let m = Machine::new();
    let vm = m.boot();
    m.frames.set_limit(m.frames.outstanding());
    assert_eq!(vm.create_directory().map(|d| d.root()), Err(VmError::OutOfMemory));
}

#[test]
fn bootstrap_reports_exhaustion() {
    let m = Machine::new();
    m.frames.set_limit(3);
    let result = unsafe { Vm::init(&m.boot.info(), &m.frames, &m.memory) };
    assert_eq!(result.map(|_| ()), Err(VmError::OutOfMemory));
    assert!(!m.memory.paging_enabled());
}

#[test]
fn concurrent_allocations_never_overlap() {
    let m = Machine::new();
    let vm = m.boot();
    let frame = m.frame();

    let mut found: Vec<u32> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(|| {
                    (0..8)
                        .map(|_| vm.kernel_space().alloc(frame, 4, VmFlags::KERNEL).expect("alloc").as_u32())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers.into_iter().flat_map(|w| w.join().expect("worker")).collect()
    });

    found.sort_unstable();
    assert!(found.windows(2).all(|w| w[1] - w[0] >= 4 * 0x1000));
}
