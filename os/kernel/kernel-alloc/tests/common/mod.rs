#![allow(dead_code)]

use kernel_alloc::frame_alloc::BitmapFrameAllocator;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::Vm;
use kernel_vmem::sim::{SimBoot, SimMemory};

/// 16 MiB of simulated RAM.
pub const FRAMES: u32 = 4096;

pub type TestVm<'a> = Vm<'a, SimMemory, BitmapFrameAllocator>;

/// A simulated machine with the bitmap allocator managing its RAM.
pub struct Machine {
    pub memory: SimMemory,
    pub boot: SimBoot,
    pub frames: Box<BitmapFrameAllocator>,
}

impl Machine {
    pub fn new() -> Self {
        let memory = SimMemory::new(FRAMES);
        let boot = SimBoot::new(&memory);
        let frames = Box::new(BitmapFrameAllocator::new());
        frames.init(&boot.info()).expect("frame allocator");
        Self { memory, boot, frames }
    }

    pub fn boot(&self) -> TestVm<'_> {
        unsafe { Vm::init(&self.boot.info(), &*self.frames, &self.memory) }.expect("bootstrap")
    }

    pub fn free_frames(&self) -> u32 {
        self.frames.free_frames()
    }
}

pub fn va(v: u32) -> VirtualAddress {
    VirtualAddress::new(v)
}

pub fn read(vm: &TestVm<'_>, at: VirtualAddress, len: usize) -> Vec<u8> {
    let mut out = vec![0; len];
    unsafe { vm.read_bytes(at, &mut out) };
    out
}
