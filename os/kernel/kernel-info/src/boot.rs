//! # Kernel Boot Information
//!
//! What the loader tells the kernel about physical memory. Everything in here
//! is read once by the physical allocator and the virtual memory bootstrap;
//! none of it is consulted after the kernel directory is active.

use core::ops::Range;
use kernel_memory_addresses::PhysicalAddress;

const FRAME_SHIFT: u32 = crate::memory::PAGE_SHIFT;
const FRAME_SIZE: u64 = crate::memory::PAGE_SIZE as u64;

/// Physical memory above this limit is not addressable by 32-bit paging.
const ADDRESSABLE_END: u64 = 1 << 32;

/// Information the kernel needs from the loader before paging is enabled.
#[derive(Debug, Clone, Copy)]
pub struct BootInfo<'a> {
    /// Physical memory regions as reported by the firmware.
    pub memory_map: &'a [MemoryRegion],

    /// The kernel image, from the first loaded section to the end of `.bss`.
    pub kernel_image: PhysicalRegion,

    /// The boot stack the kernel is currently running on.
    pub kernel_stack: PhysicalRegion,

    /// The loader's own information block (and the memory map it points to).
    pub info_block: PhysicalRegion,

    /// Modules loaded next to the kernel.
    pub modules: &'a [BootModule],
}

/// One entry of the firmware memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Physical base address; may lie above 4 GiB.
    pub base: u64,
    /// Length in **bytes**.
    pub length: u64,
    /// What the firmware says the memory is used for.
    pub kind: MemoryRegionKind,
}

/// Memory map entry type tag, as found in the firmware tables.
///
/// Unknown values are kept verbatim and treated as reserved.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct MemoryRegionKind(pub u32);

impl MemoryRegionKind {
    /// Usable RAM.
    pub const AVAILABLE: Self = Self(1);
    /// Reserved by the firmware or devices.
    pub const RESERVED: Self = Self(2);
    /// ACPI tables; reclaimable once they have been parsed.
    pub const ACPI_RECLAIMABLE: Self = Self(3);
    /// ACPI non-volatile storage.
    pub const ACPI_NVS: Self = Self(4);
    /// Defective RAM.
    pub const BAD: Self = Self(5);

    #[inline]
    #[must_use]
    pub const fn is_available(self) -> bool {
        self.0 == Self::AVAILABLE.0
    }
}

impl core::fmt::Debug for MemoryRegionKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match *self {
            Self::AVAILABLE => f.write_str("Available"),
            Self::RESERVED => f.write_str("Reserved"),
            Self::ACPI_RECLAIMABLE => f.write_str("AcpiReclaimable"),
            Self::ACPI_NVS => f.write_str("AcpiNvs"),
            Self::BAD => f.write_str("Bad"),
            Self(other) => write!(f, "Unknown({other})"),
        }
    }
}

impl MemoryRegion {
    /// An available region of `length` bytes at `base`.
    #[must_use]
    pub const fn available(base: u64, length: u64) -> Self {
        Self {
            base,
            length,
            kind: MemoryRegionKind::AVAILABLE,
        }
    }

    /// The frames that lie completely inside this region and below 4 GiB.
    ///
    /// Partial frames at either end are excluded; an empty range is returned
    /// for regions that lie entirely above the addressable limit.
    #[must_use]
    pub fn whole_frames(&self) -> Range<u32> {
        let end = self.base.saturating_add(self.length).min(ADDRESSABLE_END);
        let first = self.base.div_ceil(FRAME_SIZE);
        let last = end / FRAME_SIZE;
        if first >= last {
            return 0..0;
        }
        frame_number(first)..frame_number(last)
    }
}

/// A payload handed over by the loader, together with its name string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootModule {
    /// The module's bytes.
    pub payload: PhysicalRegion,
    /// The NUL-terminated module name.
    pub name: PhysicalRegion,
}

/// A byte range of physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PhysicalRegion {
    pub start: PhysicalAddress,
    pub length: u32,
}

impl PhysicalRegion {
    #[must_use]
    pub const fn new(start: PhysicalAddress, length: u32) -> Self {
        Self { start, length }
    }

    /// The region spanning `start..end`.
    #[must_use]
    pub const fn from_bounds(start: PhysicalAddress, end: PhysicalAddress) -> Self {
        Self {
            start,
            length: end.as_u32().saturating_sub(start.as_u32()),
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Every frame the region touches, rounding outward to frame boundaries.
    #[must_use]
    pub fn frames(&self) -> Range<u32> {
        if self.is_empty() {
            return 0..0;
        }
        let start = u64::from(self.start.as_u32());
        let end = start + u64::from(self.length);
        frame_number(start / FRAME_SIZE)..frame_number(end.div_ceil(FRAME_SIZE))
    }
}

/// Narrows a frame number below 4 GiB / 4 KiB, which always fits 32 bits.
#[allow(clippy::cast_possible_truncation)]
const fn frame_number(frame: u64) -> u32 {
    debug_assert!(frame <= (ADDRESSABLE_END >> FRAME_SHIFT));
    frame as u32
}
