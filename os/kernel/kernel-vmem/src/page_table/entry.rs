use crate::VmFlags;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalPage, Size4K};

/// Raw bit layout of a 32-bit page-directory or page-table entry.
///
/// | Bits   | Name  | Meaning |
/// |--------|-------|---------|
/// | 0      | `P`   | Present |
/// | 1      | `RW`  | Writable |
/// | 2      | `US`  | User-mode accessible |
/// | 3      | `PWT` | Write-through caching |
/// | 4      | `PCD` | Cache disabled |
/// | 5      | `A`   | Accessed (set by the CPU) |
/// | 6      | `D`   | Dirty (table entries only) |
/// | 7      | `PS`  | 4 MiB page (directory entries); never set by this crate |
/// | 8      | `G`   | Global |
/// | 9..11   | avail | Free for OS use |
/// | 12..31  | frame | Physical frame number |
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    pub present: bool,
    pub writable: bool,
    pub user_access: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub large_page: bool,
    pub global_translation: bool,
    #[bits(3)]
    pub os_available: u8,
    #[bits(20)]
    frame_number: u32,
}

/// One entry of a [`PageDirectory`](super::PageDirectory) or [`PageTable`](super::PageTable).
///
/// An all-zero entry is "unmapped"; unmapping always writes zero, never just
/// clears the present bit.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct PageEntry(PageEntryBits);

impl PageEntry {
    /// Create a zero (non-present) entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(PageEntryBits::new())
    }

    /// Entry pointing at `frame` with the low flag bits taken from `flags`.
    #[inline]
    #[must_use]
    pub const fn new(frame: PhysicalPage<Size4K>, flags: VmFlags) -> Self {
        Self(PageEntryBits::from_bits(frame.base().as_u32() | flags.bits()))
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0.present()
    }

    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_index(self.0.frame_number())
    }

    /// The flag bits this crate manages (everything in [`VmFlags::all`]).
    #[inline]
    #[must_use]
    pub const fn flags(self) -> VmFlags {
        VmFlags::from_bits_truncate(self.0.into_bits())
    }

    /// Same frame, different flags.
    #[inline]
    #[must_use]
    pub const fn with_flags(self, flags: VmFlags) -> Self {
        Self::new(self.frame(), flags)
    }

    /// Expose the underlying bitfield for inspection.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> PageEntryBits {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0.into_bits()
    }

    /// No validation is performed.
    #[inline]
    #[must_use]
    pub const fn from_raw(v: u32) -> Self {
        Self(PageEntryBits::from_bits(v))
    }
}

impl core::fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_present() {
            write!(f, "PageEntry({} {:?})", self.frame().base(), self.flags())
        } else {
            f.write_str("PageEntry(-)")
        }
    }
}
