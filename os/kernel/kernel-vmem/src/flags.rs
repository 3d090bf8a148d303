//! Mapping flags.

bitflags::bitflags! {
    /// Flags accepted by the mapping operations.
    ///
    /// These are the low bits of a 32-bit page-table entry. Anything outside
    /// [`VmFlags::all`] is rejected as an invalid argument.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct VmFlags: u32 {
        /// Page is present in physical memory.
        ///
        /// Accessing a non-present page raises a page fault.
        const PRESENT       = 1 << 0;

        /// Page is writable.
        ///
        /// If cleared, the page is read-only for user mode (and for the
        /// kernel too once CR0.WP is set).
        const WRITABLE      = 1 << 1;

        /// Page is accessible from user mode (CPL=3).
        const USER          = 1 << 2;

        /// Write-through caching, typically for memory-mapped I/O.
        const WRITE_THROUGH = 1 << 3;

        /// Caching disabled for this page.
        const CACHE_DISABLE = 1 << 4;

        /// Set by the processor on first access.
        const ACCESSED      = 1 << 5;

        /// Present and writable, supervisor only.
        const KERNEL   = Self::PRESENT.bits() | Self::WRITABLE.bits();

        /// Present, writable and reachable from user mode.
        const USERLAND = Self::PRESENT.bits() | Self::WRITABLE.bits() | Self::USER.bits();
    }
}

impl VmFlags {
    /// Whether `raw` only uses bits this crate knows about.
    #[inline]
    #[must_use]
    pub const fn is_valid_raw(raw: u32) -> bool {
        raw & !Self::all().bits() == 0
    }

    /// Flags for a directory entry that points at a table holding a mapping
    /// with these flags: always present and writable, `USER` only when needed.
    #[inline]
    #[must_use]
    pub const fn directory_entry_for(self) -> Self {
        Self::KERNEL.union(self.intersection(Self::USER))
    }
}
