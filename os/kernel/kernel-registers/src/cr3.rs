#[cfg(all(feature = "asm", target_arch = "x86"))]
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// CR3: Page-Directory Base Register (32-bit paging).
///
/// Holds the physical base of the active page directory plus the cache
/// controls used for directory walks.
#[bitfield(u32)]
pub struct Cr3 {
    #[bits(3)]
    pub reserved0: u8,

    /// Bit 3: PWT, write-through caching of the directory.
    pub pwt: bool,

    /// Bit 4: PCD, cache disable for the directory.
    pub pcd: bool,

    #[bits(7)]
    pub reserved1: u8,

    /// Bits 12..31: physical frame number of the page directory.
    #[bits(20)]
    directory_frame: u32,
}

impl Cr3 {
    /// CR3 value that activates the directory stored in `directory`.
    #[must_use]
    pub const fn from_directory(directory: PhysicalPage<Size4K>) -> Self {
        Self::new().with_directory_frame(directory.index())
    }

    /// The physical page holding the active directory.
    #[must_use]
    pub const fn directory(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_index(self.directory_frame())
    }

    /// The physical base address of the active directory.
    #[must_use]
    pub const fn directory_address(&self) -> PhysicalAddress {
        self.directory().base()
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let mut cr3: u32;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_round_trip() {
        let dir = PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(0x0012_3000));
        let cr3 = Cr3::from_directory(dir).with_pcd(true);
        assert_eq!(cr3.into_bits(), 0x0012_3010);
        assert_eq!(cr3.directory(), dir);
        assert_eq!(cr3.directory_address().as_u32(), 0x0012_3000);
    }
}
