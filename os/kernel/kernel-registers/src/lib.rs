//! # Typed i386 Registers
//!
//! The control registers the paging code touches: [`Cr0`](cr0::Cr0) for the
//! paging enable bit, [`Cr3`](cr3::Cr3) for the active page directory, and
//! [`tlb`] for single-page invalidation.
//!
//! The register layouts are plain data and usable everywhere; the privileged
//! instructions are only compiled with the `asm` feature on `target_arch = "x86"`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "cr0")]
pub mod cr0;

#[cfg(feature = "cr3")]
pub mod cr3;

pub mod tlb;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn store_unsafe(self);
}
