//! # Kernel Configuration and Boot Interface
//!
//! This crate defines the memory layout constants, the boot handoff structure
//! and the kernel-wide result codes shared by the memory-management crates.
//! It is the single source of truth for where things live in the 32-bit
//! address space, so that the physical allocator, the page-table code and
//! the heap never disagree about reserved regions.
//!
//! ## Architecture
//!
//! ### Boot Information ([`boot`])
//! The loader-to-kernel handoff:
//! * **Memory Map**: `(base, length, kind)` regions reported by the loader
//! * **Kernel Image and Stack**: physical extents that must never be handed out
//! * **Modules**: payloads (and their names) loaded next to the kernel
//!
//! ### Memory Layout ([`memory`])
//! Compile-time constants of the two-level paging layout, validated by a
//! `const` assertion block.
//!
//! ### Result Codes ([`status`])
//! [`KernError`](status::KernError) for Rust callers and the C-compatible
//! [`KernStatus`](status::KernStatus) for the call gate.
//!
//! ## Virtual Memory Layout
//!
//! ```text
//! Virtual Address Space Layout (32-bit):
//!
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │ Null page (never mapped)        │
//! 0x0000_1000 ├─────────────────────────────────┤ VM_LOWER_LIMIT
//!             │ Identity mapped boot regions,   │
//!             │ kernel and user allocations     │
//! 0x3FBF_E000 ├─────────────────────────────────┤ SCRATCH_DIRECTORY_PAGE
//!             │ Temporary mapping slots         │
//! 0x3FC0_0000 ├─────────────────────────────────┤ KERNEL_TABLE_WINDOW
//!             │ Self-map window (page tables)   │
//! 0x3FCF_F000 │ ... directory itself            │ KERNEL_DIRECTORY_WINDOW
//! 0x4000_0000 ├─────────────────────────────────┤
//!             │ Allocations                     │
//! 0xFF00_0000 ├─────────────────────────────────┤ SHARED_SLOTS
//!             │ Kernel range shared by every    │
//!             │ address space                   │
//! 0xFFFF_F000 └─────────────────────────────────┘ VM_UPPER_LIMIT
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use kernel_info::memory::{PAGE_SIZE, TABLE_ENTRIES};
//! use kernel_info::status::{KernError, KernStatus};
//!
//! assert_eq!(PAGE_SIZE as usize / TABLE_ENTRIES, 4);
//! assert_eq!(KernStatus::from(Err::<(), _>(KernError::NoMemory)), KernStatus::NoMemory);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
pub mod status;
