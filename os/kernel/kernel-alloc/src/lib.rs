//! # Kernel Memory Allocation
//!
//! Everything above the page tables: the physical frame allocator, the
//! hardware [`Mmu`](kernel_vmem::Mmu), page-granular allocation, the zone heap
//! and DMA buffers.
//!
//! ## Layers
//!
//! ```text
//! ┌──────────────────────────┐  ┌──────────────────────────┐
//! │ heap: halloc / hfree     │  │ dma: DmaBuffer           │
//! └────────────┬─────────────┘  └────────────┬─────────────┘
//!              │                             │
//! ┌────────────▼─────────────────────────────▼─────────────┐
//! │ pages: alloc_pages / free_pages, kalloc / kfree        │
//! └────────────┬─────────────────────────────┬─────────────┘
//!              │                             │
//! ┌────────────▼─────────────┐  ┌────────────▼─────────────┐
//! │ kernel-vmem: Vm,         │  │ frame_alloc:             │
//! │ AddressSpace             │──▶ BitmapFrameAllocator     │
//! └──────────────────────────┘  └──────────────────────────┘
//! ```
//!
//! ## Bring-up
//!
//! ```rust,ignore
//! static FRAMES: BitmapFrameAllocator = BitmapFrameAllocator::new();
//! static MMU: X86Mmu = X86Mmu;
//!
//! FRAMES.init(&boot)?;
//! let vm = unsafe { Vm::init(&boot, &FRAMES, &MMU) }?;
//! let heap = Heap::init(&vm);
//! let va = halloc(&heap, 64)?;
//! hfree(&heap, va);
//! ```
//!
//! ## Lock order
//!
//! Heap lock, then directory locks (own before kernel), then the frame
//! allocator lock. No layer calls upwards.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod dma;
pub mod frame_alloc;
pub mod heap;
pub mod pages;
#[cfg(target_arch = "x86")]
pub mod phys_mapper;
