//! # DMA buffers
//!
//! Device-visible memory in the kernel directory. A buffer is either one
//! physically contiguous run of frames, or up to [`MAX_DMA_FRAGMENTS`] runs
//! mapped back to back so the CPU sees a single virtual range. Drivers program
//! the device with [`DmaBuffer::fragments`] or [`DmaBuffer::physical_address`].
//!
//! ```text
//!  virtual   | run 0 (4) | run 1 (2) | run 2 (2) |
//!  physical    0x0040_0000  0x0090_0000  0x0012_0000
//! ```

use kernel_info::memory::PAGE_SIZE;
use kernel_info::status::KernError;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::{FrameAlloc, FrameRun, Mmu, Vm, VmError, VmFlags};
use log::debug;

/// Most physical runs one buffer may consist of.
pub const MAX_DMA_FRAGMENTS: usize = 16;

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct DmaFlags: u32 {
        /// The whole buffer must be one physical run.
        const CONTIGUOUS = 1 << 0;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DmaError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("buffer would need more than {MAX_DMA_FRAGMENTS} fragments")]
    TooFragmented,
    #[error(transparent)]
    Vm(#[from] VmError),
}

impl From<DmaError> for KernError {
    fn from(e: DmaError) -> Self {
        match e {
            DmaError::InvalidArgument => Self::InvalidArgument,
            DmaError::OutOfMemory | DmaError::TooFragmented => Self::NoMemory,
            DmaError::Vm(e) => e.into(),
        }
    }
}

/// A mapped DMA buffer. Give it back with [`DmaBuffer::release`].
#[derive(Debug)]
#[must_use]
pub struct DmaBuffer {
    base: VirtualAddress,
    pages: u32,
    fragments: [FrameRun; MAX_DMA_FRAGMENTS],
    count: usize,
}

impl DmaBuffer {
    /// Allocate and map `pages` pages for a device.
    ///
    /// Without [`DmaFlags::CONTIGUOUS`] the largest runs available are
    /// gathered, halving the attempted run length whenever an allocation fails.
    ///
    /// # Errors
    /// - [`DmaError::InvalidArgument`]: `pages == 0`.
    /// - [`DmaError::OutOfMemory`]: not even a single frame (or, contiguous,
    ///   no run of `pages` frames) is available.
    /// - [`DmaError::TooFragmented`]: free memory is too scattered.
    /// - [`DmaError::Vm`]: no virtual range for the mapping.
    ///
    /// Frames taken before a failure are returned.
    pub fn request<M: Mmu, A: FrameAlloc>(vm: &Vm<'_, M, A>, pages: u32, flags: DmaFlags) -> Result<Self, DmaError> {
        if pages == 0 {
            return Err(DmaError::InvalidArgument);
        }

        let mut buffer = Self {
            base: VirtualAddress::zero(),
            pages,
            fragments: [FrameRun::new(PhysicalAddress::zero(), 0); MAX_DMA_FRAGMENTS],
            count: 0,
        };

        let gathered = if flags.contains(DmaFlags::CONTIGUOUS) || pages == 1 {
            buffer.gather_contiguous(vm.frames())
        } else {
            buffer.gather_fragments(vm.frames())
        };
        if let Err(e) = gathered {
            buffer.free_fragments(vm.frames());
            return Err(e);
        }

        match vm.kernel_space().map_scattered(buffer.fragments(), VmFlags::KERNEL) {
            Ok(base) => buffer.base = base,
            Err(e) => {
                buffer.free_fragments(vm.frames());
                return Err(e.into());
            }
        }

        debug!(
            "dma buffer at {} ({} pages in {} fragments)",
            buffer.base, buffer.pages, buffer.count
        );
        Ok(buffer)
    }

    fn gather_contiguous<A: FrameAlloc>(&mut self, frames: &A) -> Result<(), DmaError> {
        let base = frames.alloc_frames(self.pages).ok_or(DmaError::OutOfMemory)?;
        self.push(FrameRun::new(base, self.pages));
        Ok(())
    }

    fn gather_fragments<A: FrameAlloc>(&mut self, frames: &A) -> Result<(), DmaError> {
        let mut left = self.pages;
        let mut attempt = self.pages;
        while left > 0 {
            if self.count == MAX_DMA_FRAGMENTS {
                return Err(DmaError::TooFragmented);
            }
            if let Some(base) = frames.alloc_frames(attempt) {
                self.push(FrameRun::new(base, attempt));
                left -= attempt;
                attempt = attempt.min(left);
            } else if attempt == 1 {
                return Err(DmaError::OutOfMemory);
            } else {
                attempt /= 2;
            }
        }
        Ok(())
    }

    fn push(&mut self, run: FrameRun) {
        self.fragments[self.count] = run;
        self.count += 1;
    }

    fn free_fragments<A: FrameAlloc>(&mut self, frames: &A) {
        for run in self.fragments() {
            frames.free_frames(run.base, run.pages);
        }
        self.count = 0;
    }

    /// The physical runs, in virtual order.
    #[must_use]
    pub fn fragments(&self) -> &[FrameRun] {
        &self.fragments[..self.count]
    }

    #[inline]
    #[must_use]
    pub const fn virtual_address(&self) -> VirtualAddress {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn pages(&self) -> u32 {
        self.pages
    }

    /// Physical address of the byte at `offset` into the buffer.
    #[must_use]
    pub fn physical_address(&self, offset: u32) -> Option<PhysicalAddress> {
        let mut skip = offset;
        for run in self.fragments() {
            if skip < run.len() {
                return run.base.checked_add(skip);
            }
            skip -= run.len();
        }
        None
    }

    /// Unmap the buffer and return its frames.
    ///
    /// # Errors
    /// [`DmaError::Vm`] if the mapping could not be removed; the frames are
    /// kept in that case.
    pub fn release<M: Mmu, A: FrameAlloc>(mut self, vm: &Vm<'_, M, A>) -> Result<(), DmaError> {
        vm.kernel_space().free(self.base, self.pages)?;
        self.free_fragments(vm.frames());
        debug!("released dma buffer at {}", self.base);
        Ok(())
    }

    /// Size in bytes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> u32 {
        self.pages * PAGE_SIZE
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.pages == 0
    }
}
