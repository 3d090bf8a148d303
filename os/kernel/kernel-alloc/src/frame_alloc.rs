//! # Physical Frame Allocator
//!
//! One bit per 4 KiB frame of the 32-bit physical address space, `1` meaning
//! free. Everything starts out used; [`BitmapFrameAllocator::init`] frees what
//! the firmware reports as available and then reserves what the kernel and
//! the loader already occupy.
//!
//! ## Search
//!
//! Runs are searched word by word. A word with no free bit ends the current
//! run at once, a word with every bit free extends it by 32 frames, and only
//! partially free words are looked at bit by bit:
//!
//! ```text
//!  word:   0x0000_0000   0xFFFF_FFFF   0x0000_FF00
//!          skip          +32 frames    bit by bit
//! ```
//!
//! Window bounds are applied by masking the out-of-window bits of the first
//! and last word as used, so the word-level shortcut survives arbitrary bounds.

use core::ops::Range;
use kernel_info::boot::{BootInfo, PhysicalRegion};
use kernel_info::memory::{PAGE_SIZE, PM_BITMAP_WORDS, PM_FRAMES, REAL_MODE_END};
use kernel_info::status::KernError;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};
use kernel_sync::SpinLock;
use kernel_vmem::FrameAlloc;
use log::{info, trace, warn};

const WORD_BITS: u32 = u32::BITS;

/// One past the last frame number.
#[allow(clippy::cast_possible_truncation)]
const FRAME_LIMIT: u32 = PM_FRAMES as u32;

/// Errors of the physical allocator.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameAllocError {
    #[error("no run of free frames large enough")]
    OutOfMemory,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("invalid physical address")]
    InvalidAddress,
}

impl From<FrameAllocError> for KernError {
    fn from(e: FrameAllocError) -> Self {
        match e {
            FrameAllocError::OutOfMemory => Self::NoMemory,
            FrameAllocError::InvalidArgument => Self::InvalidArgument,
            FrameAllocError::InvalidAddress => Self::InvalidAddress,
        }
    }
}

struct Bitmap {
    words: [u32; PM_BITMAP_WORDS],
    free: u32,
    total: u32,
}

impl Bitmap {
    #[inline]
    const fn is_free(&self, frame: u32) -> bool {
        self.words[(frame / WORD_BITS) as usize] & (1 << (frame % WORD_BITS)) != 0
    }

    #[inline]
    const fn set_free(&mut self, frame: u32) {
        self.words[(frame / WORD_BITS) as usize] |= 1 << (frame % WORD_BITS);
    }

    #[inline]
    const fn set_used(&mut self, frame: u32) {
        self.words[(frame / WORD_BITS) as usize] &= !(1 << (frame % WORD_BITS));
    }

    /// Mark every frame in `frames` used; returns how many were free before.
    fn reserve(&mut self, frames: Range<u32>) -> u32 {
        let mut taken = 0;
        for frame in frames.start..frames.end.min(FRAME_LIMIT) {
            if self.is_free(frame) {
                self.set_used(frame);
                taken += 1;
            }
        }
        self.free -= taken;
        taken
    }

    /// First run of `pages` free frames inside `window`, by frame number.
    fn find(&self, pages: u32, window: Range<u32>) -> Option<u32> {
        if window.is_empty() {
            return None;
        }
        let first_word = window.start / WORD_BITS;
        let last_word = (window.end - 1) / WORD_BITS;

        let mut start = 0;
        let mut run = 0;
        for w in first_word..=last_word {
            let mut word = self.words[w as usize];
            if w == first_word {
                word &= u32::MAX << (window.start % WORD_BITS);
            }
            if w == last_word {
                word &= u32::MAX >> (WORD_BITS - 1 - (window.end - 1) % WORD_BITS);
            }

            match word {
                0 => run = 0,
                u32::MAX => {
                    if run == 0 {
                        start = w * WORD_BITS;
                    }
                    run += WORD_BITS;
                    if run >= pages {
                        return Some(start);
                    }
                }
                _ => {
                    for bit in 0..WORD_BITS {
                        if word & (1 << bit) == 0 {
                            run = 0;
                            continue;
                        }
                        if run == 0 {
                            start = w * WORD_BITS + bit;
                        }
                        run += 1;
                        if run >= pages {
                            return Some(start);
                        }
                    }
                }
            }
        }
        None
    }
}

/// Bitmap allocator over every frame of the 4 GiB physical space.
///
/// `const`-constructible so the kernel can keep it in a `static`; it reports
/// every frame used until [`init`](Self::init) has run.
pub struct BitmapFrameAllocator {
    bitmap: SpinLock<Bitmap>,
}

impl Default for BitmapFrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BitmapFrameAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bitmap: SpinLock::new(Bitmap {
                words: [0; PM_BITMAP_WORDS],
                free: 0,
                total: 0,
            }),
        }
    }

    /// Populate the bitmap from the boot memory map.
    ///
    /// Frees the whole frames of every available region, then reserves the
    /// kernel image and stack, the real-mode megabyte (which includes frame 0),
    /// the boot information block, and every module with its name.
    ///
    /// # Errors
    /// [`FrameAllocError::InvalidArgument`] if the memory map is empty.
    pub fn init(&self, boot: &BootInfo<'_>) -> Result<(), FrameAllocError> {
        if boot.memory_map.is_empty() {
            return Err(FrameAllocError::InvalidArgument);
        }

        let mut bitmap = self.bitmap.lock();
        bitmap.words.fill(0);
        bitmap.free = 0;

        for region in boot.memory_map.iter().filter(|r| r.kind.is_available()) {
            for frame in region.whole_frames() {
                if !bitmap.is_free(frame) {
                    bitmap.set_free(frame);
                    bitmap.free += 1;
                }
            }
        }
        bitmap.total = bitmap.free;

        let low_memory = PhysicalRegion::from_bounds(PhysicalAddress::zero(), PhysicalAddress::new(REAL_MODE_END));
        let mut reserved = 0;
        for region in [boot.kernel_image, boot.kernel_stack, low_memory, boot.info_block] {
            reserved += bitmap.reserve(region.frames());
        }
        for module in boot.modules {
            reserved += bitmap.reserve(module.payload.frames());
            reserved += bitmap.reserve(module.name.frames());
        }

        info!(
            "physical memory: {} of {} frames free, {reserved} reserved at boot",
            bitmap.free, bitmap.total
        );
        Ok(())
    }

    /// Mark the inclusive byte range `begin..=end` used, rounding outward to
    /// whole frames. Meant for bootstrap reservations.
    pub fn mark_range(&self, begin: PhysicalAddress, end: PhysicalAddress) {
        let first = begin.page::<Size4K>().index();
        let last = end.page::<Size4K>().index();
        if first <= last {
            self.bitmap.lock().reserve(first..last + 1);
        }
    }

    /// Allocate `pages` contiguous frames anywhere above frame 0.
    ///
    /// # Errors
    /// See [`alloc_limit`](Self::alloc_limit).
    pub fn alloc(&self, pages: u32) -> Result<PhysicalAddress, FrameAllocError> {
        if pages == 0 {
            return Err(FrameAllocError::InvalidArgument);
        }
        self.alloc_in(pages, 1..FRAME_LIMIT)
    }

    /// Allocate `pages` contiguous frames inside `[lower, upper)`.
    ///
    /// # Errors
    /// - [`FrameAllocError::InvalidArgument`]: `pages == 0`, misaligned bounds
    ///   or `lower >= upper`.
    /// - [`FrameAllocError::OutOfMemory`]: no free run inside the window.
    pub fn alloc_limit(
        &self,
        pages: u32,
        lower: PhysicalAddress,
        upper: PhysicalAddress,
    ) -> Result<PhysicalAddress, FrameAllocError> {
        if pages == 0
            || !lower.is_aligned::<Size4K>()
            || !upper.is_aligned::<Size4K>()
            || lower >= upper
        {
            return Err(FrameAllocError::InvalidArgument);
        }
        self.alloc_in(pages, lower.page::<Size4K>().index()..upper.page::<Size4K>().index())
    }

    /// Claim the first run of `pages` free frames whose numbers lie in `window`.
    fn alloc_in(&self, pages: u32, window: Range<u32>) -> Result<PhysicalAddress, FrameAllocError> {
        let mut bitmap = self.bitmap.lock();
        let start = bitmap.find(pages, window).ok_or(FrameAllocError::OutOfMemory)?;
        for frame in start..start + pages {
            bitmap.set_used(frame);
        }
        bitmap.free -= pages;

        let base = PhysicalPage::<Size4K>::from_index(start).base();
        trace!("allocated {pages} frames at {base}");
        Ok(base)
    }

    /// Return `pages` frames starting at `base`.
    ///
    /// Frames that are already free are reported and skipped; the rest of
    /// the range is still released.
    ///
    /// # Errors
    /// - [`FrameAllocError::InvalidAddress`]: `base` is frame 0, misaligned,
    ///   or the range leaves physical memory.
    /// - [`FrameAllocError::InvalidArgument`]: `pages == 0`.
    pub fn free(&self, base: PhysicalAddress, pages: u32) -> Result<(), FrameAllocError> {
        if pages == 0 {
            return Err(FrameAllocError::InvalidArgument);
        }
        if base.is_null() || !base.is_aligned::<Size4K>() {
            return Err(FrameAllocError::InvalidAddress);
        }
        let first = base.page::<Size4K>().index();
        let end = first.checked_add(pages).filter(|&end| end <= FRAME_LIMIT);
        let Some(end) = end else {
            return Err(FrameAllocError::InvalidAddress);
        };

        let mut bitmap = self.bitmap.lock();
        let mut released = 0;
        for frame in first..end {
            let already_free = bitmap.is_free(frame);
            if already_free {
                warn!("double free of physical frame {}", PhysicalPage::<Size4K>::from_index(frame));
            }
            debug_assert!(!already_free, "double free of physical frame {frame:#x}");
            if !already_free {
                bitmap.set_free(frame);
                released += 1;
            }
        }
        bitmap.free += released;
        trace!("freed {released} frames at {base}");
        Ok(())
    }

    /// Frames currently free.
    #[must_use]
    pub fn free_frames(&self) -> u32 {
        self.bitmap.lock().free
    }

    /// Frames the memory map reported as available, reserved ones included.
    #[must_use]
    pub fn total_frames(&self) -> u32 {
        self.bitmap.lock().total
    }

    #[must_use]
    pub fn is_free(&self, frame: PhysicalPage<Size4K>) -> bool {
        self.bitmap.lock().is_free(frame.index())
    }
}

impl FrameAlloc for BitmapFrameAllocator {
    fn alloc_frames(&self, pages: u32) -> Option<PhysicalAddress> {
        self.alloc(pages).ok()
    }

    fn free_frames(&self, base: PhysicalAddress, pages: u32) {
        if let Err(e) = self.free(base, pages) {
            warn!("rejected free of {pages} frames at {base}: {e}");
        }
    }
}
