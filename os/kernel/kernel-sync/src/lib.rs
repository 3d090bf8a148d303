//! # Kernel synchronization primitives
//!
//! The memory-management layers serialize on plain spin locks: one over the
//! physical frame bitmap, one per page directory and one per heap. None of
//! them suspends, so a [`SpinLock`] is all that is needed.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;

pub use spin_lock::{SpinLock, SpinLockGuard};
