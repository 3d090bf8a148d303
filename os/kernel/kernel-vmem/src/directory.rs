use core::fmt;
use kernel_memory_addresses::{PhysicalPage, Size4K};
use kernel_sync::SpinLock;

/// Handle to one address-space directory.
///
/// The handle owns the directory frame; it is created by
/// [`Vm::create_directory`](crate::Vm::create_directory) and returned with
/// [`Vm::destroy_directory`](crate::Vm::destroy_directory). All mapping
/// operations go through [`Vm::space`](crate::Vm::space).
pub struct Directory {
    pub(crate) root: PhysicalPage<Size4K>,
    pub(crate) lock: SpinLock<()>,
}

impl Directory {
    pub(crate) const fn new(root: PhysicalPage<Size4K>) -> Self {
        Self {
            root,
            lock: SpinLock::new(()),
        }
    }

    /// Physical page of the directory, i.e. the value CR3 is loaded with.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.root
    }
}

impl fmt::Debug for Directory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Directory").field(&self.root).finish()
    }
}
