use kernel_info::status::KernError;

/// Failures of the virtual memory operations.
///
/// Exhausting the search window is always [`VmError::OutOfMemory`]; misuse is
/// reported as one of the two `Invalid*` kinds and never retried.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    /// No physical frame for a page table, or no free virtual range in the window.
    #[error("out of memory")]
    OutOfMemory,
    /// Misaligned, null, unmapped or reserved address.
    #[error("invalid address")]
    InvalidAddress,
    /// Bad page count, window or flags.
    #[error("invalid argument")]
    InvalidArgument,
}

impl From<VmError> for KernError {
    fn from(value: VmError) -> Self {
        match value {
            VmError::OutOfMemory => Self::NoMemory,
            VmError::InvalidAddress => Self::InvalidAddress,
            VmError::InvalidArgument => Self::InvalidArgument,
        }
    }
}
