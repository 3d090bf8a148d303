//! # Kernel Result Codes
//!
//! [`KernError`] is what the memory-management crates convert their own
//! errors into; [`KernStatus`] is the same information as a plain integer for
//! the call gate and the userland allocator.

/// Kernel-wide failure kinds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernError {
    #[error("invalid address")]
    InvalidAddress,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("out of memory")]
    NoMemory,
    #[error("operation failed")]
    Failure,
}

/// C-compatible result code.
#[repr(i32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum KernStatus {
    Success = 0,
    InvalidAddress = 1,
    InvalidArgument = 2,
    NoMemory = 3,
    Failure = 4,
}

impl KernStatus {
    #[inline]
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Decode a raw code; anything unknown is a [`KernStatus::Failure`].
    #[must_use]
    pub const fn from_raw(raw: i32) -> Self {
        match raw {
            0 => Self::Success,
            1 => Self::InvalidAddress,
            2 => Self::InvalidArgument,
            3 => Self::NoMemory,
            _ => Self::Failure,
        }
    }

    /// Back to a `Result`, the inverse of `KernStatus::from(result)`.
    ///
    /// # Errors
    /// Every code except [`KernStatus::Success`] maps to its [`KernError`].
    pub const fn into_result(self) -> Result<(), KernError> {
        match self {
            Self::Success => Ok(()),
            Self::InvalidAddress => Err(KernError::InvalidAddress),
            Self::InvalidArgument => Err(KernError::InvalidArgument),
            Self::NoMemory => Err(KernError::NoMemory),
            Self::Failure => Err(KernError::Failure),
        }
    }
}

impl From<KernError> for KernStatus {
    fn from(value: KernError) -> Self {
        match value {
            KernError::InvalidAddress => Self::InvalidAddress,
            KernError::InvalidArgument => Self::InvalidArgument,
            KernError::NoMemory => Self::NoMemory,
            KernError::Failure => Self::Failure,
        }
    }
}

impl<T> From<Result<T, KernError>> for KernStatus {
    fn from(value: Result<T, KernError>) -> Self {
        match value {
            Ok(_) => Self::Success,
            Err(e) => e.into(),
        }
    }
}

impl From<KernStatus> for i32 {
    #[inline]
    fn from(value: KernStatus) -> Self {
        value as Self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_codes_are_stable() {
        assert_eq!(i32::from(KernStatus::Success), 0);
        assert_eq!(i32::from(KernStatus::InvalidAddress), 1);
        assert_eq!(i32::from(KernStatus::InvalidArgument), 2);
        assert_eq!(i32::from(KernStatus::NoMemory), 3);
        assert_eq!(i32::from(KernStatus::Failure), 4);
        assert_eq!(KernStatus::from_raw(-7), KernStatus::Failure);
    }

    #[test]
    fn results_round_trip_through_status() {
        let ok: Result<u32, KernError> = Ok(5);
        assert!(KernStatus::from(ok).is_success());

        for e in [
            KernError::InvalidAddress,
            KernError::InvalidArgument,
            KernError::NoMemory,
            KernError::Failure,
        ] {
            assert_eq!(KernStatus::from(e).into_result(), Err(e));
        }
    }
}
