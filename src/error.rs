use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, NtfsError>;

/// Failure kinds reported by the attribute and file-record engine.
///
/// Every public operation either fully succeeds or leaves the in-memory
/// structure unmodified and reports one of these.
#[derive(Debug, Error)]
pub enum NtfsError {
    /// Malformed on-disk input: bad signature, length overrun, fixup
    /// mismatch, non-contiguous fragments. Never silently repaired.
    #[error("corrupt structure at offset 0x{offset:X}: {reason}")]
    CorruptStructure { offset: usize, reason: String },

    /// VCN/LCN out of bounds, misaligned partial-cluster write, and
    /// other caller mistakes.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A record cannot fit even an empty segment. Indicates a modeling
    /// bug in the caller's geometry, not a recoverable condition.
    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),

    /// A mutating operation was attempted through a read-only volume.
    #[error("volume is read-only")]
    ReadOnly,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NtfsError {
    pub(crate) fn corrupt(offset: usize, reason: impl Into<String>) -> Self {
        NtfsError::CorruptStructure {
            offset,
            reason: reason.into(),
        }
    }
}
