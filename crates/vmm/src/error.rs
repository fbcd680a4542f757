//! Error taxonomy for the virtual memory manager.
//!
//! Three tiers: recoverable exhaustion (propagated to process creation),
//! I/O failures (propagated through the fault path for the trap layer to
//! turn into process termination), and fatal invariant violations (routed to
//! a single top-level halt handler instead of being silently recovered,
//! because continuing would corrupt translations).

use core::fmt;

use crate::address::VirtualAddress;

/// Errors produced by the virtual memory manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Out of physical memory for a recoverable allocation (address-space or
    /// page-table metadata). The failed operation aborts; the kernel lives.
    OutOfMemory,
    /// A fault arrived with no process or address space bound. Expected only
    /// during early boot; the trap layer panics on it rather than looping.
    NoContext,
    /// A backing-store or executable read/write failed.
    Io(IoError),
    /// An invariant of a correctly prepared address space was violated.
    /// Unrecoverable: the trap layer halts the kernel with the diagnostic.
    Fatal(FatalError),
}

/// Unrecoverable invariant violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalError {
    /// Eviction was required but the swap store has no free slots.
    SwapExhausted,
    /// No contiguous frame run could satisfy a reserved (page-table)
    /// allocation; paging structures cannot be swapped, so this cannot be
    /// recovered by eviction.
    NoContiguousRun,
    /// A faulting address fell outside every segment of its address space.
    SegmentNotFound(VirtualAddress),
    /// A mapped address has no page-table entry; every page of a prepared
    /// address space gets a zeroed entry up front.
    PageEntryMissing(VirtualAddress),
    /// The hardware reported a read-only fault, which cannot happen because
    /// pages are always created read-write at the hardware level.
    ReadOnlyFault(VirtualAddress),
    /// A frame below the managed region was passed to the frame allocator
    /// for release.
    UnmanagedFrame,
    /// The frame table says a frame belongs to an address space, but that
    /// space's page table has no resident entry mapped to it.
    OrphanedFrame,
}

/// Backing-store I/O failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// The device reported a failure.
    Device,
    /// A transfer fell outside the device or image extent.
    OutOfRange,
}

impl From<IoError> for VmError {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of physical memory"),
            Self::NoContext => write!(f, "page fault with no address space bound"),
            Self::Io(err) => write!(f, "backing store I/O failed: {err:?}"),
            Self::Fatal(err) => write!(f, "unrecoverable invariant violation: {err:?}"),
        }
    }
}

impl VmError {
    /// Returns true if this error must halt the kernel.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_converts() {
        let err: VmError = IoError::Device.into();
        assert_eq!(err, VmError::Io(IoError::Device));
        assert!(!err.is_fatal());
    }

    #[test]
    fn fatal_classification() {
        assert!(VmError::Fatal(FatalError::SwapExhausted).is_fatal());
        assert!(!VmError::OutOfMemory.is_fatal());
        assert!(!VmError::NoContext.is_fatal());
    }

    #[test]
    fn display_mentions_cause() {
        let err = VmError::Fatal(FatalError::SegmentNotFound(VirtualAddress::new(0x4000)));
        assert!(format!("{err}").contains("unrecoverable"));
    }
}
