//! Machine parameters for the modeled architecture.
//!
//! The manager targets a 32-bit machine with a software-managed TLB: address
//! translation misses trap to the kernel, which refills one of a fixed set of
//! hardware slots by hand. Everything the rest of the crate needs to know
//! about the machine lives here, so host tests and a real port share the same
//! core.

/// Page size in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Number of hardware TLB slots.
pub const TLB_SLOTS: usize = 64;

/// Maximum number of bits in a physical address.
pub const MAX_PHYSICAL_BITS: usize = 32;

/// Maximum number of bits in a virtual address.
pub const MAX_VIRTUAL_BITS: usize = 32;

/// First address above user space. The kernel owns everything from here up.
pub const USER_SPACE_TOP: usize = 0x8000_0000;

/// Pages in the user stack segment, placed directly below [`USER_SPACE_TOP`].
pub const STACK_PAGES: usize = 18;

/// Validates a physical address against the machine's address width.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr < (1 << MAX_PHYSICAL_BITS)
}

/// Validates a virtual address against the machine's address width.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    addr < (1 << MAX_VIRTUAL_BITS)
}

/// Emulated physical memory for host testing.
///
/// A plain buffer standing in for RAM, so the frame allocator, page tables,
/// and fault paths can run on any host without hardware access. Physical
/// addresses index directly into the buffer.
#[cfg(any(test, feature = "software-emulation"))]
pub struct EmulatedRam {
    memory: alloc::vec::Vec<u8>,
}

#[cfg(any(test, feature = "software-emulation"))]
impl EmulatedRam {
    /// Creates an emulated RAM region of the given size.
    pub fn new(size: usize) -> Self {
        Self {
            memory: alloc::vec![0u8; size],
        }
    }

    /// Translates a physical address to a host pointer into the buffer.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.memory.len(), "physical address out of bounds");
        unsafe { self.memory.as_ptr().add(phys) as *mut u8 }
    }

    /// Translates a host pointer back to a physical address.
    pub fn ptr_to_phys(&self, ptr: *const u8) -> usize {
        let offset = unsafe { ptr.offset_from(self.memory.as_ptr()) };
        assert!(offset >= 0, "pointer not within emulated memory");
        assert!(
            (offset as usize) < self.memory.len(),
            "pointer not within emulated memory"
        );
        offset as usize
    }

    /// Returns the size of the emulated region.
    pub fn size(&self) -> usize {
        self.memory.len()
    }
}
