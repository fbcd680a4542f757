//! Virtual memory segments and on-demand page materialization.
//!
//! A segment is a contiguous virtual range with uniform permissions and an
//! optional backing extent in the executable image. Segments are built once
//! at load time, in ascending address order, and never change afterward; the
//! fault handler consults them to decide how to materialize a page.

use crate::address::VirtualAddress;
use crate::arch;
use crate::error::IoError;

/// A read/write/execute permission mask, inherited by every page-table entry
/// created within the segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions(u8);

impl Permissions {
    /// Read bit.
    const READ: u8 = 1 << 2;

    /// Write bit.
    const WRITE: u8 = 1 << 1;

    /// Execute bit.
    const EXECUTE: u8 = 1 << 0;

    /// Creates a permission mask from individual flags.
    pub const fn new(read: bool, write: bool, execute: bool) -> Self {
        let mut bits = 0;
        if read {
            bits |= Self::READ;
        }
        if write {
            bits |= Self::WRITE;
        }
        if execute {
            bits |= Self::EXECUTE;
        }
        Self(bits)
    }

    /// Creates a permission mask from a raw 3-bit value.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & (Self::READ | Self::WRITE | Self::EXECUTE))
    }

    /// Returns the raw 3-bit value.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns whether reads are permitted.
    pub const fn readable(self) -> bool {
        (self.0 & Self::READ) != 0
    }

    /// Returns whether writes are permitted.
    pub const fn writable(self) -> bool {
        (self.0 & Self::WRITE) != 0
    }

    /// Returns whether execution is permitted.
    pub const fn executable(self) -> bool {
        (self.0 & Self::EXECUTE) != 0
    }
}

/// Byte-range read access to the executable an address space was loaded from.
///
/// The image stays open for the whole life of the address space so text and
/// data pages can be (re-)read on demand. Header parsing and the initial
/// program-load walk live with the loader, not here; the fault path only
/// needs raw reads at known offsets.
pub trait ExecutableImage: Send + Sync {
    /// Reads exactly `buf.len()` bytes starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), IoError>;
}

/// A contiguous virtual region of an address space.
///
/// The region may be larger than its file backing: the remainder (BSS tail,
/// or the whole region for stack segments) is zero-filled on first touch.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Page-aligned start of the region.
    start: VirtualAddress,
    /// Region length in pages.
    pages: usize,
    /// Offset of the backing bytes within the executable image.
    file_offset: u64,
    /// Number of backing bytes; zero means the whole region is zero-filled.
    file_size: usize,
    /// Sub-page offset of the original (unaligned) region start. The backing
    /// bytes begin at this offset within the first page.
    init_offset: usize,
    /// Permission mask applied to every page in the region.
    permissions: Permissions,
}

impl Segment {
    /// Defines a region covering `size` bytes at `vaddr`.
    ///
    /// The start is aligned down to a page boundary and the length rounded up
    /// to whole pages, with the start's sub-page offset recorded so on-demand
    /// reads place file bytes correctly within the first page.
    pub fn new(
        vaddr: VirtualAddress,
        size: usize,
        file_offset: u64,
        file_size: usize,
        permissions: Permissions,
    ) -> Self {
        let init_offset = vaddr.page_offset();
        let size = size + init_offset;
        let pages = size.div_ceil(arch::PAGE_SIZE);

        Self {
            start: vaddr.page_align_down(),
            pages,
            file_offset,
            file_size,
            init_offset,
            permissions,
        }
    }

    /// Defines a region with no file backing; every page zero-fills.
    pub fn zeroed(vaddr: VirtualAddress, size: usize, permissions: Permissions) -> Self {
        Self::new(vaddr, size, 0, 0, permissions)
    }

    /// Returns the page-aligned start of the region.
    pub fn start(&self) -> VirtualAddress {
        self.start
    }

    /// Returns the region length in pages.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Returns one past the last address of the region.
    pub fn end(&self) -> VirtualAddress {
        self.start + self.pages * arch::PAGE_SIZE
    }

    /// Returns the permission mask for the region.
    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    /// Returns true if `vaddr` falls within the region.
    pub fn contains(&self, vaddr: VirtualAddress) -> bool {
        self.start <= vaddr && vaddr < self.end()
    }

    /// Returns true if any page of the region has bytes in the executable.
    pub fn file_backed(&self) -> bool {
        self.file_size > 0
    }

    /// Materializes the page at `page_start` into `frame`.
    ///
    /// The frame is zeroed, then whatever part of the page overlaps the file
    /// extent is read from the image; bytes beyond the extent but within the
    /// segment stay zero.
    pub fn load_page(
        &self,
        image: &dyn ExecutableImage,
        page_start: VirtualAddress,
        frame: &mut [u8],
    ) -> Result<(), IoError> {
        debug_assert!(page_start.is_page_aligned());
        debug_assert!(self.contains(page_start));
        debug_assert_eq!(frame.len(), arch::PAGE_SIZE);

        frame.fill(0);

        // Segment-relative extent of the page and of the file backing.
        let page_lo = page_start - self.start;
        let page_hi = page_lo + arch::PAGE_SIZE;
        let file_lo = self.init_offset;
        let file_hi = self.init_offset + self.file_size;

        let lo = page_lo.max(file_lo);
        let hi = page_hi.min(file_hi);
        if lo < hi {
            let image_offset = self.file_offset + (lo - file_lo) as u64;
            image.read_at(image_offset, &mut frame[lo - page_lo..hi - page_lo])?;
        }

        Ok(())
    }
}
