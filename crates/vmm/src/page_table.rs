//! Per-address-space page tables.
//!
//! A page table is a flat array of entries, one per page of the owning
//! address space, stored in physically contiguous reserved frames rather
//! than kernel heap. Entries are laid out in segment order at preparation
//! time and the array never grows or shrinks afterward; only entry contents
//! change. Concurrency control lives with the owner ([`crate::AddressSpace`]
//! wraps the table in a sleep lock), not here.

use core::mem::size_of;

use crate::address::{AddressTranslator, PhysicalAddress, VirtualAddress};
use crate::arch;
use crate::segment::{Permissions, Segment};

/// One page's mapping state.
///
/// `frame` is overloaded the way the rest of the manager expects: the frame
/// address while the page is resident, the swap slot index while it is
/// swapped out, and zero when the page has no storage at all (never touched,
/// or discarded as clean). The two flags disambiguate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry {
    vaddr: usize,
    frame: usize,
    permissions: Permissions,
    resident: bool,
    swapped: bool,
}

impl PageTableEntry {
    /// Creates an entry for the page at `vaddr` with no storage.
    pub const fn unmapped(vaddr: VirtualAddress, permissions: Permissions) -> Self {
        Self {
            vaddr: vaddr.as_usize(),
            frame: 0,
            permissions,
            resident: false,
            swapped: false,
        }
    }

    /// Returns the page's virtual address.
    pub const fn vaddr(&self) -> VirtualAddress {
        VirtualAddress::new(self.vaddr)
    }

    /// Returns the page's permission mask.
    pub const fn permissions(&self) -> Permissions {
        self.permissions
    }

    /// Returns true if the page is in physical memory.
    pub const fn is_resident(&self) -> bool {
        self.resident
    }

    /// Returns the page's frame while resident.
    pub fn frame(&self) -> Option<PhysicalAddress> {
        self.resident.then(|| PhysicalAddress::new(self.frame))
    }

    /// Returns the page's swap slot while swapped out.
    pub fn swap_slot(&self) -> Option<usize> {
        self.swapped.then_some(self.frame)
    }

    /// Marks the page resident in `frame`.
    pub fn set_resident(&mut self, frame: PhysicalAddress) {
        self.frame = frame.as_usize();
        self.resident = true;
        self.swapped = false;
    }

    /// Marks the page swapped out to `slot`.
    pub fn set_swapped(&mut self, slot: usize) {
        self.frame = slot;
        self.resident = false;
        self.swapped = true;
    }

    /// Discards the page's storage. Used when a clean page is evicted: its
    /// contents can be re-read from the executable image on the next fault.
    pub fn clear_frame(&mut self) {
        self.frame = 0;
        self.resident = false;
        self.swapped = false;
    }
}

/// A flat page table living in reserved physical frames.
///
/// The table records where its entries live (`base`) and how many there are;
/// the frames themselves are owned by the allocator's reserved run and are
/// released by the owning address space at teardown.
pub struct PageTable {
    base: PhysicalAddress,
    entries: usize,
}

impl PageTable {
    /// Creates a table with no entries, used before preparation.
    pub const fn empty() -> Self {
        Self {
            base: PhysicalAddress::new(0),
            entries: 0,
        }
    }

    /// Returns the number of frames needed to hold `entries` entries.
    pub const fn frames_needed(entries: usize) -> usize {
        (entries * size_of::<PageTableEntry>()).div_ceil(arch::PAGE_SIZE)
    }

    /// Builds a table of `entries` unmapped entries in the frames at `base`.
    ///
    /// The frames must be a reserved run of at least
    /// [`frames_needed`](Self::frames_needed)`(entries)` frames that the
    /// caller owns; the table takes them over.
    pub fn new(base: PhysicalAddress, entries: usize) -> Self {
        debug_assert!(base.is_page_aligned());

        let table = Self { base, entries };
        let none = Permissions::from_bits(0);
        for i in 0..entries {
            // SAFETY: i is in bounds and the frames are owned and unshared;
            // write (not assignment) because the memory is uninitialized.
            unsafe {
                table.entry_ptr(i).write(PageTableEntry::unmapped(
                    VirtualAddress::new(0),
                    none,
                ));
            }
        }
        table
    }

    /// Fills in entries for every page of `segments`, in order.
    pub fn initialize(&mut self, segments: &[Segment]) {
        let mut index = 0;
        for segment in segments {
            for page in 0..segment.pages() {
                let vaddr = segment.start() + page * arch::PAGE_SIZE;
                self.slice_mut()[index] =
                    PageTableEntry::unmapped(vaddr, segment.permissions());
                index += 1;
            }
        }
        debug_assert_eq!(index, self.entries);
    }

    /// Returns the first frame of the table's storage.
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    /// Returns the number of entries.
    pub const fn len(&self) -> usize {
        self.entries
    }

    /// Returns true if the table has no entries.
    pub const fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Returns a copy of entry `index`.
    pub fn entry(&self, index: usize) -> PageTableEntry {
        self.slice()[index]
    }

    /// Returns a mutable reference to entry `index`.
    pub fn entry_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.slice_mut()[index]
    }

    /// Finds the entry for the page at `vaddr`.
    pub fn find_by_vaddr(&self, vaddr: VirtualAddress) -> Option<usize> {
        debug_assert!(vaddr.is_page_aligned());
        self.slice().iter().position(|e| e.vaddr == vaddr.as_usize())
    }

    /// Finds the resident entry mapped to `frame`.
    ///
    /// Only resident entries are considered: for swapped entries the frame
    /// field holds a slot index, which could collide numerically.
    pub fn find_by_frame(&self, frame: PhysicalAddress) -> Option<usize> {
        self.slice()
            .iter()
            .position(|e| e.resident && e.frame == frame.as_usize())
    }

    /// Translates a page address to its frame, if the page is resident.
    pub fn translate(&self, vaddr: VirtualAddress) -> Option<PhysicalAddress> {
        let index = self.find_by_vaddr(vaddr.page_align_down())?;
        self.entry(index).frame()
    }

    /// Translates a frame back to the page address mapped to it.
    pub fn translate_reverse(&self, frame: PhysicalAddress) -> Option<VirtualAddress> {
        let index = self.find_by_frame(frame)?;
        Some(self.entry(index).vaddr())
    }

    fn entry_ptr(&self, index: usize) -> *mut PageTableEntry {
        let base = AddressTranslator::current().phys_to_ptr::<PageTableEntry>(self.base);
        unsafe { base.add(index) }
    }

    fn slice(&self) -> &[PageTableEntry] {
        if self.entries == 0 {
            return &[];
        }
        // SAFETY: The storage frames are owned by this table, sized by
        // frames_needed, and initialized by new(); &self serializes access.
        unsafe { core::slice::from_raw_parts(self.entry_ptr(0), self.entries) }
    }

    fn slice_mut(&mut self) -> &mut [PageTableEntry] {
        if self.entries == 0 {
            return &mut [];
        }
        // SAFETY: As slice(), with &mut self guaranteeing exclusivity.
        unsafe { core::slice::from_raw_parts_mut(self.entry_ptr(0), self.entries) }
    }
}
