//! Address spaces: per-process virtual memory state.
//!
//! An address space is built in two phases. While the loader parses the
//! executable it defines one region per program segment; preparation then
//! appends the stack region, sizes the page table, and allocates it in one
//! reserved run. After preparation the segment list and table shape are
//! immutable, so faults can read them without the table lock; only entry
//! contents change, under the sleep lock.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::address::{PhysicalAddress, VirtualAddress};
use crate::arch;
use crate::error::VmError;
use crate::page_table::{PageTable, PageTableEntry};
use crate::segment::{ExecutableImage, Permissions, Segment};
use crate::sync::{blocking_forbidden, SleepLock};
use crate::vm::Vm;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one address space, unique for the life of the kernel.
///
/// The frame table records owners by id rather than by reference so frame
/// bookkeeping never outlives or pins the space itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressSpaceId(u64);

impl AddressSpaceId {
    fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// One process's virtual memory: segments, page table, and the open image
/// they were loaded from.
pub struct AddressSpace {
    id: AddressSpaceId,
    image: Arc<dyn ExecutableImage>,
    segments: Vec<Segment>,
    prepared: bool,
    table: SleepLock<PageTable>,
}

impl AddressSpace {
    /// Creates an empty address space over `image`.
    ///
    /// The image stays open for the life of the space; text and data pages
    /// are read from it on demand, possibly repeatedly.
    pub fn new(image: Arc<dyn ExecutableImage>) -> Self {
        Self {
            id: AddressSpaceId::next(),
            image,
            segments: Vec::new(),
            prepared: false,
            table: SleepLock::new(PageTable::empty()),
        }
    }

    /// Returns the space's identity.
    pub fn id(&self) -> AddressSpaceId {
        self.id
    }

    /// Returns the executable image the space was loaded from.
    pub fn image(&self) -> &dyn ExecutableImage {
        &*self.image
    }

    /// Returns the defined segments, in ascending address order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Returns the page table lock.
    pub fn page_table(&self) -> &SleepLock<PageTable> {
        &self.table
    }

    /// Defines a region of `size` bytes at `vaddr`, backed by `file_size`
    /// bytes at `file_offset` in the image.
    ///
    /// Regions must be defined in ascending address order, before
    /// [`prepare`](Self::prepare).
    pub fn define_region(
        &mut self,
        vaddr: VirtualAddress,
        size: usize,
        file_offset: u64,
        file_size: usize,
        permissions: Permissions,
    ) {
        debug_assert!(!self.prepared, "region defined after preparation");

        let segment = Segment::new(vaddr, size, file_offset, file_size, permissions);
        if let Some(last) = self.segments.last() {
            debug_assert!(
                last.end() <= segment.start(),
                "regions must be defined in ascending order"
            );
        }
        self.segments.push(segment);
    }

    /// Finalizes the layout: appends the stack region and allocates the page
    /// table, one zeroed entry per page of every segment.
    pub fn prepare(&mut self, vm: &Vm) -> Result<(), VmError> {
        debug_assert!(!self.prepared, "address space prepared twice");

        self.segments.push(Segment::zeroed(
            VirtualAddress::new(arch::USER_SPACE_TOP - arch::STACK_PAGES * arch::PAGE_SIZE),
            arch::STACK_PAGES * arch::PAGE_SIZE,
            Permissions::new(true, true, false),
        ));

        let pages: usize = self.segments.iter().map(Segment::pages).sum();
        let base = vm.coremap().allocate_reserved(PageTable::frames_needed(pages))?;
        let mut table = PageTable::new(base, pages);
        table.initialize(&self.segments);
        *self.table.lock() = table;

        self.prepared = true;
        Ok(())
    }

    /// Returns the initial user stack pointer.
    pub fn stack_pointer(&self) -> VirtualAddress {
        VirtualAddress::new(arch::USER_SPACE_TOP)
    }

    /// Finds the segment containing `vaddr`.
    pub fn segment_for(&self, vaddr: VirtualAddress) -> Option<&Segment> {
        self.segments.iter().find(|s| s.contains(vaddr))
    }

    /// Translates `vaddr` to its frame, if the page is resident.
    ///
    /// Callable from no-sleep contexts; there it refuses to wait for the
    /// table lock and reports the page non-resident instead.
    pub fn translate(&self, vaddr: VirtualAddress) -> Option<PhysicalAddress> {
        if blocking_forbidden() {
            self.table.try_lock()?.translate(vaddr)
        } else {
            self.table.lock().translate(vaddr)
        }
    }

    /// Clones the space for fork: same segments, a fresh page table, and a
    /// private copy of every page that has storage.
    ///
    /// Swapped source pages are read straight into the child's new frame
    /// without releasing the parent's slot; resident pages are copied frame
    /// to frame. Pages that were never touched stay that way in the child.
    pub fn duplicate(&self, vm: &Vm) -> Result<Self, VmError> {
        let mut new = Self::new(self.image.clone());
        new.segments = self.segments.clone();
        new.prepared = self.prepared;

        // Held for the whole copy so source pages cannot move under us: any
        // eviction of a source frame would need this lock.
        let source = self.table.lock();

        if !source.is_empty() {
            let base = vm
                .coremap()
                .allocate_reserved(PageTable::frames_needed(source.len()))?;
            let mut table = PageTable::new(base, source.len());
            for index in 0..source.len() {
                let entry = source.entry(index);
                *table.entry_mut(index) =
                    PageTableEntry::unmapped(entry.vaddr(), entry.permissions());
            }
            *new.table.lock() = table;
        }

        // Contents, page by page. The new frames are owned by the child, so
        // any eviction pressure this creates falls on pages already copied.
        for index in 0..source.len() {
            let entry = source.entry(index);
            if let Some(slot) = entry.swap_slot() {
                let frame = vm.allocate_user_frame(entry.vaddr(), &new)?;
                vm.swap().read_in(slot, frame, false)?;
                new.table.lock().entry_mut(index).set_resident(frame);
            } else if let Some(src_frame) = entry.frame() {
                let frame = vm.allocate_user_frame(entry.vaddr(), &new)?;
                // SAFETY: The child owns `frame` exclusively; the source
                // frame cannot be evicted or released while the source
                // table lock is held.
                let dst = unsafe { frame.frame_bytes_mut() };
                let src = unsafe { src_frame.frame_bytes_mut() };
                dst.copy_from_slice(src);
                new.table.lock().entry_mut(index).set_resident(frame);
            }
        }

        Ok(new)
    }

    /// Destroys the space, returning every resource it holds: swap slots for
    /// swapped-out pages, the page table's reserved run, and every owned
    /// frame.
    pub fn teardown(self, vm: &Vm) {
        let table = self.table.lock();
        for index in 0..table.len() {
            if let Some(slot) = table.entry(index).swap_slot() {
                vm.swap().release_slot(slot);
            }
        }
        let base = table.base();
        let table_frames = PageTable::frames_needed(table.len());
        drop(table);

        if table_frames > 0 {
            if let Err(err) = vm.coremap().release(base) {
                log::error!("{:?} teardown failed to release page table: {err}", self.id);
            }
        }
        vm.coremap().release_space(self.id);
    }
}
