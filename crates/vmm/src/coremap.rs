//! The frame table: allocator and eviction engine for physical memory.
//!
//! Every frame above the boot-time watermark is tracked by one
//! [`FrameState`]. The table is guarded by a raw spinlock so allocation and
//! release work from no-sleep contexts; the eviction path drops that lock
//! before touching page tables or the swap store, which both sleep.
//!
//! Two allocation disciplines coexist. Reserved runs hold paging structures:
//! they must be physically contiguous, are never eviction candidates, and
//! fail outright when no run is free. Owned frames hold user pages: they are
//! allocated one at a time on demand, and when memory is exhausted one is
//! stolen from the requesting address space itself, round-robin.

use alloc::boxed::Box;
use alloc::vec;

use crate::address::{PhysicalAddress, VirtualAddress};
use crate::addrspace::{AddressSpace, AddressSpaceId};
use crate::arch;
use crate::error::{FatalError, VmError};
use crate::stats::{VmStat, VmStats};
use crate::swap::SwapStore;
use crate::sync::RawSpinLock;
use crate::tlb::Tlb;

/// Boot-time description of physical memory.
///
/// Supplied by the platform at bootstrap; everything between the boot
/// watermark and the top of RAM becomes the managed region.
pub trait RamGeometry {
    /// Total bytes of physical memory, one past the last usable address.
    fn total_ram(&self) -> usize;

    /// First address above boot-time kernel allocations. Frames below this
    /// are never managed.
    fn first_free(&self) -> PhysicalAddress;
}

/// The state of one managed frame.
///
/// Multi-frame allocations record their length in the first frame's `run`;
/// follower frames carry `run: 0` so a release of the first frame frees the
/// whole run and a release of a follower frees nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Free,
    /// Pinned for paging structures; never evicted.
    Reserved { run: usize },
    /// Holds a user page of `space` at `vaddr`.
    Owned {
        space: AddressSpaceId,
        vaddr: VirtualAddress,
        run: usize,
    },
}

struct CoreMapInner {
    frames: Box<[FrameState]>,
    used: usize,
    /// Next eviction candidate.
    cursor: usize,
}

impl CoreMapInner {
    fn find_free_run(&self, count: usize) -> Option<usize> {
        let mut run_start = 0;
        let mut run_len = 0;
        for (index, frame) in self.frames.iter().enumerate() {
            if *frame == FrameState::Free {
                if run_len == 0 {
                    run_start = index;
                }
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            } else {
                run_len = 0;
            }
        }
        None
    }
}

/// The physical frame table.
pub struct CoreMap {
    /// Address of the first managed frame.
    base: PhysicalAddress,
    inner: RawSpinLock<CoreMapInner>,
}

impl CoreMap {
    /// Builds the table over the managed region described by `geometry`.
    ///
    /// The table's own footprint comes off the front of the region, where a
    /// raw in-memory table would live, so the frame count reflects what is
    /// actually available for allocation.
    pub fn new(geometry: &dyn RamGeometry) -> Self {
        let first = geometry.first_free().page_align_up();
        let mut frames = (geometry.total_ram() - first.as_usize()) / arch::PAGE_SIZE;
        let table_frames =
            (frames * core::mem::size_of::<FrameState>()).div_ceil(arch::PAGE_SIZE);
        frames -= table_frames;
        let base = first + table_frames * arch::PAGE_SIZE;

        log::info!("frame table managing {frames} frames from {base}");

        Self {
            base,
            inner: RawSpinLock::new(CoreMapInner {
                frames: vec![FrameState::Free; frames].into_boxed_slice(),
                used: 0,
                cursor: 0,
            }),
        }
    }

    /// Returns the address of the first managed frame.
    pub fn base(&self) -> PhysicalAddress {
        self.base
    }

    /// Returns the number of managed frames.
    pub fn total_frames(&self) -> usize {
        self.inner.lock().frames.len()
    }

    /// Returns the number of free frames.
    pub fn free_frames(&self) -> usize {
        let inner = self.inner.lock();
        inner.frames.len() - inner.used
    }

    /// Returns the number of frames currently owned by `space`.
    pub fn frames_owned_by(&self, id: AddressSpaceId) -> usize {
        self.inner
            .lock()
            .frames
            .iter()
            .filter(|f| matches!(f, FrameState::Owned { space, .. } if *space == id))
            .count()
    }

    /// Allocates a physically contiguous run of `count` frames for paging
    /// structures.
    ///
    /// Reserved frames are pinned: they never become eviction candidates, so
    /// this cannot free memory to satisfy itself. No free run is fatal.
    pub fn allocate_reserved(&self, count: usize) -> Result<PhysicalAddress, VmError> {
        debug_assert!(count > 0);
        let mut inner = self.inner.lock();
        let start = inner
            .find_free_run(count)
            .ok_or(VmError::Fatal(FatalError::NoContiguousRun))?;

        inner.frames[start] = FrameState::Reserved { run: count };
        for follower in &mut inner.frames[start + 1..start + count] {
            *follower = FrameState::Reserved { run: 0 };
        }
        inner.used += count;

        Ok(self.base + start * arch::PAGE_SIZE)
    }

    /// Allocates one frame to hold `space`'s page at `vaddr`, evicting one of
    /// `space`'s own resident pages if memory is exhausted.
    ///
    /// Eviction writes the victim to swap if it is writable, or discards it
    /// if its contents can be re-read from the executable image. The swap
    /// store is checked for capacity before a victim is claimed; exhausted
    /// swap during an eviction is unrecoverable.
    pub fn allocate_owned(
        &self,
        vaddr: VirtualAddress,
        space: &AddressSpace,
        swap: &SwapStore,
        tlb: &Tlb,
        stats: &VmStats,
    ) -> Result<PhysicalAddress, VmError> {
        debug_assert!(vaddr.is_page_aligned());

        if let Some(frame) = self.claim_free(vaddr, space.id()) {
            return Ok(frame);
        }

        if swap.free_slots() == 0 {
            return Err(VmError::Fatal(FatalError::SwapExhausted));
        }

        let victim = self.claim_victim(vaddr, space.id());

        // The frame is already recorded as the new page's home, but the old
        // page's contents and table entry are still live. Move them out
        // under the page-table lock before the caller fills the frame.
        let mut table = space.page_table().lock();
        let index = table
            .find_by_frame(victim)
            .ok_or(VmError::Fatal(FatalError::OrphanedFrame))?;
        let entry = table.entry_mut(index);
        let evicted = entry.vaddr();

        if entry.permissions().writable() {
            let slot = swap.write_out(victim)?;
            entry.set_swapped(slot);
            stats.record(VmStat::SwapWrite);
        } else {
            // Clean and re-readable from the image; no write-back needed.
            entry.clear_frame();
        }
        tlb.invalidate_page(evicted);

        Ok(victim)
    }

    /// Releases the run starting at `frame`.
    ///
    /// Releasing a frame below the managed region is rejected: such frames
    /// belong to the boot image, and a release request for one means some
    /// pointer upstream is corrupt. Releasing a free frame or the middle of
    /// a run frees nothing.
    pub fn release(&self, frame: PhysicalAddress) -> Result<(), VmError> {
        if frame < self.base {
            log::error!("release of unmanaged frame {frame}");
            return Err(VmError::Fatal(FatalError::UnmanagedFrame));
        }
        let index = (frame - self.base) / arch::PAGE_SIZE;

        let mut inner = self.inner.lock();
        if index >= inner.frames.len() {
            return Err(VmError::Fatal(FatalError::UnmanagedFrame));
        }

        let run = match inner.frames[index] {
            FrameState::Free => 0,
            FrameState::Reserved { run } | FrameState::Owned { run, .. } => run,
        };
        if run == 0 {
            log::warn!("release of {frame} freed no frames");
            return Ok(());
        }

        for state in &mut inner.frames[index..index + run] {
            *state = FrameState::Free;
        }
        inner.used -= run;
        Ok(())
    }

    /// Releases every frame owned by `space`. Used at address-space teardown;
    /// reserved runs (the space's page table) are released separately by
    /// their holder.
    pub fn release_space(&self, id: AddressSpaceId) {
        let mut inner = self.inner.lock();
        let mut freed = 0;
        for state in inner.frames.iter_mut() {
            if matches!(state, FrameState::Owned { space, .. } if *space == id) {
                *state = FrameState::Free;
                freed += 1;
            }
        }
        inner.used -= freed;
    }

    fn claim_free(&self, vaddr: VirtualAddress, id: AddressSpaceId) -> Option<PhysicalAddress> {
        let mut inner = self.inner.lock();
        let index = inner.frames.iter().position(|f| *f == FrameState::Free)?;
        inner.frames[index] = FrameState::Owned {
            space: id,
            vaddr,
            run: 1,
        };
        inner.used += 1;
        Some(self.base + index * arch::PAGE_SIZE)
    }

    fn claim_victim(&self, vaddr: VirtualAddress, id: AddressSpaceId) -> PhysicalAddress {
        let mut inner = self.inner.lock();
        // Round-robin over frames owned by the requesting space; other
        // spaces' pages are never stolen. If the space has no resident page
        // this scan spins forever with the table locked. A space always
        // faults in at least one page before it can exhaust memory, but a
        // fix would need a victim protocol across spaces.
        loop {
            let index = inner.cursor;
            inner.cursor = (inner.cursor + 1) % inner.frames.len();
            if matches!(inner.frames[index], FrameState::Owned { space, .. } if space == id) {
                inner.frames[index] = FrameState::Owned {
                    space: id,
                    vaddr,
                    run: 1,
                };
                return self.base + index * arch::PAGE_SIZE;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressTranslator;

    struct TestRam {
        bytes: usize,
        first_free: usize,
    }

    impl RamGeometry for TestRam {
        fn total_ram(&self) -> usize {
            self.bytes
        }
        fn first_free(&self) -> PhysicalAddress {
            PhysicalAddress::new(self.first_free)
        }
    }

    fn setup(frames: usize) -> CoreMap {
        if AddressTranslator::try_current().is_none() {
            AddressTranslator::set_current(AddressTranslator::emulated(
                arch::PAGE_SIZE * (frames + 4),
            ));
        }
        // One extra frame absorbs the table's own footprint.
        CoreMap::new(&TestRam {
            bytes: arch::PAGE_SIZE * (frames + 2),
            first_free: arch::PAGE_SIZE,
        })
    }

    #[test]
    fn table_footprint_is_deducted() {
        let map = setup(8);
        assert_eq!(map.total_frames(), 8);
        assert_eq!(map.free_frames(), 8);
        assert!(map.base() >= PhysicalAddress::new(arch::PAGE_SIZE * 2));
    }

    #[test]
    fn unaligned_watermark_is_rounded_up() {
        if AddressTranslator::try_current().is_none() {
            AddressTranslator::set_current(AddressTranslator::emulated(arch::PAGE_SIZE * 8));
        }
        let map = CoreMap::new(&TestRam {
            bytes: arch::PAGE_SIZE * 6,
            first_free: arch::PAGE_SIZE + 0x10,
        });
        assert!(map.base().is_page_aligned());
        assert_eq!(map.total_frames(), 3);
    }

    #[test]
    fn reserved_runs_are_contiguous_and_released_whole() {
        let map = setup(8);

        let run = map.allocate_reserved(3).unwrap();
        assert!(run.is_page_aligned());
        assert_eq!(map.free_frames(), 5);

        map.release(run).unwrap();
        assert_eq!(map.free_frames(), 8);
    }

    #[test]
    fn reserved_allocation_fails_without_a_run() {
        let map = setup(4);
        assert_eq!(
            map.allocate_reserved(5),
            Err(VmError::Fatal(FatalError::NoContiguousRun))
        );
        // Nothing was claimed by the failed attempt.
        assert_eq!(map.free_frames(), 4);
    }

    #[test]
    fn fragmentation_defeats_a_run() {
        let map = setup(4);
        let a = map.allocate_reserved(1).unwrap();
        let b = map.allocate_reserved(1).unwrap();
        let c = map.allocate_reserved(1).unwrap();
        let d = map.allocate_reserved(1).unwrap();

        // Free alternating frames: two free frames, no run of two.
        map.release(a).unwrap();
        map.release(c).unwrap();
        assert_eq!(map.free_frames(), 2);
        assert_eq!(
            map.allocate_reserved(2),
            Err(VmError::Fatal(FatalError::NoContiguousRun))
        );

        map.release(b).unwrap();
        map.release(d).unwrap();
    }

    #[test]
    fn release_below_region_is_rejected() {
        let map = setup(4);
        assert_eq!(
            map.release(PhysicalAddress::new(0)),
            Err(VmError::Fatal(FatalError::UnmanagedFrame))
        );
    }

    #[test]
    fn release_of_free_frame_is_a_no_op() {
        let map = setup(4);
        let frame = map.allocate_reserved(1).unwrap();
        map.release(frame).unwrap();
        map.release(frame).unwrap();
        assert_eq!(map.free_frames(), 4);
    }

    #[test]
    fn release_of_run_follower_frees_nothing() {
        let map = setup(4);
        let run = map.allocate_reserved(2).unwrap();
        map.release(run + arch::PAGE_SIZE).unwrap();
        assert_eq!(map.free_frames(), 2);

        map.release(run).unwrap();
        assert_eq!(map.free_frames(), 4);
    }
}
