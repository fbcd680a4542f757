//! The software-managed translation cache.
//!
//! The hardware TLB has a fixed number of slots, each holding one
//! page-to-frame translation plus a writable bit. The manager fills
//! never-used slots first; once every slot has been written it switches
//! permanently to round-robin replacement. Slot state is guarded by a raw
//! spinlock because translations are installed from the fault path, which
//! runs with interrupts off.

use crate::address::{PhysicalAddress, VirtualAddress};
use crate::arch;
use crate::stats::{VmStat, VmStats};
use crate::sync::RawSpinLock;

#[derive(Debug, Clone, Copy)]
struct TlbSlot {
    vaddr: VirtualAddress,
    paddr: PhysicalAddress,
    writable: bool,
    valid: bool,
}

impl TlbSlot {
    const fn invalid() -> Self {
        Self {
            vaddr: VirtualAddress::new(0),
            paddr: PhysicalAddress::new(0),
            writable: false,
            valid: false,
        }
    }
}

struct TlbInner {
    slots: [TlbSlot; arch::TLB_SLOTS],
    /// Next round-robin victim.
    cursor: usize,
    /// Set once every slot has been written; the free-slot scan is skipped
    /// from then on, even after invalidations empty the cache again.
    filled_once: bool,
}

/// The TLB slot manager.
pub struct Tlb {
    inner: RawSpinLock<TlbInner>,
}

impl Tlb {
    /// Creates a manager with every slot invalid.
    pub const fn new() -> Self {
        Self {
            inner: RawSpinLock::new(TlbInner {
                slots: [TlbSlot::invalid(); arch::TLB_SLOTS],
                cursor: 0,
                filled_once: false,
            }),
        }
    }

    /// Installs a translation for the page at `vaddr`, choosing the slot per
    /// the fill-then-round-robin policy and recording which case was taken.
    ///
    /// Pages are installed writable unless `read_only` is set.
    pub fn load_entry(
        &self,
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
        read_only: bool,
        stats: &VmStats,
    ) {
        debug_assert!(vaddr.is_page_aligned());
        debug_assert!(paddr.is_page_aligned());

        let slot = TlbSlot {
            vaddr,
            paddr,
            writable: !read_only,
            valid: true,
        };
        let mut inner = self.inner.lock();

        // A translation for this page may already be cached (warm reload
        // after the entry went stale). The hardware forbids duplicate tags,
        // so refresh that slot in place.
        if let Some(index) = inner.probe(vaddr) {
            inner.slots[index] = slot;
            stats.record(VmStat::TlbFaultReplace);
            return;
        }

        if !inner.filled_once {
            if let Some(index) = inner.slots.iter().position(|s| !s.valid) {
                inner.slots[index] = slot;
                stats.record(VmStat::TlbFaultFree);
                return;
            }
            inner.filled_once = true;
        }

        let victim = inner.cursor;
        inner.cursor = (inner.cursor + 1) % arch::TLB_SLOTS;
        inner.slots[victim] = slot;
        stats.record(VmStat::TlbFaultReplace);
    }

    /// Invalidates every slot. Called on address-space switch; counted.
    pub fn invalidate_all(&self, stats: &VmStats) {
        let mut inner = self.inner.lock();
        for slot in inner.slots.iter_mut() {
            slot.valid = false;
        }
        stats.record(VmStat::TlbInvalidation);
    }

    /// Invalidates the slot for the page at `vaddr`, if cached.
    ///
    /// Used when a single page is evicted; not counted as an invalidation
    /// (the counter tracks whole-cache flushes).
    pub fn invalidate_page(&self, vaddr: VirtualAddress) {
        let mut inner = self.inner.lock();
        if let Some(index) = inner.probe(vaddr) {
            inner.slots[index].valid = false;
        }
    }

    /// Returns the cached translation and writable bit for the page at
    /// `vaddr`, if any.
    pub fn lookup(&self, vaddr: VirtualAddress) -> Option<(PhysicalAddress, bool)> {
        let inner = self.inner.lock();
        inner
            .probe(vaddr)
            .map(|index| (inner.slots[index].paddr, inner.slots[index].writable))
    }
}

impl TlbInner {
    fn probe(&self, vaddr: VirtualAddress) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.valid && s.vaddr == vaddr)
    }
}

impl Default for Tlb {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(n: usize) -> VirtualAddress {
        VirtualAddress::new(n * arch::PAGE_SIZE)
    }

    fn frame(n: usize) -> PhysicalAddress {
        PhysicalAddress::new(n * arch::PAGE_SIZE)
    }

    #[test]
    fn install_and_lookup() {
        let tlb = Tlb::new();
        let stats = VmStats::new();

        tlb.load_entry(page(1), frame(7), false, &stats);
        assert_eq!(tlb.lookup(page(1)), Some((frame(7), true)));
        assert_eq!(tlb.lookup(page(2)), None);
        assert_eq!(stats.get(VmStat::TlbFaultFree), 1);
    }

    #[test]
    fn read_only_installs_without_writable() {
        let tlb = Tlb::new();
        let stats = VmStats::new();

        tlb.load_entry(page(1), frame(7), true, &stats);
        assert_eq!(tlb.lookup(page(1)), Some((frame(7), false)));
    }

    #[test]
    fn fills_free_slots_before_replacing() {
        let tlb = Tlb::new();
        let stats = VmStats::new();

        for i in 0..arch::TLB_SLOTS {
            tlb.load_entry(page(i + 1), frame(i + 1), false, &stats);
        }
        assert_eq!(stats.get(VmStat::TlbFaultFree), arch::TLB_SLOTS);
        assert_eq!(stats.get(VmStat::TlbFaultReplace), 0);

        // The next install replaces the round-robin victim (slot 0).
        tlb.load_entry(page(100), frame(100), false, &stats);
        assert_eq!(stats.get(VmStat::TlbFaultReplace), 1);
        assert_eq!(tlb.lookup(page(1)), None);
        assert_eq!(tlb.lookup(page(100)), Some((frame(100), true)));
    }

    #[test]
    fn replacement_is_round_robin() {
        let tlb = Tlb::new();
        let stats = VmStats::new();

        for i in 0..arch::TLB_SLOTS {
            tlb.load_entry(page(i + 1), frame(i + 1), false, &stats);
        }
        tlb.load_entry(page(100), frame(100), false, &stats);
        tlb.load_entry(page(101), frame(101), false, &stats);

        // Slots 0 and 1 were overwritten in order.
        assert_eq!(tlb.lookup(page(1)), None);
        assert_eq!(tlb.lookup(page(2)), None);
        assert_eq!(tlb.lookup(page(3)), Some((frame(3), true)));
    }

    #[test]
    fn free_scan_never_resumes_after_fill() {
        let tlb = Tlb::new();
        let stats = VmStats::new();

        for i in 0..arch::TLB_SLOTS {
            tlb.load_entry(page(i + 1), frame(i + 1), false, &stats);
        }
        tlb.invalidate_all(&stats);

        // Every slot is invalid again, but the policy stays round-robin.
        tlb.load_entry(page(200), frame(200), false, &stats);
        assert_eq!(stats.get(VmStat::TlbFaultReplace), 1);
        assert_eq!(stats.get(VmStat::TlbInvalidation), 1);
    }

    #[test]
    fn reinstall_refreshes_in_place() {
        let tlb = Tlb::new();
        let stats = VmStats::new();

        tlb.load_entry(page(1), frame(7), true, &stats);
        tlb.load_entry(page(1), frame(7), false, &stats);

        assert_eq!(tlb.lookup(page(1)), Some((frame(7), true)));
        assert_eq!(stats.get(VmStat::TlbFaultFree), 1);
        assert_eq!(stats.get(VmStat::TlbFaultReplace), 1);
    }

    #[test]
    fn invalidate_page_is_targeted() {
        let tlb = Tlb::new();
        let stats = VmStats::new();

        tlb.load_entry(page(1), frame(1), false, &stats);
        tlb.load_entry(page(2), frame(2), false, &stats);
        tlb.invalidate_page(page(1));

        assert_eq!(tlb.lookup(page(1)), None);
        assert_eq!(tlb.lookup(page(2)), Some((frame(2), true)));
        assert_eq!(stats.get(VmStat::TlbInvalidation), 0);
    }
}
