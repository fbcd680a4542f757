//! The assembled virtual memory manager.
//!
//! [`Vm`] owns the four services (frame table, swap store, TLB manager,
//! counters) and wires them together for the trap and process layers:
//! fault handling, address-space activation, and shutdown reporting.
//! Address-space lifecycle operations take `&Vm` so they can reach the
//! same services.

use alloc::boxed::Box;

use crate::address::{PhysicalAddress, VirtualAddress};
use crate::addrspace::AddressSpace;
use crate::coremap::{CoreMap, RamGeometry};
use crate::error::VmError;
use crate::fault::{self, FaultKind};
use crate::stats::VmStats;
use crate::swap::{SwapDevice, SwapInitError, SwapStore};
use crate::tlb::Tlb;

/// The virtual memory manager for one kernel instance.
pub struct Vm {
    coremap: CoreMap,
    swap: SwapStore,
    tlb: Tlb,
    stats: VmStats,
}

impl Vm {
    /// Brings up the manager: opens the swap store over `device` and builds
    /// the frame table over the memory `geometry` describes.
    ///
    /// Called once at boot, after the platform knows its memory layout and
    /// has opened the swap device.
    pub fn bootstrap(
        geometry: &dyn RamGeometry,
        device: Box<dyn SwapDevice>,
    ) -> Result<Self, SwapInitError> {
        let swap = SwapStore::new(device)?;
        let coremap = CoreMap::new(geometry);

        Ok(Self {
            coremap,
            swap,
            tlb: Tlb::new(),
            stats: VmStats::new(),
        })
    }

    /// Handles a TLB miss at `vaddr` on behalf of `space`.
    ///
    /// `space` is the address space of the current process, or `None` for a
    /// kernel thread. On success the translation is installed and the
    /// faulting instruction can be retried; errors go back to the trap layer,
    /// which kills the process or halts the kernel depending on
    /// [`VmError::is_fatal`].
    pub fn handle_fault(
        &self,
        space: Option<&AddressSpace>,
        kind: FaultKind,
        vaddr: VirtualAddress,
    ) -> Result<(), VmError> {
        fault::handle_fault(self, space, kind, vaddr)
    }

    /// Makes `space` the current address space on this processor.
    ///
    /// Cached translations belong to the previous space, so the whole TLB is
    /// invalidated. Kernel threads have no address space and leave the TLB
    /// alone.
    pub fn activate(&self, space: Option<&AddressSpace>) {
        if space.is_some() {
            self.tlb.invalidate_all(&self.stats);
        }
    }

    /// Shuts the manager down, reporting the final counters and their
    /// consistency verdict, and closes the swap device.
    pub fn shutdown(self) {
        self.stats.report();
    }

    /// Returns the frame table.
    pub fn coremap(&self) -> &CoreMap {
        &self.coremap
    }

    /// Returns the swap store.
    pub fn swap(&self) -> &SwapStore {
        &self.swap
    }

    /// Returns the TLB manager.
    pub fn tlb(&self) -> &Tlb {
        &self.tlb
    }

    /// Returns the diagnostic counters.
    pub fn stats(&self) -> &VmStats {
        &self.stats
    }

    /// Allocates one frame for `space`'s page at `vaddr`, evicting from
    /// `space` itself under memory pressure.
    pub(crate) fn allocate_user_frame(
        &self,
        vaddr: VirtualAddress,
        space: &AddressSpace,
    ) -> Result<PhysicalAddress, VmError> {
        self.coremap
            .allocate_owned(vaddr, space, &self.swap, &self.tlb, &self.stats)
    }
}
