//! Diagnostic counters for the paging subsystem.
//!
//! Counters are diagnostic only: they never affect control flow. Each is a
//! plain atomic, so they can be bumped from any context, including under the
//! frame-table spinlock. At shutdown three consistency equations are checked
//! over the final totals.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

/// The tracked events, one counter each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum VmStat {
    /// Every fault taken, of any kind.
    TlbFault,
    /// Faults whose translation landed in a never-used TLB slot.
    TlbFaultFree,
    /// Faults whose translation replaced a slot round-robin.
    TlbFaultReplace,
    /// Whole-TLB invalidations (address-space switches).
    TlbInvalidation,
    /// Faults on a page already resident: TLB re-established, no data moved.
    TlbReload,
    /// Pages materialized by zero-filling a fresh frame.
    ZeroFill,
    /// Pages materialized from disk (executable image or swap).
    DiskFill,
    /// Page-sized reads from the executable image.
    ExeRead,
    /// Page-sized reads from the swap store.
    SwapRead,
    /// Page-sized writes to the swap store (evictions).
    SwapWrite,
}

const STAT_COUNT: usize = 10;

const STAT_NAMES: [&str; STAT_COUNT] = [
    "TLB faults",
    "TLB faults with free slot",
    "TLB faults with replace",
    "TLB invalidations",
    "TLB reloads",
    "page faults (zeroed)",
    "page faults (disk)",
    "executable reads",
    "swap reads",
    "swap writes",
];

/// The counter set for one kernel instance.
///
/// Initialized zeroed at boot; owned by the [`crate::Vm`] aggregate and passed
/// by reference to whoever records events.
pub struct VmStats {
    counters: [AtomicUsize; STAT_COUNT],
}

impl VmStats {
    /// Creates a zeroed counter set.
    pub const fn new() -> Self {
        Self {
            counters: [const { AtomicUsize::new(0) }; STAT_COUNT],
        }
    }

    /// Increments one counter.
    pub fn record(&self, stat: VmStat) {
        self.counters[stat as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Returns one counter's current value.
    pub fn get(&self, stat: VmStat) -> usize {
        self.counters[stat as usize].load(Ordering::Relaxed)
    }

    /// Checks the cross-counter consistency equations, reporting the first
    /// violation.
    pub fn verify(&self) -> Result<(), StatsInconsistency> {
        match self.violations().first() {
            Some(&violation) => Err(violation),
            None => Ok(()),
        }
    }

    /// Evaluates every consistency equation independently and returns all
    /// violations:
    ///
    /// - total faults = free-slot fills + replacements
    /// - total faults = disk fills + zero fills + warm reloads
    /// - disk fills = executable reads + swap reads
    pub fn violations(&self) -> Vec<StatsInconsistency> {
        let mut violations = Vec::new();
        let faults = self.get(VmStat::TlbFault);

        let installs = self.get(VmStat::TlbFaultFree) + self.get(VmStat::TlbFaultReplace);
        if faults != installs {
            violations.push(StatsInconsistency::FaultsVsInstalls);
        }

        let resolutions =
            self.get(VmStat::DiskFill) + self.get(VmStat::ZeroFill) + self.get(VmStat::TlbReload);
        if faults != resolutions {
            violations.push(StatsInconsistency::FaultsVsResolutions);
        }

        let disk_reads = self.get(VmStat::ExeRead) + self.get(VmStat::SwapRead);
        if self.get(VmStat::DiskFill) != disk_reads {
            violations.push(StatsInconsistency::DiskVsReads);
        }

        violations
    }

    /// Logs every counter and the consistency verdict, one line per violated
    /// equation. Called at shutdown.
    pub fn report(&self) {
        log::info!("paging statistics:");
        for (i, name) in STAT_NAMES.iter().enumerate() {
            log::info!("  {:30} = {}", name, self.counters[i].load(Ordering::Relaxed));
        }
        let violations = self.violations();
        if violations.is_empty() {
            log::info!("statistics are consistent");
        } else {
            for violation in violations {
                log::warn!("statistics inconsistency: {violation:?}");
            }
        }
    }
}

impl Default for VmStats {
    fn default() -> Self {
        Self::new()
    }
}

/// A violated consistency equation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsInconsistency {
    /// Total faults != TLB free fills + replacements.
    FaultsVsInstalls,
    /// Total faults != disk fills + zero fills + reloads.
    FaultsVsResolutions,
    /// Disk fills != executable reads + swap reads.
    DiskVsReads,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_zeroed_and_consistent() {
        let stats = VmStats::new();
        assert_eq!(stats.get(VmStat::TlbFault), 0);
        assert_eq!(stats.verify(), Ok(()));
    }

    #[test]
    fn records_individual_counters() {
        let stats = VmStats::new();
        stats.record(VmStat::SwapWrite);
        stats.record(VmStat::SwapWrite);
        stats.record(VmStat::ZeroFill);
        assert_eq!(stats.get(VmStat::SwapWrite), 2);
        assert_eq!(stats.get(VmStat::ZeroFill), 1);
        assert_eq!(stats.get(VmStat::SwapRead), 0);
    }

    #[test]
    fn consistent_fault_accounting_passes() {
        let stats = VmStats::new();
        // One zero-fill fault into a free slot, one warm reload via replace.
        stats.record(VmStat::TlbFault);
        stats.record(VmStat::TlbFaultFree);
        stats.record(VmStat::ZeroFill);
        stats.record(VmStat::TlbFault);
        stats.record(VmStat::TlbFaultReplace);
        stats.record(VmStat::TlbReload);
        assert_eq!(stats.verify(), Ok(()));
    }

    #[test]
    fn detects_missing_install() {
        let stats = VmStats::new();
        stats.record(VmStat::TlbFault);
        stats.record(VmStat::ZeroFill);
        assert_eq!(stats.verify(), Err(StatsInconsistency::FaultsVsInstalls));
    }

    #[test]
    fn detects_unattributed_disk_fill() {
        let stats = VmStats::new();
        stats.record(VmStat::TlbFault);
        stats.record(VmStat::TlbFaultFree);
        stats.record(VmStat::DiskFill);
        assert_eq!(stats.verify(), Err(StatsInconsistency::DiskVsReads));
    }

    #[test]
    fn reports_every_violated_equation() {
        let stats = VmStats::new();
        // A fault with no install and an unattributed disk fill violate the
        // first and third equations at once; both must surface, not just
        // the first.
        stats.record(VmStat::TlbFault);
        stats.record(VmStat::DiskFill);
        assert_eq!(
            stats.violations(),
            alloc::vec![
                StatsInconsistency::FaultsVsInstalls,
                StatsInconsistency::DiskVsReads,
            ]
        );

        // A second uninstalled, unresolved fault breaks all three.
        stats.record(VmStat::TlbFault);
        assert_eq!(
            stats.violations(),
            alloc::vec![
                StatsInconsistency::FaultsVsInstalls,
                StatsInconsistency::FaultsVsResolutions,
                StatsInconsistency::DiskVsReads,
            ]
        );
    }
}
