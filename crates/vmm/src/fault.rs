//! The page-fault handler.
//!
//! Every TLB miss lands here. The handler classifies the fault, finds the
//! page's entry, materializes the page if it is not resident (zero-fill,
//! executable read, or swap-in), and installs the translation. The page-table
//! lock is dropped around frame allocation because allocation may evict,
//! and eviction takes the same lock.

use crate::address::VirtualAddress;
use crate::addrspace::AddressSpace;
use crate::error::{FatalError, VmError};
use crate::stats::VmStat;
use crate::vm::Vm;

/// The kind of access that missed in the TLB, as reported by the trap frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// A read missed.
    Read,
    /// A write missed.
    Write,
    /// A write hit an entry installed without the writable bit.
    ReadOnly,
}

pub(crate) fn handle_fault(
    vm: &Vm,
    space: Option<&AddressSpace>,
    kind: FaultKind,
    vaddr: VirtualAddress,
) -> Result<(), VmError> {
    vm.stats().record(VmStat::TlbFault);

    // Faults can only arrive once a process with an address space is
    // running; anything earlier is a kernel bug the trap layer handles.
    let Some(space) = space else {
        return Err(VmError::NoContext);
    };

    // Translations are installed writable regardless of segment permissions,
    // so the hardware never raises this; seeing it means TLB state is
    // corrupt.
    if kind == FaultKind::ReadOnly {
        return Err(VmError::Fatal(FatalError::ReadOnlyFault(vaddr)));
    }

    let page = vaddr.page_align_down();
    let segment = space
        .segment_for(page)
        .ok_or(VmError::Fatal(FatalError::SegmentNotFound(vaddr)))?;

    let mut table = space.page_table().lock();
    let index = table
        .find_by_vaddr(page)
        .ok_or(VmError::Fatal(FatalError::PageEntryMissing(vaddr)))?;

    let entry = table.entry(index);
    let frame = if let Some(frame) = entry.frame() {
        // Resident: the TLB entry was lost (invalidated or replaced), the
        // page never moved.
        vm.stats().record(VmStat::TlbReload);
        frame
    } else if let Some(slot) = entry.swap_slot() {
        // Swapped out. The allocator may need to evict, which takes this
        // table's lock itself.
        drop(table);
        let frame = vm.allocate_user_frame(page, space)?;
        table = space.page_table().lock();
        vm.swap().read_in(slot, frame, true)?;
        table.entry_mut(index).set_resident(frame);
        vm.stats().record(VmStat::SwapRead);
        vm.stats().record(VmStat::DiskFill);
        frame
    } else {
        // First touch (or a clean page discarded at eviction): materialize
        // from the image, or zero-fill if the segment has no backing.
        drop(table);
        let frame = vm.allocate_user_frame(page, space)?;
        // SAFETY: The frame was just allocated for this page and is not yet
        // mapped anywhere.
        let bytes = unsafe { frame.frame_bytes_mut() };
        if segment.file_backed() {
            segment.load_page(space.image(), page, bytes)?;
            vm.stats().record(VmStat::ExeRead);
            vm.stats().record(VmStat::DiskFill);
        } else {
            bytes.fill(0);
            vm.stats().record(VmStat::ZeroFill);
        }
        table = space.page_table().lock();
        table.entry_mut(index).set_resident(frame);
        frame
    };

    let read_only = !table.entry(index).permissions().writable();
    drop(table);

    vm.tlb().load_entry(page, frame, read_only, vm.stats());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::PhysicalAddress;
    use crate::arch;
    use crate::emulation::{emulated_vm, MemoryImage};
    use crate::segment::Permissions;
    use alloc::sync::Arc;
    use alloc::vec;

    const TEXT_BASE: usize = 0x0040_0000;
    const DATA_BASE: usize = 0x1000_0000;

    fn page(base: usize, n: usize) -> VirtualAddress {
        VirtualAddress::new(base + n * arch::PAGE_SIZE)
    }

    /// One read-only text page of 0x7F bytes, one writable data page of 0x2A
    /// bytes, plus the automatic stack.
    fn loaded_space(vm: &Vm) -> AddressSpace {
        let mut data = vec![0x7Fu8; arch::PAGE_SIZE];
        data.extend(vec![0x2Au8; arch::PAGE_SIZE]);
        let mut space = AddressSpace::new(Arc::new(MemoryImage::new(data)));
        space.define_region(
            VirtualAddress::new(TEXT_BASE),
            arch::PAGE_SIZE,
            0,
            arch::PAGE_SIZE,
            Permissions::new(true, false, true),
        );
        space.define_region(
            VirtualAddress::new(DATA_BASE),
            arch::PAGE_SIZE,
            arch::PAGE_SIZE as u64,
            arch::PAGE_SIZE,
            Permissions::new(true, true, false),
        );
        space.prepare(vm).unwrap();
        space
    }

    fn frame_of(space: &AddressSpace, vaddr: VirtualAddress) -> PhysicalAddress {
        space.translate(vaddr).unwrap()
    }

    fn frame_contents(paddr: PhysicalAddress) -> &'static [u8] {
        unsafe { paddr.frame_bytes_mut() }
    }

    #[test]
    fn no_address_space_is_rejected() {
        let vm = emulated_vm(16, 8);
        assert_eq!(
            vm.handle_fault(None, FaultKind::Read, VirtualAddress::new(TEXT_BASE)),
            Err(VmError::NoContext)
        );
    }

    #[test]
    fn read_only_fault_is_fatal() {
        let vm = emulated_vm(16, 8);
        let space = loaded_space(&vm);
        let vaddr = VirtualAddress::new(TEXT_BASE);
        assert_eq!(
            vm.handle_fault(Some(&space), FaultKind::ReadOnly, vaddr),
            Err(VmError::Fatal(FatalError::ReadOnlyFault(vaddr)))
        );
    }

    #[test]
    fn unmapped_address_is_fatal() {
        let vm = emulated_vm(16, 8);
        let space = loaded_space(&vm);
        let vaddr = VirtualAddress::new(0x7000_0000);
        assert_eq!(
            vm.handle_fault(Some(&space), FaultKind::Read, vaddr),
            Err(VmError::Fatal(FatalError::SegmentNotFound(vaddr)))
        );
    }

    #[test]
    fn text_page_loads_from_image() {
        let vm = emulated_vm(16, 8);
        let space = loaded_space(&vm);
        let vaddr = page(TEXT_BASE, 0);

        vm.handle_fault(Some(&space), FaultKind::Read, vaddr).unwrap();

        let frame = frame_of(&space, vaddr);
        assert!(frame_contents(frame).iter().all(|&b| b == 0x7F));
        assert_eq!(vm.stats().get(VmStat::ExeRead), 1);
        assert_eq!(vm.stats().get(VmStat::DiskFill), 1);
        // Installed without the writable bit.
        assert_eq!(vm.tlb().lookup(vaddr), Some((frame, false)));
    }

    #[test]
    fn data_page_reads_at_its_file_offset() {
        let vm = emulated_vm(16, 8);
        let space = loaded_space(&vm);
        let vaddr = page(DATA_BASE, 0);

        vm.handle_fault(Some(&space), FaultKind::Write, vaddr).unwrap();

        let frame = frame_of(&space, vaddr);
        assert!(frame_contents(frame).iter().all(|&b| b == 0x2A));
        assert_eq!(vm.tlb().lookup(vaddr), Some((frame, true)));
    }

    #[test]
    fn stack_page_zero_fills() {
        let vm = emulated_vm(16, 8);
        let space = loaded_space(&vm);
        let vaddr = VirtualAddress::new(arch::USER_SPACE_TOP - arch::PAGE_SIZE);

        vm.handle_fault(Some(&space), FaultKind::Write, vaddr).unwrap();

        assert!(frame_contents(frame_of(&space, vaddr)).iter().all(|&b| b == 0));
        assert_eq!(vm.stats().get(VmStat::ZeroFill), 1);
        assert_eq!(vm.stats().get(VmStat::DiskFill), 0);
    }

    #[test]
    fn sub_page_address_faults_its_page() {
        let vm = emulated_vm(16, 8);
        let space = loaded_space(&vm);

        vm.handle_fault(
            Some(&space),
            FaultKind::Read,
            VirtualAddress::new(TEXT_BASE + 0x123),
        )
        .unwrap();

        assert!(space.translate(VirtualAddress::new(TEXT_BASE)).is_some());
    }

    #[test]
    fn warm_fault_reloads_without_io() {
        let vm = emulated_vm(16, 8);
        let space = loaded_space(&vm);
        let vaddr = page(TEXT_BASE, 0);

        vm.handle_fault(Some(&space), FaultKind::Read, vaddr).unwrap();
        let frame = frame_of(&space, vaddr);

        vm.handle_fault(Some(&space), FaultKind::Read, vaddr).unwrap();
        vm.handle_fault(Some(&space), FaultKind::Read, vaddr).unwrap();

        assert_eq!(frame_of(&space, vaddr), frame);
        assert_eq!(vm.stats().get(VmStat::TlbReload), 2);
        assert_eq!(vm.stats().get(VmStat::ExeRead), 1);
        assert_eq!(vm.stats().verify(), Ok(()));
    }

    #[test]
    fn fault_counters_stay_consistent() {
        let vm = emulated_vm(16, 8);
        let space = loaded_space(&vm);

        vm.handle_fault(Some(&space), FaultKind::Read, page(TEXT_BASE, 0))
            .unwrap();
        vm.handle_fault(Some(&space), FaultKind::Write, page(DATA_BASE, 0))
            .unwrap();
        vm.handle_fault(
            Some(&space),
            FaultKind::Write,
            VirtualAddress::new(arch::USER_SPACE_TOP - arch::PAGE_SIZE),
        )
        .unwrap();
        vm.handle_fault(Some(&space), FaultKind::Read, page(TEXT_BASE, 0))
            .unwrap();

        assert_eq!(vm.stats().get(VmStat::TlbFault), 4);
        assert_eq!(vm.stats().verify(), Ok(()));
    }
}
