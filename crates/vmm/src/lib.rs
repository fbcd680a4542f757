//! A demand-paged virtual memory manager for a 32-bit machine with a
//! software-managed TLB.
//!
//! The manager owns everything between the trap layer and physical memory:
//!
//! - [`CoreMap`]: the frame table, allocating reserved runs for paging
//!   structures and single frames for user pages, with same-space eviction
//!   under memory pressure.
//! - [`SwapStore`]: page-granular backing storage for evicted writable pages.
//! - [`Tlb`]: the translation cache, filled free-slot-first and then
//!   round-robin.
//! - [`AddressSpace`]: per-process segments and a flat page table held in
//!   reserved frames.
//! - [`Vm`]: the assembled manager; [`Vm::handle_fault`] is the entry point
//!   for every TLB miss.
//!
//! Physical memory is reached through a process-wide [`AddressTranslator`],
//! either the kernel's direct map or, on a host, emulated RAM, so the entire
//! paging path is testable as ordinary code. The [`emulation`] module (tests
//! and the `software-emulation` feature) provides in-memory doubles for the
//! swap device, executable images, and memory geometry.

#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

extern crate alloc;

mod address;
mod addrspace;
mod arch;
mod coremap;
mod error;
mod fault;
mod page_table;
mod segment;
mod stats;
mod swap;
mod sync;
mod tlb;
mod vm;

#[cfg(any(test, feature = "software-emulation"))]
pub mod emulation;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use addrspace::{AddressSpace, AddressSpaceId};
pub use arch::{PAGE_SIZE, STACK_PAGES, TLB_SLOTS, USER_SPACE_TOP};
pub use coremap::{CoreMap, RamGeometry};
pub use error::{FatalError, IoError, VmError};
pub use fault::FaultKind;
pub use page_table::{PageTable, PageTableEntry};
pub use segment::{ExecutableImage, Permissions, Segment};
pub use stats::{StatsInconsistency, VmStat, VmStats};
pub use swap::{SwapDevice, SwapError, SwapInitError, SwapStore};
pub use sync::{blocking_forbidden, RawSpinLock, SleepLock};
pub use tlb::Tlb;
pub use vm::Vm;
