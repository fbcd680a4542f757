//! Host-side stand-ins for the machine.
//!
//! Everything the manager needs from a real platform (RAM geometry, a swap
//! device, an executable image) has an in-memory double here, so the whole
//! paging path runs as ordinary host code. Available to integration harnesses
//! through the `software-emulation` feature.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use crate::address::{AddressTranslator, PhysicalAddress};
use crate::arch;
use crate::coremap::RamGeometry;
use crate::error::IoError;
use crate::segment::ExecutableImage;
use crate::swap::SwapDevice;
use crate::vm::Vm;

/// A fixed memory layout.
pub struct FixedGeometry {
    total_ram: usize,
    first_free: PhysicalAddress,
}

impl FixedGeometry {
    /// Describes `total_ram` bytes of memory with boot allocations ending at
    /// `first_free`.
    pub fn new(total_ram: usize, first_free: usize) -> Self {
        Self {
            total_ram,
            first_free: PhysicalAddress::new(first_free),
        }
    }
}

impl RamGeometry for FixedGeometry {
    fn total_ram(&self) -> usize {
        self.total_ram
    }

    fn first_free(&self) -> PhysicalAddress {
        self.first_free
    }
}

/// A swap device backed by a buffer.
pub struct MemorySwapDevice {
    data: spin::Mutex<Vec<u8>>,
}

impl MemorySwapDevice {
    /// Creates a device holding `slots` pages.
    pub fn new(slots: usize) -> Self {
        Self {
            data: spin::Mutex::new(vec![0u8; slots * arch::PAGE_SIZE]),
        }
    }
}

impl SwapDevice for MemorySwapDevice {
    fn size(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), IoError> {
        let data = self.data.lock();
        let offset = offset as usize;
        let end = offset.checked_add(buf.len()).ok_or(IoError::OutOfRange)?;
        if end > data.len() {
            return Err(IoError::OutOfRange);
        }
        buf.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<(), IoError> {
        let mut data = self.data.lock();
        let offset = offset as usize;
        let end = offset.checked_add(buf.len()).ok_or(IoError::OutOfRange)?;
        if end > data.len() {
            return Err(IoError::OutOfRange);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(())
    }
}

/// An executable image backed by a byte buffer.
pub struct MemoryImage {
    data: Vec<u8>,
}

impl MemoryImage {
    /// Creates an image over `data`.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl ExecutableImage for MemoryImage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), IoError> {
        let offset = offset as usize;
        let end = offset.checked_add(buf.len()).ok_or(IoError::OutOfRange)?;
        if end > self.data.len() {
            return Err(IoError::OutOfRange);
        }
        buf.copy_from_slice(&self.data[offset..end]);
        Ok(())
    }
}

/// Brings up a manager over emulated RAM with `frames` allocatable frames
/// and `swap_slots` pages of swap.
///
/// Sets the thread's address translator if it is not set yet. Sized so the
/// frame table's own footprint does not eat into `frames`.
pub fn emulated_vm(frames: usize, swap_slots: usize) -> Vm {
    if AddressTranslator::try_current().is_none() {
        AddressTranslator::set_current(AddressTranslator::emulated(
            arch::PAGE_SIZE * (frames + 8),
        ));
    }
    let geometry = FixedGeometry::new(arch::PAGE_SIZE * (frames + 2), arch::PAGE_SIZE);
    Vm::bootstrap(&geometry, Box::new(MemorySwapDevice::new(swap_slots)))
        .expect("emulated swap device is page-sized")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_reads_are_bounds_checked() {
        let image = MemoryImage::new(vec![1, 2, 3, 4]);
        let mut buf = [0u8; 2];
        image.read_at(1, &mut buf).unwrap();
        assert_eq!(buf, [2, 3]);
        assert_eq!(image.read_at(3, &mut buf), Err(IoError::OutOfRange));
    }

    #[test]
    fn swap_device_persists_writes() {
        let device = MemorySwapDevice::new(2);
        assert_eq!(device.size(), (2 * arch::PAGE_SIZE) as u64);

        let page = [0x42u8; arch::PAGE_SIZE];
        device.write(arch::PAGE_SIZE as u64, &page).unwrap();

        let mut back = [0u8; arch::PAGE_SIZE];
        device.read(arch::PAGE_SIZE as u64, &mut back).unwrap();
        assert_eq!(back[..], page[..]);
    }

    #[test]
    fn swap_device_rejects_out_of_range() {
        let device = MemorySwapDevice::new(1);
        let page = [0u8; arch::PAGE_SIZE];
        assert_eq!(
            device.write(arch::PAGE_SIZE as u64, &page),
            Err(IoError::OutOfRange)
        );
    }

    #[test]
    fn emulated_vm_is_usable() {
        let vm = emulated_vm(8, 2);
        assert_eq!(vm.coremap().total_frames(), 8);
        assert_eq!(vm.swap().capacity(), 2);
    }
}
