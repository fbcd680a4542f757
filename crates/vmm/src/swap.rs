//! The swap store: page-granular backing storage for evicted pages.
//!
//! A fixed-size disk region is carved into page-size slots tracked by a
//! bitmap. All operations serialize through one store-wide lock, and the
//! store never partially commits: a failed write releases the slot it had
//! provisionally claimed.

use alloc::boxed::Box;
use alloc::vec;

use crate::address::PhysicalAddress;
use crate::arch;
use crate::error::{FatalError, IoError, VmError};
use crate::sync::SleepLock;

/// The block device or file backing the swap store.
///
/// Opened once at boot and handed to [`SwapStore::new`]; dropped (closed) at
/// shutdown. The device size determines total swap capacity.
pub trait SwapDevice: Send + Sync {
    /// Returns the device size in bytes.
    fn size(&self) -> u64;

    /// Reads exactly `buf.len()` bytes starting at `offset`.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), IoError>;

    /// Writes all of `buf` starting at `offset`.
    fn write(&self, offset: u64, buf: &[u8]) -> Result<(), IoError>;
}

/// Errors from swap store construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapInitError {
    /// The device size is not an exact multiple of the page size.
    UnalignedSize,
}

/// Errors from swap slot operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapError {
    /// Every slot is occupied.
    OutOfSpace,
    /// The device transfer failed.
    Io(IoError),
}

impl From<IoError> for SwapError {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl From<SwapError> for VmError {
    fn from(err: SwapError) -> Self {
        match err {
            // Running out of swap mid-eviction cannot be recovered from.
            SwapError::OutOfSpace => Self::Fatal(FatalError::SwapExhausted),
            SwapError::Io(io) => Self::Io(io),
        }
    }
}

const BITS_PER_WORD: usize = 64;

struct SwapInner {
    device: Box<dyn SwapDevice>,
    /// One bit per slot; set = occupied.
    bitmap: Box<[u64]>,
    slots: usize,
    used: usize,
}

impl SwapInner {
    fn is_set(&self, slot: usize) -> bool {
        self.bitmap[slot / BITS_PER_WORD] & (1 << (slot % BITS_PER_WORD)) != 0
    }

    fn mark(&mut self, slot: usize) {
        self.bitmap[slot / BITS_PER_WORD] |= 1 << (slot % BITS_PER_WORD);
    }

    fn unmark(&mut self, slot: usize) {
        self.bitmap[slot / BITS_PER_WORD] &= !(1 << (slot % BITS_PER_WORD));
    }

    /// Finds and marks the first free slot.
    fn claim_free(&mut self) -> Option<usize> {
        for (word_index, word) in self.bitmap.iter().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones() as usize;
            let slot = word_index * BITS_PER_WORD + bit;
            if slot >= self.slots {
                break;
            }
            self.mark(slot);
            return Some(slot);
        }
        None
    }
}

/// The swap-slot allocator and backing-store I/O front end.
pub struct SwapStore {
    inner: SleepLock<SwapInner>,
}

impl SwapStore {
    /// Opens the store over `device`, validating its geometry and building
    /// the slot bitmap.
    pub fn new(device: Box<dyn SwapDevice>) -> Result<Self, SwapInitError> {
        let size = device.size();
        if size % arch::PAGE_SIZE as u64 != 0 {
            return Err(SwapInitError::UnalignedSize);
        }
        let slots = (size / arch::PAGE_SIZE as u64) as usize;
        log::info!("swap store opened: {slots} slots");

        Ok(Self {
            inner: SleepLock::new(SwapInner {
                device,
                bitmap: vec![0u64; slots.div_ceil(BITS_PER_WORD)].into_boxed_slice(),
                slots,
                used: 0,
            }),
        })
    }

    /// Returns the store's total capacity in slots.
    pub fn capacity(&self) -> usize {
        self.inner.lock().slots
    }

    /// Returns the number of free slots remaining.
    ///
    /// Consulted before committing to an eviction; a zero here makes the
    /// eviction a fatal condition for the caller.
    pub fn free_slots(&self) -> usize {
        let inner = self.inner.lock();
        inner.slots - inner.used
    }

    /// Writes the page at `frame` out to a freshly allocated slot.
    ///
    /// Returns the slot index. A slot claimed here is not handed out again
    /// until it is released; if the device write fails the slot is released
    /// immediately and the store is unchanged.
    pub fn write_out(&self, frame: PhysicalAddress) -> Result<usize, SwapError> {
        let mut inner = self.inner.lock();
        let slot = inner.claim_free().ok_or(SwapError::OutOfSpace)?;

        // SAFETY: The caller owns the frame being evicted; the page-table
        // entry that maps it is locked for the duration of the write.
        let bytes = unsafe { frame.frame_bytes_mut() };
        if let Err(err) = inner
            .device
            .write((slot * arch::PAGE_SIZE) as u64, bytes)
        {
            inner.unmark(slot);
            return Err(err.into());
        }

        inner.used += 1;
        Ok(slot)
    }

    /// Reads the contents of `slot` into the frame at `frame`.
    ///
    /// With `release` set the slot is freed immediately (the page is becoming
    /// resident and will not return to this slot); without it the slot stays
    /// allocated, which address-space duplication relies on to read a source
    /// page without disturbing the original's swapped copy.
    pub fn read_in(
        &self,
        slot: usize,
        frame: PhysicalAddress,
        release: bool,
    ) -> Result<(), SwapError> {
        let mut inner = self.inner.lock();
        debug_assert!(inner.is_set(slot), "reading an unallocated swap slot");

        // SAFETY: The caller owns the destination frame; it is not yet mapped
        // anywhere, so nothing else can observe the partial read.
        let bytes = unsafe { frame.frame_bytes_mut() };
        inner.device.read((slot * arch::PAGE_SIZE) as u64, bytes)?;

        if release {
            inner.unmark(slot);
            inner.used -= 1;
        }
        Ok(())
    }

    /// Frees `slot` without reading it. Used at address-space teardown for
    /// pages still swapped out.
    pub fn release_slot(&self, slot: usize) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.is_set(slot), "releasing an unallocated swap slot");
        inner.unmark(slot);
        inner.used -= 1;
    }
}
