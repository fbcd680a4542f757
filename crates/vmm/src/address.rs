//! Address types for physical and virtual memory management.
//!
//! Physical and virtual addresses are distinct newtypes validated against the
//! machine's address widths on construction. Physical frames are reached
//! through a process-wide [`AddressTranslator`], which either applies the
//! kernel's direct-map offset or, on the host, indexes into emulated RAM.

use core::fmt;
use core::ops::{Add, Sub};

use crate::arch;

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedRam;

/// Translator between physical addresses and kernel-reachable pointers.
///
/// Two modes:
/// - `Hardware`: the kernel's direct mapping of all physical memory at a
///   fixed virtual offset.
/// - `Emulated`: a host-side RAM buffer for testing.
pub enum AddressTranslator {
    /// Hardware translation through the direct-map offset.
    Hardware { direct_map_offset: usize },
    /// Emulated translation through a simulated RAM region.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedRam),
}

impl AddressTranslator {
    /// Creates a hardware translator with the given direct-map offset.
    pub const fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    /// Creates an emulated translator backed by `size` bytes of RAM.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(EmulatedRam::new(size))
    }

    /// Sets the global address translator.
    ///
    /// Must be called exactly once before any frame memory is touched.
    ///
    /// # Panics
    ///
    /// Panics if the translator has already been set.
    pub fn set_current(translator: AddressTranslator) {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            if ADDRESS_TRANSLATOR.get().is_some() {
                panic!("address translator already set");
            }
            ADDRESS_TRANSLATOR.call_once(|| translator);
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                if t.get().is_some() {
                    panic!("address translator already set");
                }
                t.call_once(|| translator);
            });
        }
    }

    /// Returns the current global address translator.
    ///
    /// # Panics
    ///
    /// Panics if the translator has not been set yet.
    pub fn current() -> &'static AddressTranslator {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            ADDRESS_TRANSLATOR.get().expect(
                "address translator not set; call AddressTranslator::set_current during boot",
            )
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                // SAFETY: The reference is leaked to 'static. In emulation the
                // translator is thread-local, set at most once (spin::Once),
                // and lives for the whole thread.
                unsafe {
                    &*(t.get().expect(
                        "address translator not set; call AddressTranslator::set_current during boot",
                    ) as *const AddressTranslator)
                }
            })
        }
    }

    /// Returns the current translator if one has been set.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn try_current() -> Option<&'static AddressTranslator> {
        ADDRESS_TRANSLATOR.with(|t| {
            t.get().map(|translator| {
                // SAFETY: Same reasoning as current().
                unsafe { &*(translator as *const AddressTranslator) }
            })
        })
    }

    /// Translates a physical address to a kernel-reachable pointer.
    pub fn phys_to_ptr<T>(&self, phys: PhysicalAddress) -> *mut T {
        match self {
            Self::Hardware { direct_map_offset } => {
                phys.as_usize().wrapping_add(*direct_map_offset) as *mut T
            }
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(ram) => ram.translate(phys.as_usize()) as *mut T,
        }
    }

    /// Translates a kernel pointer back to a physical address.
    pub fn ptr_to_phys<T>(&self, ptr: *const T) -> PhysicalAddress {
        match self {
            Self::Hardware { direct_map_offset } => {
                PhysicalAddress::new((ptr as usize).wrapping_sub(*direct_map_offset))
            }
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(ram) => PhysicalAddress::new(ram.ptr_to_phys(ptr as *const u8)),
        }
    }
}

/// Global address translator.
///
/// Initialized once at boot (hardware mode). In test/software-emulation mode
/// this is thread-local so each test owns its emulated RAM.
#[cfg(not(any(test, feature = "software-emulation")))]
static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();
}

/// Defines the structure and methods shared by both address types.
macro_rules! impl_address_common {
    ($name:ident, $validate:path, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new address.
            ///
            /// # Panics
            ///
            /// Panics if the address exceeds the machine's address width.
            #[inline]
            pub const fn new(addr: usize) -> Self {
                assert!($validate(addr), "address exceeds machine address width");
                Self(addr)
            }

            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Checks whether the address is aligned to a page boundary.
            #[inline]
            pub const fn is_page_aligned(self) -> bool {
                self.0 & (arch::PAGE_SIZE - 1) == 0
            }

            /// Aligns the address down to a page boundary.
            #[inline]
            pub const fn page_align_down(self) -> Self {
                Self(self.0 & !(arch::PAGE_SIZE - 1))
            }

            /// Aligns the address up to a page boundary.
            #[inline]
            pub const fn page_align_up(self) -> Self {
                Self((self.0 + arch::PAGE_SIZE - 1) & !(arch::PAGE_SIZE - 1))
            }

            /// Returns the byte offset within the containing page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 & (arch::PAGE_SIZE - 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    arch::validate_physical,
    "A physical memory address.\n\n\
     Newtype wrapper around the machine representation of a physical address,\n\
     with alignment helpers and frame-granular accessors."
);

impl PhysicalAddress {
    /// Returns the zero-based index of the frame containing this address.
    #[inline]
    pub const fn frame_index(self) -> usize {
        self.0 / arch::PAGE_SIZE
    }

    /// Returns the address of the start of frame `index`.
    #[inline]
    pub const fn from_frame_index(index: usize) -> Self {
        Self::new(index * arch::PAGE_SIZE)
    }

    /// Returns the page frame starting at this address as a byte slice.
    ///
    /// # Safety
    ///
    /// The address must be page-aligned and refer to a frame the caller owns
    /// exclusively for the lifetime of the slice. The frame must be reachable
    /// through the current [`AddressTranslator`].
    pub unsafe fn frame_bytes_mut(self) -> &'static mut [u8] {
        debug_assert!(self.is_page_aligned(), "frame access must be page-aligned");
        let ptr = AddressTranslator::current().phys_to_ptr::<u8>(self);
        unsafe { core::slice::from_raw_parts_mut(ptr, arch::PAGE_SIZE) }
    }
}

impl_address_common!(
    VirtualAddress,
    arch::validate_virtual,
    "A virtual memory address.\n\n\
     Newtype wrapper around the machine representation of a virtual address,\n\
     with alignment helpers and page-granular accessors."
);

impl VirtualAddress {
    /// Returns the zero-based index of the page containing this address.
    #[inline]
    pub const fn page_index(self) -> usize {
        self.0 / arch::PAGE_SIZE
    }

    /// Returns true if the address lies within user space.
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < arch::USER_SPACE_TOP
    }
}
