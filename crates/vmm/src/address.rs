//! Address types for physical and virtual memory.
//!
//! This module provides architecture-independent wrappers around physical and virtual
//! addresses, together with the page arithmetic used by address spaces and the page scanner.

use core::fmt;
use core::ops::{Add, Sub};

/// Size of a virtual page (and of a physical frame) in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Returns the number of pages needed to cover `bytes`.
#[inline]
pub const fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}

/// Returns true if `value` is a multiple of [`PAGE_SIZE`].
#[inline]
pub const fn is_page_aligned(value: usize) -> bool {
    value % PAGE_SIZE == 0
}

/// Macro to define common address type functionality.
///
/// Both address kinds are plain `usize` newtypes; the macro keeps their arithmetic and
/// formatting identical while keeping the two types from being mixed up.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new address.
            #[inline]
            pub const fn new(addr: usize) -> Self {
                Self(addr)
            }

            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Returns true if the address sits on a page boundary.
            #[inline]
            pub const fn is_page_aligned(self) -> bool {
                self.is_aligned(PAGE_SIZE)
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Aligns the address up to the given alignment, returning `None` on overflow.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn checked_align_up(self, align: usize) -> Option<Self> {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                match self.0.checked_add(align - 1) {
                    Some(value) => Some(Self(value & !(align - 1))),
                    None => None,
                }
            }

            /// Adds a byte offset, returning `None` on overflow.
            #[inline]
            pub const fn checked_add(self, offset: usize) -> Option<Self> {
                match self.0.checked_add(offset) {
                    Some(value) => Some(Self(value)),
                    None => None,
                }
            }

            /// Returns the page-aligned address of the page containing this address.
            #[inline]
            pub const fn page_base(self) -> Self {
                self.align_down(PAGE_SIZE)
            }
        }

        impl fmt::Pointer for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:p}", self.0 as *const u8)
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

        impl From<usize> for $name {
            #[inline]
            fn from(addr: usize) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self(self.0 - rhs)
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
    "A physical memory address.\n\n\
     Physical addresses are produced by translation-map queries and used to look up page\n\
     metadata in the page registry."
);

impl PhysicalAddress {
    /// Returns the frame index of this address (the address divided by the page size).
    #[inline]
    pub const fn frame_index(self) -> usize {
        self.0 / PAGE_SIZE
    }

    /// Returns the physical address of the first byte of frame `index`.
    #[inline]
    pub const fn from_frame_index(index: usize) -> Self {
        Self(index * PAGE_SIZE)
    }
}

impl_address_common!(
    VirtualAddress,
    "A virtual memory address.\n\n\
     Virtual addresses delimit address spaces and regions and are the key of every\n\
     translation-map operation."
);

impl VirtualAddress {
    /// Returns the address of the page following the one containing this address, or `None`
    /// if that would overflow the address width.
    #[inline]
    pub const fn next_page(self) -> Option<Self> {
        self.page_base().checked_add(PAGE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_helpers() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(PAGE_SIZE), 1);
        assert_eq!(pages_for(PAGE_SIZE + 1), 2);
        assert!(is_page_aligned(0x3000));
        assert!(!is_page_aligned(0x3001));
    }

    #[test]
    fn alignment() {
        let addr = VirtualAddress::new(0x1234);
        assert_eq!(addr.align_down(PAGE_SIZE), VirtualAddress::new(0x1000));
        assert_eq!(
            addr.checked_align_up(PAGE_SIZE),
            Some(VirtualAddress::new(0x2000))
        );
        assert_eq!(VirtualAddress::new(usize::MAX).checked_align_up(PAGE_SIZE), None);
        assert!(VirtualAddress::new(0x2000).is_page_aligned());
    }

    #[test]
    fn next_page_stops_at_the_top_of_the_address_width() {
        assert_eq!(
            VirtualAddress::new(0x1fff).next_page(),
            Some(VirtualAddress::new(0x2000))
        );
        assert_eq!(VirtualAddress::new(usize::MAX).next_page(), None);
    }

    #[test]
    fn frame_index_round_trips_through_page_size() {
        let phys = PhysicalAddress::from_frame_index(7);
        assert_eq!(phys.as_usize(), 7 * PAGE_SIZE);
        assert_eq!(phys.frame_index(), 7);
        assert_eq!((phys + 12).frame_index(), 7);
    }

    #[test]
    fn formatting() {
        let addr = VirtualAddress::new(0x4000);
        assert_eq!(format!("{}", addr), "0x4000");
        assert_eq!(format!("{:?}", addr), "VirtualAddress(0x4000)");
    }
}
