//! Basic types and utilities for dealing with physical memory.

use core::fmt::{self, Debug, Display, Formatter};
use core::ops::{Add, BitXor, Sub};

/// A raw physical address.
pub type RawPhysicalAddress = usize;

/// The previous number with the given alignment.
#[inline]
pub const fn align_down(n: usize, align: usize) -> usize {
    n & !(align - 1)
}

/// The next number with the given alignment.
#[inline]
pub const fn align_up(n: usize, align: usize) -> usize {
    align_down(n + align - 1, align)
}

/// The largest power of two no greater than `n`. Zero for `n == 0`.
#[inline]
pub const fn prev_power_of_two(n: usize) -> usize {
    if n == 0 {
        0
    } else {
        1 << (usize::BITS - 1 - n.leading_zeros())
    }
}

/// A physical address.
///
/// The allocators do all of their arithmetic (alignment, overlap, XOR-buddy)
/// on this newtype; conversion to and from real pointers happens only in
/// [`from_ptr`](PhysicalAddress::from_ptr) and
/// [`as_mut_ptr`](PhysicalAddress::as_mut_ptr), the single place where the
/// firmware's flat physical mapping is assumed.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysicalAddress(RawPhysicalAddress);

impl PhysicalAddress {
    /// The highest representable address.
    pub const MAX: PhysicalAddress = PhysicalAddress(usize::MAX);

    /// Create a new address.
    pub const fn new(address: RawPhysicalAddress) -> PhysicalAddress {
        PhysicalAddress(address)
    }

    /// The underlying address.
    pub const fn raw(&self) -> RawPhysicalAddress {
        self.0
    }

    /// Create a physical address from a pointer under the flat mapping.
    pub fn from_ptr<T>(ptr: *const T) -> PhysicalAddress {
        PhysicalAddress(ptr as usize)
    }

    /// Create a mutable pointer to `T` from the address under the flat
    /// mapping.
    pub fn as_mut_ptr<T>(&self) -> *mut T {
        self.0 as *mut T
    }

    /// Check whether the address has the given alignment.
    pub const fn is_aligned(&self, align: usize) -> bool {
        self.0 % align == 0
    }

    /// Get the next address of the given alignment.
    pub const fn next_aligned(&self, align: usize) -> PhysicalAddress {
        PhysicalAddress(align_up(self.0, align))
    }

    /// Add an offset, or `None` if the result would wrap.
    pub fn checked_add(self, rhs: usize) -> Option<PhysicalAddress> {
        self.0.checked_add(rhs).map(PhysicalAddress)
    }
}

impl Add<usize> for PhysicalAddress {
    type Output = PhysicalAddress;

    fn add(self, rhs: usize) -> PhysicalAddress {
        PhysicalAddress(
            self.0
                .checked_add(rhs)
                .expect("Physical address addition overflowed."),
        )
    }
}

impl Sub<usize> for PhysicalAddress {
    type Output = PhysicalAddress;

    fn sub(self, rhs: usize) -> PhysicalAddress {
        match self.0.overflowing_sub(rhs) {
            (v, false) => PhysicalAddress(v),
            (_, true) => panic!("Physical address subtraction overflowed."),
        }
    }
}

impl Sub<PhysicalAddress> for PhysicalAddress {
    type Output = RawPhysicalAddress;

    fn sub(self, rhs: PhysicalAddress) -> RawPhysicalAddress {
        match self.0.overflowing_sub(rhs.0) {
            (v, false) => v,
            (_, true) => panic!("Physical address subtraction overflowed."),
        }
    }
}

impl BitXor<usize> for PhysicalAddress {
    type Output = PhysicalAddress;

    /// The buddy of a block at this address: `address XOR size`.
    fn bitxor(self, rhs: usize) -> PhysicalAddress {
        PhysicalAddress(self.0 ^ rhs)
    }
}

impl Display for PhysicalAddress {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl Debug for PhysicalAddress {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "PhysicalAddress(0x{:x})", self.0)
    }
}
