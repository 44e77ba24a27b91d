//! A physical memory region descriptor.

use core::fmt::{self, Display, Formatter};

use bitflags::bitflags;

use crate::types::PhysicalAddress;

bitflags! {
    /// Classification of a region of the physical address space.
    pub struct RegionFlags: u32 {
        /// Usable RAM.
        const MEMORY = 1 << 0;
        /// Reserved by the platform (firmware tables, MMIO, and the like).
        const RESERVED = 1 << 1;
        /// Claimed by a firmware subsystem; hidden from the loaded OS.
        const USED = 1 << 2;
        /// Beyond the reach of the platform's addressing.
        const INACCESSIBLE = 1 << 3;
    }
}

/// A maximal range of the address space with uniform classification.
///
/// Bounds are stored inclusive: `max` is the last valid byte. Regions are
/// produced only by enumeration and never mutated in place.
#[derive(Debug, Copy, Clone)]
pub struct Region {
    /// First address in the region.
    pub min: PhysicalAddress,
    /// Last address in the region (inclusive).
    pub max: PhysicalAddress,
    /// Classification flags.
    pub flags: RegionFlags,
    /// Name of the used-region claim covering `min`, if any.
    pub name: Option<&'static str>,
}

impl Region {
    /// The region's length in bytes. Wraps to zero for a region spanning the
    /// entire address space; such a region cannot occur below the final
    /// enumeration step on any real platform map.
    pub fn len(&self) -> usize {
        (self.max - self.min).wrapping_add(1)
    }

    /// Whether the region is plain usable RAM: reserved, used, or
    /// inaccessible bytes disqualify it entirely.
    pub fn is_usable(&self) -> bool {
        self.flags == RegionFlags::MEMORY
    }

    /// Whether the given address falls inside the region.
    pub fn contains(&self, address: PhysicalAddress) -> bool {
        self.min <= address && address <= self.max
    }

    /// Whether this is the final region of the partition: `max + 1` would
    /// wrap to zero.
    pub fn is_last(&self) -> bool {
        self.max == PhysicalAddress::MAX
    }
}

impl Display for Region {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "[{}, {}] {:?}", self.min, self.max, self.flags)?;
        if let Some(name) = self.name {
            write!(f, " ({})", name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn region(min: usize, max: usize, flags: RegionFlags) -> Region {
        Region {
            min: PhysicalAddress::new(min),
            max: PhysicalAddress::new(max),
            flags,
            name: None,
        }
    }

    #[test]
    fn usable() {
        assert!(region(0, 0xfff, RegionFlags::MEMORY).is_usable());
        assert!(!region(0, 0xfff, RegionFlags::MEMORY | RegionFlags::USED).is_usable());
        assert!(!region(0, 0xfff, RegionFlags::empty()).is_usable());
    }

    #[test]
    fn len_inclusive() {
        assert_eq!(region(0x1000, 0x1fff, RegionFlags::MEMORY).len(), 0x1000);
        assert_eq!(region(0, usize::MAX, RegionFlags::empty()).len(), 0);
    }

    #[test]
    fn last() {
        assert!(region(0x1000, usize::MAX, RegionFlags::empty()).is_last());
        assert!(!region(0, 0xfff, RegionFlags::empty()).is_last());
    }
}
