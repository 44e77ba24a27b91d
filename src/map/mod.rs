//! The system physical memory map.
//!
//! The enumerator produces a total, gap-free partition of the address space
//! on every call by querying the platform collaborator and overlaying the
//! used-region registry. Callers must not assume that two consecutive
//! regions carry different flags; merging equal-flag neighbors is the
//! caller's job.

mod region;

pub use region::{Region, RegionFlags};

use log_crate::debug;

use crate::types::PhysicalAddress;
use crate::used::UsedRegions;

/// Classification of a platform-reported memory window.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RawRegionKind {
    /// Normal RAM.
    Usable,
    /// Reserved (firmware tables, ACPI/NVS-equivalent classes, MMIO).
    Reserved,
    /// Beyond the platform's addressable range.
    Inaccessible,
}

/// A normalized region tuple as reported by the platform.
#[derive(Debug, Copy, Clone)]
pub struct RawRegion {
    /// First address of the window.
    pub start: PhysicalAddress,
    /// Length of the window in bytes.
    pub len: usize,
    /// Kind of the window.
    pub kind: RawRegionKind,
}

impl RawRegionKind {
    fn flags(self) -> RegionFlags {
        match self {
            RawRegionKind::Usable => RegionFlags::MEMORY,
            RawRegionKind::Reserved => RegionFlags::RESERVED,
            RawRegionKind::Inaccessible => RegionFlags::INACCESSIBLE,
        }
    }
}

/// The platform memory-map collaborator. How the tuples are discovered
/// (BIOS/EFI/device-tree) is entirely the platform's business.
pub trait MemoryPlatform {
    /// Iterator over the platform's raw region tuples.
    type Regions: Iterator<Item = RawRegion>;

    /// Enumerate the raw region tuples. Called anew for every description,
    /// since the map is re-derived rather than cached.
    fn raw_regions(&self) -> Self::Regions;
}

/// The memory-map context handle: the platform collaborator plus the
/// used-region registry, passed explicitly to everything that needs to
/// consult or claim memory.
pub struct Memory<P: MemoryPlatform> {
    platform: P,
    used: UsedRegions,
}

impl<P: MemoryPlatform> Memory<P> {
    /// Create a context over the given platform with an empty registry.
    pub fn new(platform: P) -> Memory<P> {
        Memory {
            platform,
            used: UsedRegions::new(),
        }
    }

    /// Create a context with a pre-configured registry.
    pub fn with_used(platform: P, used: UsedRegions) -> Memory<P> {
        Memory { platform, used }
    }

    /// The used-region registry.
    pub fn used(&self) -> &UsedRegions {
        &self.used
    }

    /// The used-region registry, for the claiming subsystems.
    pub fn used_mut(&mut self) -> &mut UsedRegions {
        &mut self.used
    }

    /// Describe the region containing `min` (or the nearest region at or
    /// above it, if `min` falls in a gap between platform windows). With
    /// `hide_used`, claims from the registry are overlaid as
    /// [`USED`](RegionFlags::USED).
    pub fn describe(&self, min: PhysicalAddress, hide_used: bool) -> Region {
        let mut region = Region {
            min,
            max: PhysicalAddress::MAX,
            flags: RegionFlags::empty(),
            name: None,
        };

        for raw in self.platform.raw_regions() {
            if raw.len == 0 {
                continue;
            }
            let last = raw.start + (raw.len - 1);
            if raw.start <= min && min <= last {
                // Window covers the start of the region: contribute flags and
                // clip the region to the window.
                region.flags |= raw.kind.flags();
                if last < region.max {
                    region.max = last;
                }
            } else if raw.start > min {
                // Window begins above: the region must end before it.
                let bound = raw.start - 1usize;
                if bound < region.max {
                    region.max = bound;
                }
            }
        }

        if hide_used {
            self.used.overlay(&mut region);
        }

        region
    }

    /// Iterate the full partition of the address space.
    pub fn regions(&self, hide_used: bool) -> Regions<P> {
        Regions {
            map: self,
            next: Some(PhysicalAddress::new(0)),
            hide_used,
        }
    }

    /// The largest region of plain usable RAM, as `(start, len)`.
    pub fn largest_usable(&self) -> Option<(PhysicalAddress, usize)> {
        let mut best: Option<(PhysicalAddress, usize)> = None;
        for region in self.regions(true) {
            if !region.is_usable() {
                continue;
            }
            let len = region.len();
            if len != 0 && best.map_or(true, |(_, best_len)| len > best_len) {
                best = Some((region.min, len));
            }
        }
        best
    }

    /// Dump the full region partition and the raw claims. Diagnostic use
    /// only.
    pub fn dump(&self) {
        debug!("MAP region partition:");
        for region in self.regions(true) {
            debug!("  {}", region);
        }
        debug!("MAP claims:");
        for entry in self.used.iter() {
            debug!(
                "  [{}, 0x{:x}) ({})",
                entry.start,
                entry.start.raw().wrapping_add(entry.size),
                entry.name
            );
        }
    }
}

/// Iterator over the region partition. Steps by `prev.max + 1` and
/// terminates once `max` would wrap past the top of the address space.
pub struct Regions<'a, P: MemoryPlatform> {
    map: &'a Memory<P>,
    next: Option<PhysicalAddress>,
    hide_used: bool,
}

impl<'a, P: MemoryPlatform> Iterator for Regions<'a, P> {
    type Item = Region;

    fn next(&mut self) -> Option<Region> {
        let min = self.next?;
        let region = self.map.describe(min, self.hide_used);
        debug_assert!(region.max >= region.min);
        self.next = region.max.checked_add(1);
        Some(region)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use alloc::vec::Vec;

    use crate::fixture::FakePlatform;

    fn raw(start: usize, len: usize, kind: RawRegionKind) -> RawRegion {
        RawRegion {
            start: PhysicalAddress::new(start),
            len,
            kind,
        }
    }

    fn platform() -> FakePlatform {
        // Low RAM, a reserved hole, high RAM, then nothing addressable.
        FakePlatform::new(vec![
            raw(0x1000, 0x4000, RawRegionKind::Usable),
            raw(0x3000, 0x1000, RawRegionKind::Reserved),
            raw(0x10000, 0x10000, RawRegionKind::Usable),
            raw(0x20000, usize::MAX - 0x20000 + 1, RawRegionKind::Inaccessible),
        ])
    }

    #[test]
    fn partition_is_total_and_gap_free() {
        let memory = Memory::new(platform());
        let mut cursor = PhysicalAddress::new(0);
        let mut saw_last = false;
        for region in memory.regions(false) {
            assert_eq!(region.min, cursor);
            assert!(region.max >= region.min);
            if region.is_last() {
                saw_last = true;
                break;
            }
            cursor = region.max + 1usize;
        }
        assert!(saw_last);
    }

    #[test]
    fn describe_applies_window_flags() {
        let memory = Memory::new(platform());

        let gap = memory.describe(PhysicalAddress::new(0), false);
        assert_eq!(gap.flags, RegionFlags::empty());
        assert_eq!(gap.max, PhysicalAddress::new(0xfff));

        let ram = memory.describe(PhysicalAddress::new(0x1000), false);
        assert_eq!(ram.flags, RegionFlags::MEMORY);
        assert_eq!(ram.max, PhysicalAddress::new(0x2fff));

        let hole = memory.describe(PhysicalAddress::new(0x3000), false);
        assert_eq!(hole.flags, RegionFlags::MEMORY | RegionFlags::RESERVED);
        assert_eq!(hole.max, PhysicalAddress::new(0x3fff));

        let top = memory.describe(PhysicalAddress::new(0x20000), false);
        assert_eq!(top.flags, RegionFlags::INACCESSIBLE);
        assert!(top.is_last());
    }

    #[test]
    fn describe_mid_region() {
        let memory = Memory::new(platform());
        let region = memory.describe(PhysicalAddress::new(0x18000), false);
        assert_eq!(region.min, PhysicalAddress::new(0x18000));
        assert_eq!(region.max, PhysicalAddress::new(0x1ffff));
        assert_eq!(region.flags, RegionFlags::MEMORY);
    }

    #[test]
    fn used_claims_are_overlaid() {
        let mut memory = Memory::new(platform());
        memory
            .used_mut()
            .update("heap", PhysicalAddress::new(0x18000), 0x8000);

        let hidden = memory.describe(PhysicalAddress::new(0x18000), true);
        assert!(hidden.flags.contains(RegionFlags::USED));
        assert_eq!(hidden.name, Some("heap"));
        assert_eq!(hidden.max, PhysicalAddress::new(0x1ffff));

        let visible = memory.describe(PhysicalAddress::new(0x18000), false);
        assert_eq!(visible.flags, RegionFlags::MEMORY);

        // The region below the claim is truncated at the claim boundary.
        let below = memory.describe(PhysicalAddress::new(0x10000), true);
        assert_eq!(below.max, PhysicalAddress::new(0x17fff));
        assert!(below.is_usable());
    }

    #[test]
    fn largest_usable_ignores_disqualified_regions() {
        let mut memory = Memory::new(platform());

        // High RAM (0x10000 bytes) beats the low RAM fragments.
        assert_eq!(
            memory.largest_usable(),
            Some((PhysicalAddress::new(0x10000), 0x10000))
        );

        // Claiming part of it splits the candidates.
        memory
            .used_mut()
            .update("image", PhysicalAddress::new(0x14000), 0x1000);
        assert_eq!(
            memory.largest_usable(),
            Some((PhysicalAddress::new(0x15000), 0xb000))
        );
    }

    #[test]
    fn no_usable_memory() {
        let memory = Memory::new(FakePlatform::new(vec![raw(
            0,
            0x1000,
            RawRegionKind::Reserved,
        )]));
        assert_eq!(memory.largest_usable(), None);
    }

    #[test]
    fn dump_renders_top_of_memory_claims() {
        crate::fixture::capture_logs();
        let mut memory = Memory::new(platform());
        memory
            .used_mut()
            .update("tables", PhysicalAddress::new(usize::MAX - 0xfff), 0x1000);
        memory.dump();
    }

    #[test]
    fn flags_equal_neighbors_are_not_merged() {
        // Two abutting usable windows still enumerate as two regions.
        let memory = Memory::new(FakePlatform::new(vec![
            raw(0x1000, 0x1000, RawRegionKind::Usable),
            raw(0x2000, 0x1000, RawRegionKind::Usable),
        ]));
        let regions: Vec<Region> = memory.regions(false).collect();
        assert_eq!(regions[1].min, PhysicalAddress::new(0x1000));
        assert_eq!(regions[1].max, PhysicalAddress::new(0x1fff));
        assert_eq!(regions[2].min, PhysicalAddress::new(0x2000));
        assert_eq!(regions[2].max, PhysicalAddress::new(0x2fff));
    }
}
