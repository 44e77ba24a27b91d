//! The used-region registry: physical ranges claimed by firmware subsystems
//! and excluded from the externally visible memory map.

use alloc::boxed::Box;
use alloc::vec::Vec;

use hashbrown::HashMap;
use log_crate::trace;

use crate::map::{Region, RegionFlags};
use crate::types::PhysicalAddress;

/// An address range claimed by a firmware subsystem.
///
/// Entries persist for the process lifetime; a zero-size entry is inert.
/// Each entry has a single writer: the subsystem that registered it.
#[derive(Debug, Copy, Clone)]
pub struct UsedRegion {
    /// Name of the claiming subsystem.
    pub name: &'static str,
    /// First claimed address.
    pub start: PhysicalAddress,
    /// Length of the claim in bytes.
    pub size: usize,
}

/// Receiver for the externally visible set of claimed regions.
///
/// Real deployments push the union of claims into whatever format the next
/// execution stage reads to discover reserved memory. Synchronization is
/// best-effort: a missing or failing sink never affects the allocators' own
/// bookkeeping.
pub trait UsedSink {
    /// Push the current set of claimed regions.
    fn sync(&mut self, used: &[UsedRegion]);
}

/// The process-wide table of claimed regions.
pub struct UsedRegions {
    entries: HashMap<&'static str, UsedRegion>,
    sink: Option<Box<dyn UsedSink>>,
}

impl UsedRegions {
    /// Create an empty registry with nowhere to report to.
    pub fn new() -> UsedRegions {
        UsedRegions {
            entries: HashMap::new(),
            sink: None,
        }
    }

    /// Create an empty registry reporting to the given sink.
    pub fn with_sink(sink: Box<dyn UsedSink>) -> UsedRegions {
        UsedRegions {
            entries: HashMap::new(),
            sink: Some(sink),
        }
    }

    /// Set the named entry's extent, then re-synchronize. Registers the entry
    /// on first use. Visible to every subsequent `describe()`.
    pub fn update(&mut self, name: &'static str, start: PhysicalAddress, size: usize) {
        // The exclusive end may sit one past the top of the address space.
        trace!(
            "USED {} now [{}, 0x{:x})",
            name,
            start,
            start.raw().wrapping_add(size)
        );
        self.entries
            .insert(name, UsedRegion { name, start, size });
        self.sync();
    }

    /// Push the union of all entries to the sink, if there is one.
    pub fn sync(&mut self) {
        if let Some(ref mut sink) = self.sink {
            let union: Vec<UsedRegion> = self.entries.values().copied().collect();
            sink.sync(&union);
        }
    }

    /// Look up an entry by name.
    pub fn get(&self, name: &str) -> Option<&UsedRegion> {
        self.entries.get(name)
    }

    /// Iterate over all entries.
    pub fn iter(&self) -> impl Iterator<Item = &UsedRegion> {
        self.entries.values()
    }

    /// Overlay the claims onto a region descriptor being built around
    /// `region.min`: flag the covering claim (if any) and truncate `max` so
    /// the region never straddles a claim boundary.
    pub(crate) fn overlay(&self, region: &mut Region) {
        for entry in self.entries.values() {
            if entry.size == 0 {
                continue;
            }
            let last = entry.start + (entry.size - 1);
            if entry.start <= region.min && region.min <= last {
                region.flags |= RegionFlags::USED;
                region.name = Some(entry.name);
                if last < region.max {
                    region.max = last;
                }
            } else if entry.start > region.min {
                let bound = entry.start - 1usize;
                if bound < region.max {
                    region.max = bound;
                }
            }
        }
    }
}

impl Default for UsedRegions {
    fn default() -> UsedRegions {
        UsedRegions::new()
    }
}
