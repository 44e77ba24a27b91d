//! Memory subsystem for a pre-OS network-boot environment.
//!
//! Everything here runs before any operating system exists: physical memory
//! is described by firmware region tables, and the allocators carve their
//! space straight out of those regions. The pieces are
//!
//! * [`map`] - derives a gap-free view of the physical address space from
//!   the platform's raw region tables,
//! * [`used`] - the registry of address ranges this software claims, which
//!   the map folds into its descriptions,
//! * [`pool`] - the fixed internal binary-buddy pool for small metadata
//!   allocations,
//! * [`arena`] - a resizable free-list arena with pluggable grow/shrink
//!   policy,
//! * [`heap`] - the external heap policies for large buffers, built on the
//!   arena (or, for constrained builds, a bare bump scheme).
//!
//! There is no locking anywhere: the execution model is single-threaded
//! and cooperative, and none of these types are safe to touch from an
//! interrupt-style callback.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arena;
pub mod heap;
pub mod map;
pub mod pool;
pub mod types;
pub mod used;

#[cfg(test)]
mod fixture;

pub use heap::{ExternalHeap, ResizableHeap};
pub use map::{Memory, MemoryPlatform, RawRegion, RawRegionKind, Region, RegionFlags};
pub use pool::BuddyPool;
pub use types::PhysicalAddress;
pub use used::{UsedRegion, UsedRegions, UsedSink};
