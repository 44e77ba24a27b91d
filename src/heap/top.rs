//! The downward-growing external heap.
//!
//! A [`ResizableHeap`] built from the generic arena plus a policy that
//! moves the heap's lower edge: growth lowers `floor` and donates the new
//! stretch to the arena, and a block freeing at `floor` raises it back.
//! The claimed extent `[floor, ceiling)` is kept registered at all times.

use log_crate::debug;

use crate::arena::{Arena, ArenaPolicy, MIN_ALIGN};
use crate::heap::{ResizableHeap, HEAP_NAME};
use crate::map::{Memory, MemoryPlatform};
use crate::types::{align_down, align_up, PhysicalAddress};

/// Extent claimed from the chosen region. `limit <= floor <= ceiling`.
struct Extent {
    /// Lowest address the heap may ever claim.
    limit: PhysicalAddress,
    /// Current lowest claimed address.
    floor: PhysicalAddress,
    /// Fixed top of the chosen region.
    ceiling: PhysicalAddress,
}

/// External heap growing downward from the top of the largest usable region.
pub struct TopHeap {
    arena: Arena,
    extent: Option<Extent>,
}

impl TopHeap {
    pub const fn new() -> TopHeap {
        TopHeap {
            arena: Arena::new(),
            extent: None,
        }
    }

    /// Free bytes currently held by the underlying arena.
    pub fn free_bytes(&self) -> usize {
        self.arena.free_bytes()
    }

    /// The claimed `(floor, ceiling)` pair, once active.
    pub fn extent(&self) -> Option<(PhysicalAddress, PhysicalAddress)> {
        self.extent.as_ref().map(|e| (e.floor, e.ceiling))
    }

    /// Pick the backing region on first use. The empty claim at the ceiling
    /// is registered immediately so later map descriptions already carry
    /// the heap's name.
    fn activate<P: MemoryPlatform>(&mut self, ctx: &mut Memory<P>) -> bool {
        if self.extent.is_some() {
            return true;
        }
        let (start, len) = match ctx.largest_usable() {
            Some(found) => found,
            None => {
                debug!("HEAP found no usable region");
                return false;
            }
        };
        let limit = start.next_aligned(MIN_ALIGN);
        let ceiling = match start.raw().checked_add(len) {
            Some(end) => PhysicalAddress::new(align_down(end, MIN_ALIGN)),
            None => PhysicalAddress::new(align_down(usize::MAX, MIN_ALIGN)),
        };
        if ceiling <= limit {
            debug!("HEAP region [{}, +0x{:x}) too small", start, len);
            return false;
        }
        debug!("HEAP activating below {} down to {}", ceiling, limit);
        ctx.used_mut().update(HEAP_NAME, ceiling, 0);
        self.extent = Some(Extent {
            limit,
            floor: ceiling,
            ceiling,
        });
        true
    }
}

/// Arena policy view over the heap's extent and the map context.
struct TopPolicy<'a, P: MemoryPlatform> {
    extent: &'a mut Extent,
    ctx: &'a mut Memory<P>,
}

impl<'a, P: MemoryPlatform> TopPolicy<'a, P> {
    fn register(&mut self) {
        let size = self.extent.ceiling - self.extent.floor;
        self.ctx.used_mut().update(HEAP_NAME, self.extent.floor, size);
    }
}

impl<'a, P: MemoryPlatform> ArenaPolicy for TopPolicy<'a, P> {
    fn grow(&mut self, failed_size: usize) -> Option<(PhysicalAddress, usize)> {
        let size = align_up(failed_size, MIN_ALIGN);
        if size > self.extent.floor - self.extent.limit {
            debug!("HEAP cannot grow by 0x{:x}", size);
            return None;
        }
        self.extent.floor = self.extent.floor - size;
        self.register();
        Some((self.extent.floor, size))
    }

    fn shrink(&mut self, start: PhysicalAddress, size: usize) -> bool {
        // Only the lowest block can be given back.
        if start != self.extent.floor {
            return false;
        }
        self.extent.floor = self.extent.floor + size;
        self.register();
        true
    }
}

impl<P: MemoryPlatform> ResizableHeap<P> for TopHeap {
    fn realloc(
        &mut self,
        ctx: &mut Memory<P>,
        old: Option<PhysicalAddress>,
        new_size: usize,
    ) -> Option<PhysicalAddress> {
        if !self.activate(ctx) {
            return None;
        }
        let extent = match self.extent.as_mut() {
            Some(extent) => extent,
            None => return None,
        };
        let mut policy = TopPolicy { extent, ctx };
        self.arena.realloc(&mut policy, old, new_size)
    }
}
