//! The legacy single-extent external heap.
//!
//! A strictly weaker but much smaller policy for constrained builds. The
//! heap is one contiguous stretch `[bottom, top)` tiled by headed blocks;
//! `top` is fixed at first use and only the low edge ever moves. Interior
//! blocks can be marked free but their footprint is reclaimed only once
//! everything below them has also freed.

use core::mem::size_of;
use core::ptr;

use log_crate::{debug, trace};

use crate::heap::{ResizableHeap, HEAP_NAME};
use crate::map::{Memory, MemoryPlatform};
use crate::types::{align_down, PhysicalAddress};

/// Payload and block alignment.
const ALIGN: usize = 2 * size_of::<usize>();

/// Header preceding every block's payload.
#[repr(C)]
#[derive(Copy, Clone)]
struct BlockHeader {
    /// Total block size including this header. A multiple of [`ALIGN`].
    size: usize,
    used: bool,
}

/// Padded header size; one alignment unit, so payloads stay aligned.
const HEADER: usize = size_of::<BlockHeader>();

const _: () = assert!(HEADER == ALIGN);

impl BlockHeader {
    /// # Safety
    /// `addr` must be a block header inside the active heap extent.
    unsafe fn read(addr: PhysicalAddress) -> BlockHeader {
        addr.as_mut_ptr::<BlockHeader>().read()
    }

    /// # Safety
    /// The heap must own `[addr, addr + HEADER)`.
    unsafe fn write(addr: PhysicalAddress, header: BlockHeader) {
        addr.as_mut_ptr::<BlockHeader>().write(header)
    }
}

struct BumpExtent {
    /// Lowest address the heap may ever claim.
    limit: PhysicalAddress,
    /// Current lowest claimed address; block headers tile `[bottom, top)`.
    bottom: PhysicalAddress,
    /// Fixed top of the chosen region.
    top: PhysicalAddress,
}

/// Single-extent heap with inline block headers and low-edge reclamation.
pub struct BumpHeap {
    extent: Option<BumpExtent>,
}

impl BumpHeap {
    pub const fn new() -> BumpHeap {
        BumpHeap { extent: None }
    }

    /// The claimed `(bottom, top)` pair, once active.
    pub fn extent(&self) -> Option<(PhysicalAddress, PhysicalAddress)> {
        self.extent.as_ref().map(|e| (e.bottom, e.top))
    }

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
        let limit = start.next_aligned(ALIGN);
        let top = match start.raw().checked_add(len) {
            Some(end) => PhysicalAddress::new(align_down(end, ALIGN)),
            None => PhysicalAddress::new(align_down(usize::MAX, ALIGN)),
        };
        if top <= limit {
            debug!("HEAP region [{}, +0x{:x}) too small", start, len);
            return false;
        }
        debug!("HEAP activating below {} down to {}", top, limit);
        ctx.used_mut().update(HEAP_NAME, top, 0);
        self.extent = Some(BumpExtent {
            limit,
            bottom: top,
            top,
        });
        true
    }

    /// Total block size for a payload of `new_size` bytes, or `None` on
    /// overflow.
    fn block_size(new_size: usize) -> Option<usize> {
        let payload = new_size.checked_add(ALIGN - 1)? & !(ALIGN - 1);
        payload.checked_add(HEADER)
    }

    /// Walk from the low edge, reclaiming consecutive free blocks, then
    /// re-register the claim. Runs after every reallocation.
    fn collect<P: MemoryPlatform>(extent: &mut BumpExtent, ctx: &mut Memory<P>) {
        while extent.bottom < extent.top {
            let header = unsafe { BlockHeader::read(extent.bottom) };
            if header.used {
                break;
            }
            trace!(
                "HEAP reclaiming [{}, {})",
                extent.bottom,
                extent.bottom + header.size
            );
            extent.bottom = extent.bottom + header.size;
        }
        let size = extent.top - extent.bottom;
        ctx.used_mut().update(HEAP_NAME, extent.bottom, size);
        #[cfg(any(test, debug_assertions, feature = "heap_validation"))]
        BumpHeap::check_blocks(extent);
    }

    /// Check that the header chain exactly tiles `[bottom, top)`.
    #[cfg(any(test, debug_assertions, feature = "heap_validation"))]
    fn check_blocks(extent: &BumpExtent) {
        let mut cursor = extent.bottom;
        while cursor < extent.top {
            let header = unsafe { BlockHeader::read(cursor) };
            assert!(header.size >= HEADER && header.size % ALIGN == 0);
            assert!(header.size <= extent.top - cursor);
            cursor = cursor + header.size;
        }
        assert!(
            cursor == extent.top,
            "HEAP block chain does not tile the extent."
        );
    }

    /// The `(size, used)` pairs of the header chain, walked from the low
    /// edge.
    #[cfg(test)]
    pub(crate) fn blocks(&self) -> alloc::vec::Vec<(usize, bool)> {
        let mut chain = alloc::vec::Vec::new();
        if let Some(extent) = &self.extent {
            let mut cursor = extent.bottom;
            while cursor < extent.top {
                let header = unsafe { BlockHeader::read(cursor) };
                chain.push((header.size, header.used));
                cursor = cursor + header.size;
            }
        }
        chain
    }

    /// Sanity-check a caller-supplied pointer, returning its block address
    /// and header.
    fn checked_block(extent: &BumpExtent, ptr: PhysicalAddress) -> (PhysicalAddress, BlockHeader) {
        assert!(
            ptr.is_aligned(ALIGN) && ptr >= extent.bottom + HEADER,
            "HEAP bogus pointer {}.",
            ptr
        );
        let block = ptr - HEADER;
        let header = unsafe { BlockHeader::read(block) };
        assert!(
            header.used && header.size % ALIGN == 0 && header.size <= extent.top - block,
            "HEAP corrupt block header at {}.",
            block
        );
        (block, header)
    }

    /// Allocate a fresh block at the low edge.
    fn push(extent: &mut BumpExtent, total: usize) -> Option<PhysicalAddress> {
        if total > extent.bottom - extent.limit {
            debug!("HEAP cannot grow by 0x{:x}", total);
            return None;
        }
        let block = extent.bottom - total;
        unsafe {
            BlockHeader::write(
                block,
                BlockHeader {
                    size: total,
                    used: true,
                },
            )
        };
        extent.bottom = block;
        trace!("HEAP pushed [{}, {})", block, block + total);
        Some(block + HEADER)
    }

    /// Resize the lowest block in place by moving the low edge. The block's
    /// upper boundary is fixed against its neighbor, so the payload shifts
    /// and is truncated to the smaller of the two sizes.
    fn resize_bottom(
        extent: &mut BumpExtent,
        old_header: BlockHeader,
        total: usize,
    ) -> Option<PhysicalAddress> {
        let end = extent.bottom + old_header.size;
        if total > end - extent.limit {
            debug!("HEAP cannot grow by 0x{:x}", total);
            return None;
        }
        let block = end - total;
        let copy = core::cmp::min(old_header.size, total) - HEADER;
        unsafe {
            ptr::copy(
                (extent.bottom + HEADER).as_mut_ptr::<u8>(),
                (block + HEADER).as_mut_ptr::<u8>(),
                copy,
            );
            BlockHeader::write(
                block,
                BlockHeader {
                    size: total,
                    used: true,
                },
            );
        }
        extent.bottom = block;
        trace!("HEAP resized low block to [{}, {})", block, end);
        Some(block + HEADER)
    }
}

impl<P: MemoryPlatform> ResizableHeap<P> for BumpHeap {
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

        let result = match old {
            None => match BumpHeap::block_size(new_size) {
                Some(total) if new_size != 0 => BumpHeap::push(extent, total),
                _ => None,
            },
            Some(ptr) => {
                let (block, header) = BumpHeap::checked_block(extent, ptr);
                if block == extent.bottom {
                    if new_size == 0 {
                        unsafe { BlockHeader::write(block, BlockHeader { used: false, ..header }) };
                        None
                    } else {
                        match BumpHeap::block_size(new_size) {
                            Some(total) => BumpHeap::resize_bottom(extent, header, total),
                            None => None,
                        }
                    }
                } else if new_size == 0 {
                    // Interior free: the footprint stays until everything
                    // below it has freed too.
                    unsafe { BlockHeader::write(block, BlockHeader { used: false, ..header }) };
                    None
                } else if BumpHeap::block_size(new_size).map_or(false, |t| t <= header.size) {
                    // Interior shrink succeeds without reclaiming anything.
                    Some(ptr)
                } else {
                    debug!("HEAP cannot grow interior block at {}", block);
                    None
                }
            }
        };

        BumpHeap::collect(extent, ctx);
        result
    }
}
