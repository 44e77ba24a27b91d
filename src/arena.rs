//! A generic free-list arena over one or more backing extents, with
//! pluggable grow/shrink policy.
//!
//! The arena never decides *where* to grow: when a search fails it asks its
//! policy for more space of at least the given size, and whenever a block
//! becomes free (after coalescing with its neighbors) it reports the block
//! to the policy, which may reclaim the backing store outright. A resizable
//! heap is this arena plus a policy that moves an edge.

use core::cmp::min;
use core::mem::size_of;
use core::ptr;

use log_crate::{debug, trace};

use crate::types::{align_up, PhysicalAddress};

/// Node embedded at the start of every free block.
#[derive(Copy, Clone)]
struct FreeBlock {
    size: usize,
    next: Option<PhysicalAddress>,
}

impl FreeBlock {
    /// Read the node at `addr`.
    /// # Safety
    /// `addr` must be the start of a live free block of this arena.
    unsafe fn read(addr: PhysicalAddress) -> FreeBlock {
        addr.as_mut_ptr::<FreeBlock>().read()
    }

    /// Write a node at `addr`.
    /// # Safety
    /// The arena must own `[addr, addr + size)` and nothing else may refer
    /// to those bytes.
    unsafe fn write(addr: PhysicalAddress, block: FreeBlock) {
        addr.as_mut_ptr::<FreeBlock>().write(block)
    }

    /// Relink the node at `addr` to point at `next`.
    /// # Safety
    /// As for [`read`](FreeBlock::read).
    unsafe fn set_next(addr: PhysicalAddress, next: Option<PhysicalAddress>) {
        let mut block = FreeBlock::read(addr);
        block.next = next;
        FreeBlock::write(addr, block);
    }
}

/// Free block alignment: a power of two large enough to hold a node.
pub const MIN_ALIGN: usize = 4 * size_of::<usize>();

/// Grow/shrink policy hooks for a resizable arena.
pub trait ArenaPolicy {
    /// The arena failed to find a block of `failed_size` bytes. Return a new
    /// backing extent of at least that many bytes (aligned to the arena's
    /// block alignment) for the arena to absorb, or `None` if no more space
    /// can be found. On success the arena retries the search exactly once.
    fn grow(&mut self, failed_size: usize) -> Option<(PhysicalAddress, usize)>;

    /// A coalesced block has become free. Return true to reclaim its
    /// backing store: the arena then discards the block instead of keeping
    /// it on the free list.
    fn shrink(&mut self, start: PhysicalAddress, size: usize) -> bool;
}

/// A policy that never grows or shrinks: a fixed arena.
pub struct Fixed;

impl ArenaPolicy for Fixed {
    fn grow(&mut self, _failed_size: usize) -> Option<(PhysicalAddress, usize)> {
        None
    }

    fn shrink(&mut self, _start: PhysicalAddress, _size: usize) -> bool {
        false
    }
}

/// A free-list arena allocator.
pub struct Arena {
    /// Address-ordered free list.
    head: Option<PhysicalAddress>,
    /// Free block alignment.
    align: usize,
    /// Alignment of pointers handed out by [`realloc`](Arena::realloc).
    ptr_align: usize,
    /// Free bytes.
    freemem: usize,
    /// Bytes currently allocated.
    usedmem: usize,
    /// High-water mark of allocated bytes.
    maxusedmem: usize,
}

impl Arena {
    /// Create an empty arena with the default alignment configuration.
    pub const fn new() -> Arena {
        Arena::with_align(MIN_ALIGN, size_of::<usize>())
    }

    /// Create an empty arena with the given block and pointer alignments.
    /// Both must be powers of two, `align` no smaller than a free block
    /// node and no smaller than `ptr_align`.
    pub const fn with_align(align: usize, ptr_align: usize) -> Arena {
        assert!(align.is_power_of_two() && ptr_align.is_power_of_two());
        assert!(align >= size_of::<FreeBlock>());
        assert!(align >= ptr_align);
        Arena {
            head: None,
            align,
            ptr_align,
            freemem: 0,
            usedmem: 0,
            maxusedmem: 0,
        }
    }

    /// Free bytes on the free list.
    pub fn free_bytes(&self) -> usize {
        self.freemem
    }

    /// Bytes currently allocated.
    pub fn used_bytes(&self) -> usize {
        self.usedmem
    }

    /// High-water mark of allocated bytes.
    pub fn max_used_bytes(&self) -> usize {
        self.maxusedmem
    }

    /// Size of the inline header preceding each reallocatable block.
    fn header(&self) -> usize {
        align_up(size_of::<usize>(), self.ptr_align)
    }

    /// Add a backing extent. `start` and `len` must match the arena's block
    /// alignment.
    pub fn populate(&mut self, start: PhysicalAddress, len: usize) {
        assert!(start.is_aligned(self.align));
        assert!(len % self.align == 0);
        debug!("ARENA populating [{}, {})", start, start + len);

        // Straight onto the free list; populated memory counts as free, not
        // used, so the usage statistics are untouched.
        self.insert_free(start, len);
        self.check_blocks();
    }

    /// Allocate a block of `size` bytes aligned to `align` (a power of two,
    /// or zero for no particular alignment), consulting the policy's grow
    /// hook on exhaustion. `None` on exhaustion or zero size.
    pub fn alloc_block<P: ArenaPolicy>(
        &mut self,
        policy: &mut P,
        size: usize,
        align: usize,
    ) -> Option<PhysicalAddress> {
        assert!(align == 0 || align.is_power_of_two());
        self.check_blocks();

        // Round up to whole aligned blocks; a zero result means the request
        // was zero or the rounding overflowed.
        let actual_size = size.checked_add(self.align - 1)? & !(self.align - 1);
        if actual_size == 0 {
            return None;
        }
        let align = if align == 0 { 1 } else { align };
        let align_mask = (align - 1) | (self.align - 1);

        trace!("ARENA allocating 0x{:x} (aligned 0x{:x})", size, align);
        let mut grown = false;
        loop {
            // Search the free list for the first block with enough space.
            let mut prev: Option<PhysicalAddress> = None;
            let mut cur = self.head;
            while let Some(addr) = cur {
                let node = unsafe { FreeBlock::read(addr) };
                let pre_size = addr.raw().wrapping_neg() & align_mask;
                if node.size < pre_size || node.size - pre_size < actual_size {
                    prev = cur;
                    cur = node.next;
                    continue;
                }
                let post_size = node.size - pre_size - actual_size;

                // Split into pre-block, block, and post-block. The pre and
                // post fragments are multiples of the block alignment and so
                // always large enough to carry a node.
                let block = addr + pre_size;
                let post = block + actual_size;
                if post_size != 0 {
                    debug_assert!(post_size >= size_of::<FreeBlock>());
                    unsafe {
                        FreeBlock::write(
                            post,
                            FreeBlock {
                                size: post_size,
                                next: node.next,
                            },
                        )
                    };
                }
                let after = if post_size != 0 { Some(post) } else { node.next };
                if pre_size != 0 {
                    debug_assert!(pre_size >= size_of::<FreeBlock>());
                    unsafe {
                        FreeBlock::write(
                            addr,
                            FreeBlock {
                                size: pre_size,
                                next: after,
                            },
                        )
                    };
                } else {
                    match prev {
                        None => self.head = after,
                        Some(p) => unsafe { FreeBlock::set_next(p, after) },
                    }
                }

                self.freemem -= actual_size;
                self.usedmem += actual_size;
                if self.usedmem > self.maxusedmem {
                    self.maxusedmem = self.usedmem;
                }
                trace!("ARENA allocated [{}, {})", block, block + actual_size);
                self.check_blocks();
                return Some(block);
            }

            if grown {
                // The policy grew but nothing suitable appeared; give up
                // rather than growing without bound.
                debug!("ARENA failed to allocate 0x{:x} (aligned 0x{:x})", size, align);
                return None;
            }
            trace!("ARENA attempting to grow for 0x{:x}", actual_size);
            match policy.grow(actual_size) {
                Some((start, len)) => {
                    self.populate(start, len);
                    grown = true;
                }
                None => {
                    debug!("ARENA failed to allocate 0x{:x} (aligned 0x{:x})", size, align);
                    return None;
                }
            }
        }
    }

    /// Free a block allocated by [`alloc_block`](Arena::alloc_block), with
    /// the size given at allocation. The coalesced block is offered to the
    /// policy's shrink hook. Freeing `None` is a no-op.
    pub fn free_block<P: ArenaPolicy>(
        &mut self,
        policy: &mut P,
        addr: Option<PhysicalAddress>,
        size: usize,
    ) {
        let addr = match addr {
            Some(addr) => addr,
            None => return,
        };
        assert!(size != 0);
        let actual_size = align_up(size, self.align);
        trace!("ARENA freeing [{}, {})", addr, addr + actual_size);

        let (freeing, merged_size, pred) = self.insert_free(addr, actual_size);
        self.usedmem -= actual_size;

        // Allow the policy to reclaim the coalesced block.
        if policy.shrink(freeing, merged_size) {
            let next = unsafe { FreeBlock::read(freeing) }.next;
            match pred {
                None => self.head = next,
                Some(p) => unsafe { FreeBlock::set_next(p, next) },
            }
            self.freemem -= merged_size;
        }
        self.check_blocks();
    }

    /// Reallocate memory with no particular alignment requirement beyond
    /// the arena's pointer alignment.
    ///
    /// With `old` given, the contents are preserved up to the minimum of
    /// the old and new sizes and the old block is freed; if allocation
    /// fails the old block is left untouched and `None` is returned. A new
    /// size of zero frees the block.
    pub fn realloc<P: ArenaPolicy>(
        &mut self,
        policy: &mut P,
        old: Option<PhysicalAddress>,
        new_size: usize,
    ) -> Option<PhysicalAddress> {
        let header = self.header();
        let mut new_ptr = None;

        // Allocate the new block first; each block carries its total size
        // in an inline header so that the old size can be recovered here.
        if new_size != 0 {
            let total = new_size.checked_add(header)?;
            let block = self.alloc_block(policy, total, self.ptr_align)?;
            unsafe { block.as_mut_ptr::<usize>().write(total) };
            let payload = block + header;
            debug_assert!(payload.is_aligned(self.ptr_align));
            new_ptr = Some(payload);
        }

        if let Some(old_ptr) = old {
            let old_block = old_ptr - header;
            let old_total = unsafe { old_block.as_mut_ptr::<usize>().read() };
            assert!(
                old_total > header,
                "ARENA corrupt block header at {}.",
                old_block
            );
            let old_size = old_total - header;
            if let Some(payload) = new_ptr {
                unsafe {
                    ptr::copy(
                        old_ptr.as_mut_ptr::<u8>(),
                        payload.as_mut_ptr::<u8>(),
                        min(old_size, new_size),
                    )
                };
            }
            self.free_block(policy, Some(old_block), old_total);
        }

        new_ptr
    }

    /// Insert a block into the address-ordered free list, coalescing with
    /// adjacent free neighbors. Returns the coalesced block's address and
    /// size together with its predecessor on the list.
    fn insert_free(
        &mut self,
        addr: PhysicalAddress,
        size: usize,
    ) -> (PhysicalAddress, usize, Option<PhysicalAddress>) {
        // Find the blocks immediately below and above the insertion point.
        let mut pprev: Option<PhysicalAddress> = None;
        let mut prev: Option<PhysicalAddress> = None;
        let mut next = self.head;
        while let Some(block) = next {
            if block > addr {
                break;
            }
            let node = unsafe { FreeBlock::read(block) };
            assert!(
                block + node.size <= addr,
                "ARENA double free of [{}, {}) overlapping [{}, {}).",
                addr,
                addr + size,
                block,
                block + node.size
            );
            pprev = prev;
            prev = next;
            next = node.next;
        }
        if let Some(block) = next {
            assert!(
                addr + size <= block,
                "ARENA double free of [{}, {}) overlapping a following block at {}.",
                addr,
                addr + size,
                block
            );
        }
        self.freemem += size;

        // Merge with the immediately preceding block, or start a new node.
        let (freeing, pred) = match prev {
            Some(p) if p + unsafe { FreeBlock::read(p) }.size == addr => {
                let mut node = unsafe { FreeBlock::read(p) };
                trace!(
                    "ARENA merging [{}, {}) + [{}, {})",
                    p,
                    p + node.size,
                    addr,
                    addr + size
                );
                node.size += size;
                unsafe { FreeBlock::write(p, node) };
                (p, pprev)
            }
            _ => {
                unsafe { FreeBlock::write(addr, FreeBlock { size, next }) };
                match prev {
                    None => self.head = Some(addr),
                    Some(p) => unsafe { FreeBlock::set_next(p, Some(addr)) },
                }
                (addr, prev)
            }
        };

        // Merge with the immediately following block.
        let mut node = unsafe { FreeBlock::read(freeing) };
        if let Some(block) = next {
            if freeing + node.size == block {
                let following = unsafe { FreeBlock::read(block) };
                trace!(
                    "ARENA merging [{}, {}) + [{}, {})",
                    freeing,
                    freeing + node.size,
                    block,
                    block + following.size
                );
                node.size += following.size;
                node.next = following.next;
                unsafe { FreeBlock::write(freeing, node) };
            }
        }

        (freeing, node.size, pred)
    }

    /// Check the integrity of the free list: ascending order, adjacent
    /// blocks merged, sizes and alignment sane.
    fn check_blocks(&self) {
        #[cfg(any(test, debug_assertions, feature = "heap_validation"))]
        {
            let mut prev: Option<(PhysicalAddress, usize)> = None;
            let mut cur = self.head;
            while let Some(addr) = cur {
                let node = unsafe { FreeBlock::read(addr) };
                assert!(addr.is_aligned(self.align));
                assert!(node.size >= size_of::<FreeBlock>());
                assert!(node.size >= self.align);
                if let Some((paddr, psize)) = prev {
                    assert!(
                        addr > paddr + psize,
                        "ARENA adjacent free blocks left unmerged."
                    );
                }
                prev = Some((addr, node.size));
                cur = node.next;
            }
        }
    }

    /// Dump the free list. Diagnostic use only.
    pub fn dump(&self) {
        debug!("ARENA free block list:");
        let mut cur = self.head;
        while let Some(addr) = cur {
            let node = unsafe { FreeBlock::read(addr) };
            debug!("  [{}, {}) (size 0x{:x})", addr, addr + node.size, node.size);
            cur = node.next;
        }
    }
}
