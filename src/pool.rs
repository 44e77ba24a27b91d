//! The fixed-pool buddy allocator used for the firmware's own internal data
//! structures.
//!
//! The pool manages one or more pre-populated donations of memory and cannot
//! grow. Every free block is a power of two in size, aligned to its own
//! size, and carries its bookkeeping node embedded at its start; the buddy
//! of a block is the equal-sized block at `address XOR size`. The pool keeps
//! no per-allocation metadata: callers must free with the size they
//! originally requested.

use core::cmp::min;
use core::mem::size_of;

use log_crate::{debug, trace};

use crate::types::{prev_power_of_two, PhysicalAddress};

/// Node embedded at the start of every free block.
#[derive(Copy, Clone)]
struct FreeBlock {
    size: usize,
    next: Option<PhysicalAddress>,
}

impl FreeBlock {
    /// Read the node at `addr`.
    /// # Safety
    /// `addr` must be the start of a live free block of this pool.
    unsafe fn read(addr: PhysicalAddress) -> FreeBlock {
        addr.as_mut_ptr::<FreeBlock>().read()
    }

    /// Write a node at `addr`.
    /// # Safety
    /// The pool must own `[addr, addr + size)` and nothing else may refer to
    /// those bytes.
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

/// The minimum block size: the smallest power of two that can hold a free
/// block node.
pub const MIN_BLOCK: usize = size_of::<FreeBlock>().next_power_of_two();

/// Round a requested size up to its block size.
fn block_size(size: usize) -> Option<usize> {
    if size == 0 {
        return None;
    }
    if size < MIN_BLOCK {
        Some(MIN_BLOCK)
    } else {
        size.checked_next_power_of_two()
    }
}

/// A fixed-pool buddy allocator over donated extents.
pub struct BuddyPool {
    /// Address-ordered free list.
    head: Option<PhysicalAddress>,
    /// Free bytes currently in the pool.
    free: usize,
}

impl BuddyPool {
    /// Create an empty pool. Donate memory with
    /// [`populate`](BuddyPool::populate).
    pub const fn new() -> BuddyPool {
        BuddyPool {
            head: None,
            free: 0,
        }
    }

    /// Free bytes currently held.
    pub fn free_bytes(&self) -> usize {
        self.free
    }

    /// Donate an extent to the pool. The extent is split into maximal
    /// self-aligned power-of-two pieces; fragments smaller than
    /// [`MIN_BLOCK`] are dropped. May be called repeatedly with disjoint
    /// extents and never fails.
    pub fn populate(&mut self, start: PhysicalAddress, len: usize) {
        debug!("POOL populating [{}, {})", start, start + len);

        let mut start = start;
        let mut len = len;
        while len >= MIN_BLOCK {
            // The largest piece that is aligned to its own start address and
            // no larger than the remaining length.
            let self_align = if start.raw() == 0 {
                usize::MAX
            } else {
                1 << start.raw().trailing_zeros()
            };
            let size = min(self_align, prev_power_of_two(len));
            if size < MIN_BLOCK {
                // Sub-minimum fragment at the front: drop it.
                start = start + size;
                len -= size;
                continue;
            }
            self.free_block(start, size);
            start = start + size;
            len -= size;
        }
    }

    /// Allocate a block of at least `size` bytes, zeroed. The returned block
    /// is `next_pow2(max(size, MIN_BLOCK))`-aligned. `None` on exhaustion,
    /// which is expected and recoverable.
    pub fn alloc(&mut self, size: usize) -> Option<PhysicalAddress> {
        let size = block_size(size)?;
        self.check_blocks();

        // First fit.
        let mut prev: Option<PhysicalAddress> = None;
        let mut cur = self.head;
        while let Some(addr) = cur {
            let node = unsafe { FreeBlock::read(addr) };
            if node.size < size {
                prev = cur;
                cur = node.next;
                continue;
            }

            // Unlink, then halve until exact: each split returns the higher
            // half to the free list as a new, smaller free block.
            match prev {
                None => self.head = node.next,
                Some(p) => unsafe { FreeBlock::set_next(p, node.next) },
            }
            self.free -= node.size;
            let mut have = node.size;
            while have > size {
                have >>= 1;
                trace!(
                    "POOL splitting [{}, {}) -> [{}, {}) + [{}, {})",
                    addr,
                    addr + (have << 1),
                    addr,
                    addr + have,
                    addr + have,
                    addr + (have << 1)
                );
                self.free_block(addr + have, have);
            }

            unsafe { addr.as_mut_ptr::<u8>().write_bytes(0, size) };
            trace!("POOL allocated [{}, {})", addr, addr + size);
            self.check_blocks();
            return Some(addr);
        }

        trace!("POOL failed to allocate 0x{:x}", size);
        None
    }

    /// Free a block previously returned by [`alloc`](BuddyPool::alloc),
    /// giving the size originally requested. Freeing `None` is a no-op.
    pub fn free(&mut self, addr: Option<PhysicalAddress>, size: usize) {
        let addr = match addr {
            Some(addr) => addr,
            None => return,
        };
        let size = match block_size(size) {
            Some(size) => size,
            None => panic!("POOL freed an impossible size 0x{:x} at {}.", size, addr),
        };
        trace!("POOL freeing [{}, {})", addr, addr + size);
        self.free_block(addr, size);
        self.check_blocks();
    }

    /// Return a block to the free list, merging with free buddies found
    /// during a single address-ordered pass.
    ///
    /// Merges cascade only while the doubled block's buddy lies ahead of
    /// the scan. A cascade whose next buddy sits at a lower address leaves
    /// the pair split; it completes when either half is freed again.
    fn free_block(&mut self, addr: PhysicalAddress, size: usize) {
        assert!(
            addr.is_aligned(size),
            "POOL freed block {} not aligned to its size 0x{:x}.",
            addr,
            size
        );
        self.free += size;

        let mut addr = addr;
        let mut size = size;
        let mut prev: Option<PhysicalAddress> = None;
        let mut cur = self.head;
        while let Some(block) = cur {
            let node = unsafe { FreeBlock::read(block) };
            assert!(
                block + node.size <= addr || addr + size <= block,
                "POOL double free of [{}, {}) overlapping [{}, {}).",
                addr,
                addr + size,
                block,
                block + node.size
            );
            if block == addr ^ size && node.size == size {
                // Merge with the buddy. The combined block starts at the
                // lower of the two addresses and doubles in size.
                match prev {
                    None => self.head = node.next,
                    Some(p) => unsafe { FreeBlock::set_next(p, node.next) },
                }
                trace!(
                    "POOL merging [{}, {}) + [{}, {})",
                    addr,
                    addr + size,
                    block,
                    block + size
                );
                if block < addr {
                    addr = block;
                }
                size <<= 1;
                cur = node.next;
                continue;
            }
            if block > addr {
                break;
            }
            prev = cur;
            cur = node.next;
        }

        // Insert in address order before the first following block.
        unsafe { FreeBlock::write(addr, FreeBlock { size, next: cur }) };
        match prev {
            None => self.head = Some(addr),
            Some(p) => unsafe { FreeBlock::set_next(p, Some(addr)) },
        }
    }

    /// Check the integrity of the free list.
    fn check_blocks(&self) {
        #[cfg(any(test, debug_assertions, feature = "heap_validation"))]
        {
            let mut prev: Option<(PhysicalAddress, usize)> = None;
            let mut cur = self.head;
            while let Some(addr) = cur {
                let node = unsafe { FreeBlock::read(addr) };
                assert!(node.size.is_power_of_two() && node.size >= MIN_BLOCK);
                assert!(addr.is_aligned(node.size));
                if let Some((paddr, psize)) = prev {
                    assert!(addr >= paddr + psize, "POOL free list out of order.");
                }
                prev = Some((addr, node.size));
                cur = node.next;
            }
        }
    }

    /// Dump the free list. Diagnostic use only.
    pub fn dump(&self) {
        debug!("POOL free block list:");
        let mut cur = self.head;
        while let Some(addr) = cur {
            let node = unsafe { FreeBlock::read(addr) };
            debug!("  [{}, {}) (size 0x{:x})", addr, addr + node.size, node.size);
            cur = node.next;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::fixture::TestRam;

    /// A pool populated with a single aligned extent of `len` bytes.
    fn pool_of(ram: &TestRam, len: usize) -> (BuddyPool, PhysicalAddress) {
        // Find a spot inside the buffer aligned to the extent size, so that
        // populate() produces a single maximal block.
        let base = ram.base().next_aligned(len);
        assert!(base + len <= ram.base() + ram.len());
        let mut pool = BuddyPool::new();
        pool.populate(base, len);
        (pool, base)
    }

    #[test]
    fn worked_example() {
        // The 256-byte extent from the design notes: alloc(40) takes a
        // 64-byte block, alloc(100) takes the 128-byte block, and freeing
        // both restores a single 256-byte block at the original address.
        let ram = TestRam::new(4096);
        let (mut pool, base) = pool_of(&ram, 256);
        assert_eq!(pool.free_bytes(), 256);

        let a = pool.alloc(40).unwrap();
        assert_eq!(a, base);
        assert!(a.is_aligned(64));
        assert_eq!(pool.free_bytes(), 192);

        let b = pool.alloc(100).unwrap();
        assert_eq!(b, base + 128);
        assert!(b.is_aligned(128));
        assert_eq!(pool.free_bytes(), 64);

        // Remaining topology: a single 64-byte block at base + 64.
        let c = pool.alloc(100);
        assert_eq!(c, None);
        let d = pool.alloc(64).unwrap();
        assert_eq!(d, base + 64);
        assert_eq!(pool.free_bytes(), 0);
        pool.free(Some(d), 64);

        pool.free(Some(a), 40);
        pool.free(Some(b), 100);
        assert_eq!(pool.free_bytes(), 256);

        // A single coalesced block at the original address.
        let whole = pool.alloc(256).unwrap();
        assert_eq!(whole, base);
        assert_eq!(pool.alloc(1), None);
    }

    #[test]
    fn alloc_zeroes() {
        let ram = TestRam::new(4096);
        let (mut pool, _) = pool_of(&ram, 256);

        let a = pool.alloc(64).unwrap();
        unsafe { a.as_mut_ptr::<u8>().write_bytes(0xaa, 64) };
        pool.free(Some(a), 64);

        let b = pool.alloc(64).unwrap();
        assert_eq!(a, b);
        let bytes = unsafe { core::slice::from_raw_parts(b.as_mut_ptr::<u8>(), 64) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn buddy_merge() {
        // Freeing two equal buddies yields exactly one block of double the
        // size at the lower address.
        let ram = TestRam::new(4096);
        let (mut pool, base) = pool_of(&ram, 256);

        let low = pool.alloc(64).unwrap();
        let high = pool.alloc(64).unwrap();
        assert_eq!(high, low ^ 64);

        // Free in either order; the higher buddy first.
        pool.free(Some(high), 64);
        pool.free(Some(low), 64);

        let merged = pool.alloc(128).unwrap();
        assert_eq!(merged, base);
    }

    #[test]
    fn adjacent_non_buddies_stay_split() {
        let ram = TestRam::new(4096);
        let (mut pool, base) = pool_of(&ram, 256);

        // Carve out [base, base + 64) and [base + 64, base + 128): the
        // blocks at base + 64 and base + 128 are adjacent equal-sized blocks
        // but not buddies (base + 64 XOR 64 == base).
        let a = pool.alloc(64).unwrap();
        let b = pool.alloc(64).unwrap();
        assert_eq!(a, base);
        assert_eq!(b, base + 64);
        pool.free(Some(b), 64);

        // base + 64 and the free 128 block at base + 128 must not merge:
        // a 128-byte request is served from the aligned 128 block.
        let c = pool.alloc(128).unwrap();
        assert_eq!(c, base + 128);
    }

    #[test]
    fn cascaded_merge_stops_at_backward_buddy() {
        // Freeing [base+64, base+96) merges forward with [base+96, base+128)
        // into a 64-byte block, but that block's buddy at `base` is already
        // behind the scan: the two halves stay split until a later free.
        let ram = TestRam::new(4096);
        let (mut pool, base) = pool_of(&ram, 128);

        let a = pool.alloc(64).unwrap();
        assert_eq!(a, base);
        let b = pool.alloc(32).unwrap();
        assert_eq!(b, base + 64);
        pool.free(Some(a), 64);
        pool.free(Some(b), 32);

        // All 128 bytes are free but not contiguous as one block.
        assert_eq!(pool.free_bytes(), 128);
        assert_eq!(pool.alloc(128), None);

        // Freeing the lower half again completes the merge.
        let again = pool.alloc(64).unwrap();
        assert_eq!(again, base);
        pool.free(Some(again), 64);
        assert_eq!(pool.alloc(128), Some(base));
    }

    #[test]
    fn populate_unaligned_extent() {
        let ram = TestRam::new(4096);
        // An extent starting MIN_BLOCK past an alignment boundary splits
        // into non-maximal pieces but loses nothing above MIN_BLOCK.
        let base = ram.base().next_aligned(512) + MIN_BLOCK;
        let mut pool = BuddyPool::new();
        pool.populate(base, 256);
        assert_eq!(pool.free_bytes(), 256);

        // No 256-byte block exists (nothing is 256-aligned).
        assert_eq!(pool.alloc(256), None);
        assert!(pool.alloc(MIN_BLOCK).is_some());
    }

    #[test]
    fn populate_drops_sub_minimum_fragments() {
        let ram = TestRam::new(4096);
        let base = ram.base().next_aligned(512);
        let mut pool = BuddyPool::new();
        pool.populate(base, MIN_BLOCK - 1);
        assert_eq!(pool.free_bytes(), 0);
        assert_eq!(pool.alloc(1), None);
    }

    #[test]
    fn multiple_donations() {
        let ram = TestRam::new(4096);
        let base = ram.base().next_aligned(1024);
        let mut pool = BuddyPool::new();
        pool.populate(base, 256);
        pool.populate(base + 512, 256);
        assert_eq!(pool.free_bytes(), 512);

        let a = pool.alloc(256).unwrap();
        let b = pool.alloc(256).unwrap();
        assert_eq!(a, base);
        assert_eq!(b, base + 512);
    }

    #[test]
    fn free_null_is_noop() {
        let mut pool = BuddyPool::new();
        pool.free(None, 64);
        assert_eq!(pool.free_bytes(), 0);
    }

    #[test]
    fn zero_size_alloc_fails() {
        let ram = TestRam::new(4096);
        let (mut pool, _) = pool_of(&ram, 256);
        assert_eq!(pool.alloc(0), None);
        assert_eq!(pool.free_bytes(), 256);
    }

    #[test]
    #[should_panic(expected = "not aligned to its size")]
    fn misaligned_free_is_fatal() {
        let ram = TestRam::new(4096);
        let (mut pool, base) = pool_of(&ram, 256);
        let a = pool.alloc(64).unwrap();
        assert_eq!(a, base);
        pool.free(Some(a + MIN_BLOCK), 64);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal() {
        let ram = TestRam::new(4096);
        let (mut pool, _) = pool_of(&ram, 256);
        let a = pool.alloc(64).unwrap();
        pool.free(Some(a), 64);
        pool.free(Some(a), 64);
    }
}
