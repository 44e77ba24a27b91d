//! External heaps for large or long-lived buffers.
//!
//! Exactly one policy is active per build: the default [`TopHeap`] claims
//! space from the top of the largest usable region and grows downward, the
//! [`BumpHeap`] (feature `legacy_heap`) is a smaller single-extent policy
//! for constrained builds. Both keep their claim registered so that the
//! memory map reflects it.

mod bump;
mod top;

pub use bump::BumpHeap;
pub use top::TopHeap;

use cfg_if::cfg_if;

use crate::map::{Memory, MemoryPlatform};
use crate::types::PhysicalAddress;

/// Registry name under which an external heap claims its extent.
pub(crate) const HEAP_NAME: &str = "heap";

/// A heap whose entire interface is reallocation.
///
/// `realloc(ctx, None, n)` allocates, `realloc(ctx, Some(p), 0)` frees, and
/// any other combination resizes, preserving contents up to the smaller of
/// the old and new sizes. On failure the old block is left untouched and
/// `None` is returned.
pub trait ResizableHeap<P: MemoryPlatform> {
    fn realloc(
        &mut self,
        ctx: &mut Memory<P>,
        old: Option<PhysicalAddress>,
        new_size: usize,
    ) -> Option<PhysicalAddress>;
}

cfg_if! {
    if #[cfg(feature = "legacy_heap")] {
        /// The external heap policy selected for this build.
        pub type ExternalHeap = BumpHeap;
    } else {
        /// The external heap policy selected for this build.
        pub type ExternalHeap = TopHeap;
    }
}
