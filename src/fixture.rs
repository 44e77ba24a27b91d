//! Test fixtures: host-backed physical memory and a scripted platform.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::vec::Vec;

use log_crate::{LevelFilter, Log, Metadata, Record};

use crate::map::{MemoryPlatform, RawRegion};
use crate::types::PhysicalAddress;

/// Renders every record so that formatting arguments in log statements are
/// fully evaluated during tests.
struct TestLogger;

impl Log for TestLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let _ = alloc::format!("{}", record.args());
    }

    fn flush(&self) {}
}

static LOGGER: TestLogger = TestLogger;

/// Install the rendering logger at trace level. Safe to call from any test;
/// repeated installation is ignored.
pub fn capture_logs() {
    let _ = log_crate::set_logger(&LOGGER);
    log_crate::set_max_level(LevelFilter::Trace);
}

/// A zeroed host allocation standing in for a stretch of physical memory.
///
/// The allocators under test operate on physical addresses through an
/// identity mapping, so a host buffer's address works as one directly.
pub struct TestRam {
    ptr: *mut u8,
    layout: Layout,
}

impl TestRam {
    /// Allocate `len` zeroed bytes, page aligned.
    pub fn new(len: usize) -> TestRam {
        let layout = Layout::from_size_align(len, 4096).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        TestRam { ptr, layout }
    }

    pub fn base(&self) -> PhysicalAddress {
        PhysicalAddress::from_ptr(self.ptr)
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for TestRam {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

/// A platform whose firmware regions are scripted by the test.
pub struct FakePlatform {
    regions: Vec<RawRegion>,
}

impl FakePlatform {
    pub fn new(regions: Vec<RawRegion>) -> FakePlatform {
        FakePlatform { regions }
    }
}

impl MemoryPlatform for FakePlatform {
    type Regions = alloc::vec::IntoIter<RawRegion>;

    fn raw_regions(&self) -> Self::Regions {
        self.regions.clone().into_iter()
    }
}
