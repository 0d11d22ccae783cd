//! Simulated physical memory
//!
//! Backs a window of physical address space with a zeroed, page-aligned heap
//! buffer. Mappings hand out pointers into that buffer, so code running
//! against a [`MappedRegion`](super::MappedRegion) sees exactly the bytes a
//! test later inspects through [`SimulatedMemory::read_u32`].
//!
//! The simulator counts open device handles and live mappings, and can be
//! told to fail the next open or map, which makes resource leaks on error
//! paths observable.

use std::alloc::{self, Layout};
use std::io;
use std::path::PathBuf;
use std::ptr::{self, NonNull};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::PhysicalMemory;
use crate::error::MapError;

/// Page size used unless one is given explicitly
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Pseudo device path reported in simulated open errors
const SIM_DEVICE: &str = "sim:physmem";

/// Fault injected into [`PhysicalMemory::open`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    PermissionDenied,
    Unavailable,
}

/// Zeroed, page-aligned heap buffer standing in for physical memory
///
/// Each live mapping holds a strong reference, so the buffer outlives every
/// simulator handle until the last mapping is released.
struct SimStorage {
    ptr: NonNull<u8>,
    layout: Layout,
}

// Safety: the buffer is plain memory owned by SimStorage; concurrent access
// goes through volatile word reads and writes like real device memory
unsafe impl Send for SimStorage {}
unsafe impl Sync for SimStorage {}

impl SimStorage {
    fn zeroed(layout: Layout) -> Self {
        // Safety: layout has non-zero size
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
            .unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Self { ptr, layout }
    }
}

impl Drop for SimStorage {
    fn drop(&mut self) {
        // Safety: ptr was allocated in SimStorage::zeroed with this layout
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

struct SimState {
    base: u64,
    size: usize,
    page_size: usize,
    storage: Arc<SimStorage>,
    open_handles: usize,
    live_mappings: usize,
    open_fault: Option<SimFault>,
    fail_next_map: bool,
}

impl SimState {
    fn contains(&self, phys: u64, length: usize) -> bool {
        phys >= self.base
            && phys
                .checked_add(length as u64)
                .map_or(false, |end| end <= self.base + self.size as u64)
    }

    fn word_ptr(&self, phys: u64) -> *mut u32 {
        assert!(
            phys % 4 == 0 && self.contains(phys, 4),
            "simulated access at 0x{:08x} outside window 0x{:08x}+0x{:x}",
            phys,
            self.base,
            self.size
        );
        // Safety: bounds checked above
        unsafe { self.storage.ptr.as_ptr().add((phys - self.base) as usize).cast::<u32>() }
    }
}

/// Heap-backed stand-in for the physical memory device
///
/// Clones share the same backing store.
#[derive(Clone)]
pub struct SimulatedMemory {
    state: Arc<Mutex<SimState>>,
}

impl std::fmt::Debug for SimulatedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("SimulatedMemory")
            .field("base", &format_args!("0x{:08x}", state.base))
            .field("size", &format_args!("0x{:x}", state.size))
            .field("open_handles", &state.open_handles)
            .field("live_mappings", &state.live_mappings)
            .finish()
    }
}

/// Open handle onto [`SimulatedMemory`], counted until dropped
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl Drop for SimHandle {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.open_handles -= 1;
    }
}

impl SimulatedMemory {
    /// Simulate the physical window `base..base + length` with 4 KiB pages
    pub fn new(base: u64, length: usize) -> Self {
        Self::with_page_size(base, length, DEFAULT_PAGE_SIZE)
    }

    /// Simulate a physical window with a custom page size
    ///
    /// The window is widened to whole pages.
    pub fn with_page_size(base: u64, length: usize, page_size: usize) -> Self {
        assert!(page_size.is_power_of_two(), "page size must be a power of two");

        let start = base - base % page_size as u64;
        let span = (base - start) as usize + length.max(1);
        let size = span.div_ceil(page_size) * page_size;
        assert!(size <= isize::MAX as usize - page_size, "simulated window too large");

        // Safety: align is a power of two and size does not overflow isize
        // when rounded up to it
        let layout = unsafe { Layout::from_size_align_unchecked(size, page_size) };

        Self {
            state: Arc::new(Mutex::new(SimState {
                base: start,
                size,
                page_size,
                storage: Arc::new(SimStorage::zeroed(layout)),
                open_handles: 0,
                live_mappings: 0,
                open_fault: None,
                fail_next_map: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read the 32-bit word at physical address `phys`
    pub fn read_u32(&self, phys: u64) -> u32 {
        let state = self.lock();
        // Safety: word_ptr bounds checks the address
        unsafe { ptr::read_volatile(state.word_ptr(phys)) }
    }

    /// Write the 32-bit word at physical address `phys`
    pub fn write_u32(&self, phys: u64, value: u32) {
        let state = self.lock();
        // Safety: word_ptr bounds checks the address
        unsafe { ptr::write_volatile(state.word_ptr(phys), value) }
    }

    /// Number of device handles currently open
    pub fn open_handles(&self) -> usize {
        self.lock().open_handles
    }

    /// Number of mappings not yet released
    pub fn live_mappings(&self) -> usize {
        self.lock().live_mappings
    }

    /// Make every subsequent open fail, or clear the fault with `None`
    pub fn fail_open(&self, fault: Option<SimFault>) {
        self.lock().open_fault = fault;
    }

    /// Make the next map request fail as if the OS refused it
    pub fn fail_next_map(&self) {
        self.lock().fail_next_map = true;
    }
}

impl PhysicalMemory for SimulatedMemory {
    type Handle = SimHandle;

    fn page_size(&self) -> usize {
        self.lock().page_size
    }

    fn open(&self) -> Result<SimHandle, MapError> {
        let mut state = self.lock();
        let path = PathBuf::from(SIM_DEVICE);
        match state.open_fault {
            Some(SimFault::PermissionDenied) => Err(MapError::PermissionDenied {
                path,
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            }),
            Some(SimFault::Unavailable) => Err(MapError::DeviceUnavailable {
                path,
                source: io::Error::from(io::ErrorKind::NotFound),
            }),
            None => {
                state.open_handles += 1;
                Ok(SimHandle {
                    state: Arc::clone(&self.state),
                })
            }
        }
    }

    unsafe fn map(
        &self,
        _handle: &SimHandle,
        raw_base: u64,
        raw_length: usize,
    ) -> Result<NonNull<u8>, MapError> {
        let mut state = self.lock();
        let refuse = |reason: &str| MapError::MapFailed {
            base: raw_base,
            length: raw_length,
            source: io::Error::new(io::ErrorKind::InvalidInput, reason.to_string()),
        };

        if state.fail_next_map {
            state.fail_next_map = false;
            return Err(refuse("injected map failure"));
        }
        if raw_base % state.page_size as u64 != 0 {
            return Err(refuse("base is not page aligned"));
        }
        if !state.contains(raw_base, raw_length) {
            return Err(refuse("range outside simulated window"));
        }

        // The mapping owns one strong count on the storage until unmap, like
        // an OS mapping that stays valid after its file is closed
        let _ = Arc::into_raw(Arc::clone(&state.storage));
        state.live_mappings += 1;

        // Safety: the range was checked to lie inside storage
        let offset = (raw_base - state.base) as usize;
        Ok(unsafe { NonNull::new_unchecked(state.storage.ptr.as_ptr().add(offset)) })
    }

    unsafe fn unmap(&self, raw: NonNull<u8>, raw_length: usize) -> io::Result<()> {
        let mut state = self.lock();
        let start = state.storage.ptr.as_ptr() as usize;
        let addr = raw.as_ptr() as usize;
        let inside = addr >= start && addr + raw_length <= start + state.size;

        if !inside || state.live_mappings == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "pointer was not mapped from this simulator",
            ));
        }
        state.live_mappings -= 1;
        // Safety: map leaked exactly one strong count per live mapping through
        // Arc::into_raw, which yields the same pointer as Arc::as_ptr, and
        // state.storage keeps at least one more alive across this call
        unsafe { Arc::decrement_strong_count(Arc::as_ptr(&state.storage)) };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_widened_to_pages() {
        let sim = SimulatedMemory::new(0xFE20_4010, 0x18);
        // Whole first page is addressable
        sim.write_u32(0xFE20_4000, 1);
        sim.write_u32(0xFE20_4FFC, 2);
        assert_eq!(sim.read_u32(0xFE20_4000), 1);
        assert_eq!(sim.read_u32(0xFE20_4FFC), 2);
    }

    #[test]
    fn test_storage_starts_zeroed() {
        let sim = SimulatedMemory::new(0x3F20_4000, 0x18);
        assert_eq!(sim.read_u32(0x3F20_4000), 0);
        assert_eq!(sim.read_u32(0x3F20_4014), 0);
    }

    #[test]
    fn test_handles_counted() {
        let sim = SimulatedMemory::new(0xFE20_4000, 0x1000);
        let a = sim.open().unwrap();
        let b = sim.open().unwrap();
        assert_eq!(sim.open_handles(), 2);
        drop(a);
        drop(b);
        assert_eq!(sim.open_handles(), 0);
    }

    #[test]
    fn test_rejects_unaligned_map() {
        let sim = SimulatedMemory::new(0xFE20_4000, 0x1000);
        let handle = sim.open().unwrap();
        let result = unsafe { sim.map(&handle, 0xFE20_4010, 0x18) };
        assert!(matches!(result, Err(MapError::MapFailed { .. })));
        assert_eq!(sim.live_mappings(), 0);
    }

    #[test]
    fn test_mapping_keeps_storage_after_simulator_dropped() {
        let sim = SimulatedMemory::new(0xFE20_4000, 0x1000);
        let handle = sim.open().unwrap();
        let raw = unsafe { sim.map(&handle, 0xFE20_4000, 0x18) }.unwrap();
        drop(handle);
        drop(sim);

        let word = raw.as_ptr().cast::<u32>();
        unsafe {
            ptr::write_volatile(word, 0xDEAD_BEEF);
            assert_eq!(ptr::read_volatile(word), 0xDEAD_BEEF);
        }
    }

    #[test]
    fn test_unmap_releases_storage_reference() {
        let sim = SimulatedMemory::new(0xFE20_4000, 0x1000);
        let storage = Arc::clone(&sim.lock().storage);
        assert_eq!(Arc::strong_count(&storage), 2);

        let handle = sim.open().unwrap();
        let raw = unsafe { sim.map(&handle, 0xFE20_4000, 0x18) }.unwrap();
        assert_eq!(Arc::strong_count(&storage), 3);

        unsafe { sim.unmap(raw, 0x18) }.unwrap();
        assert_eq!(Arc::strong_count(&storage), 2);
        assert!(unsafe { sim.unmap(raw, 0x18) }.is_err());
        assert_eq!(Arc::strong_count(&storage), 2);
    }

    #[test]
    #[should_panic(expected = "outside window")]
    fn test_access_outside_window_panics() {
        let sim = SimulatedMemory::new(0xFE20_4000, 0x1000);
        sim.read_u32(0xFE20_5000);
    }
}
