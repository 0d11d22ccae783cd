//! Physical memory mapping
//!
//! Turns a `(physical base, length)` pair into a region of the calling
//! process's address space. The OS mapping facility only accepts offsets that
//! are a multiple of the page size, so the mapper widens the request down to
//! the enclosing page boundary and hands back a pointer that already skips the
//! padding.
//!
//! ```text
//!  raw_base           base                  base + length
//!     │◄─ user_offset ─►│◄────── length ───────►│
//!     ├─────────────────┼───────────────────────┤
//!     │◄──────────────── raw_length ───────────►│
//! ```
//!
//! The backend is pluggable: [`DevMem`] maps `/dev/mem`, while
//! [`SimulatedMemory`] backs a physical window with heap memory for tests and
//! dry runs.

#[cfg(unix)]
pub mod devmem;
pub mod sim;

#[cfg(unix)]
pub use devmem::DevMem;
pub use sim::{SimFault, SimulatedMemory};

use std::io;
use std::ptr::{self, NonNull};

use log::{debug, error};

use crate::error::MapError;

/// Size of the 32-bit physical address space
const PHYS_ADDR_SPACE: u64 = 1 << 32;

/// Source of physical memory mappings
///
/// `open` acquires the privileged device handle. The handle is only needed
/// while `map` runs and is closed when dropped, which keeps the acquisition
/// scoped on every exit path.
pub trait PhysicalMemory {
    /// Open handle onto the physical memory device
    type Handle;

    /// Granularity the OS requires for mapping offsets
    fn page_size(&self) -> usize;

    /// Acquire a read/write handle onto physical memory
    fn open(&self) -> Result<Self::Handle, MapError>;

    /// Map `raw_length` bytes of physical memory starting at `raw_base`
    ///
    /// The mapping stays valid until [`PhysicalMemory::unmap`], even after
    /// the handle and the backend value itself are dropped.
    ///
    /// # Safety
    /// `raw_base` must be page aligned and the range must describe memory
    /// that is safe to alias from this process.
    unsafe fn map(
        &self,
        handle: &Self::Handle,
        raw_base: u64,
        raw_length: usize,
    ) -> Result<NonNull<u8>, MapError>;

    /// Release a mapping previously returned by [`PhysicalMemory::map`]
    ///
    /// # Safety
    /// `raw` and `raw_length` must be exactly what `map` returned and was
    /// given, and no references into the mapping may outlive this call.
    unsafe fn unmap(&self, raw: NonNull<u8>, raw_length: usize) -> io::Result<()>;
}

/// A requested hardware window before alignment correction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalAddressRange {
    base: u32,
    length: usize,
}

impl PhysicalAddressRange {
    /// Create a range, rejecting empty windows and windows that run past the
    /// top of the 32-bit physical address space
    pub fn new(base: u32, length: usize) -> Result<Self, MapError> {
        let end = u64::from(base).checked_add(length as u64);
        if length == 0 || end.map_or(true, |end| end > PHYS_ADDR_SPACE) {
            return Err(MapError::InvalidRange { base, length });
        }
        Ok(Self { base, length })
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn length(&self) -> usize {
        self.length
    }
}

/// A live physical mapping
///
/// Offset 0 of the region is the first byte that was requested, regardless
/// of how far that byte sits into its page. The region is released with
/// [`PeripheralMemoryMapper::unmap`], never implicitly.
#[derive(Debug)]
pub struct MappedRegion {
    ptr: NonNull<u8>,
    raw: NonNull<u8>,
    raw_base: u64,
    raw_length: usize,
    user_offset: usize,
    base: u32,
    length: usize,
}

impl MappedRegion {
    /// Pointer to the first requested byte
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Page-aligned origin of the underlying OS mapping
    pub fn raw_ptr(&self) -> *mut u8 {
        self.raw.as_ptr()
    }

    /// Physical address that was requested
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Number of bytes that were requested
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Page-aligned physical base handed to the OS
    pub fn raw_base(&self) -> u64 {
        self.raw_base
    }

    /// Length of the OS mapping, including the alignment padding
    pub fn raw_length(&self) -> usize {
        self.raw_length
    }

    /// Distance from `raw_base` to `base`
    pub fn user_offset(&self) -> usize {
        self.user_offset
    }

    /// Volatile 32-bit read at a byte offset from the requested base
    ///
    /// Panics if the word is misaligned or lies outside the region.
    #[inline]
    pub fn read_u32(&self, offset: usize) -> u32 {
        self.check_word(offset);
        // Safety: the word is aligned and inside the live mapping
        unsafe { ptr::read_volatile(self.ptr.as_ptr().add(offset).cast::<u32>()) }
    }

    /// Volatile 32-bit write at a byte offset from the requested base
    ///
    /// Panics if the word is misaligned or lies outside the region.
    #[inline]
    pub fn write_u32(&self, offset: usize, value: u32) {
        self.check_word(offset);
        // Safety: the word is aligned and inside the live mapping
        unsafe { ptr::write_volatile(self.ptr.as_ptr().add(offset).cast::<u32>(), value) }
    }

    fn check_word(&self, offset: usize) {
        assert!(
            offset % 4 == 0 && offset + 4 <= self.length && (self.base as usize + offset) % 4 == 0,
            "register access at offset 0x{:x} outside 0x{:x}-byte window at 0x{:08x}",
            offset,
            self.length,
            self.base
        );
    }
}

/// Maps peripheral windows through a [`PhysicalMemory`] backend
#[derive(Debug, Clone)]
pub struct PeripheralMemoryMapper<P> {
    memory: P,
}

impl<P: PhysicalMemory> PeripheralMemoryMapper<P> {
    pub fn new(memory: P) -> Self {
        Self { memory }
    }

    /// The backend this mapper draws mappings from
    pub fn memory(&self) -> &P {
        &self.memory
    }

    /// Map `range` into the process, correcting for page alignment
    pub fn map(&self, range: PhysicalAddressRange) -> Result<MappedRegion, MapError> {
        let page_size = self.memory.page_size() as u64;
        let base = u64::from(range.base());
        let user_offset = (base % page_size) as usize;
        let raw_base = base - user_offset as u64;
        let raw_length = range.length() + user_offset;

        debug!(
            "mapping 0x{:x} bytes at 0x{:08x} (aligned: 0x{:x} bytes at 0x{:08x}, offset 0x{:x})",
            range.length(),
            base,
            raw_length,
            raw_base,
            user_offset
        );

        let handle = self.memory.open()?;
        // Safety: raw_base is page aligned by construction
        let raw = unsafe { self.memory.map(&handle, raw_base, raw_length) }?;
        drop(handle);

        // Safety: the mapping spans raw_length = user_offset + length bytes
        let ptr = unsafe { NonNull::new_unchecked(raw.as_ptr().add(user_offset)) };

        Ok(MappedRegion {
            ptr,
            raw,
            raw_base,
            raw_length,
            user_offset,
            base: range.base(),
            length: range.length(),
        })
    }

    /// Release a region returned by [`PeripheralMemoryMapper::map`]
    ///
    /// A mapping that cannot be torn down leaves the address space in an
    /// unknown state, so failure aborts the process.
    pub fn unmap(&self, region: MappedRegion) {
        debug!(
            "unmapping 0x{:x} bytes at 0x{:08x}",
            region.raw_length, region.raw_base
        );

        // Safety: raw pointer and length come straight from map, and the
        // region is consumed so no accessor can outlive the mapping
        if let Err(err) = unsafe { self.memory.unmap(region.raw, region.raw_length) } {
            error!(
                "failed to unmap 0x{:x} bytes at physical 0x{:08x}: {}",
                region.raw_length, region.raw_base, err
            );
            std::process::abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: u64 = 0xFE20_0000;

    fn mapper() -> (SimulatedMemory, PeripheralMemoryMapper<SimulatedMemory>) {
        let sim = SimulatedMemory::new(WINDOW, 0x1_0000);
        (sim.clone(), PeripheralMemoryMapper::new(sim))
    }

    #[test]
    fn test_range_rejects_empty() {
        assert!(matches!(
            PhysicalAddressRange::new(0xFE20_4000, 0),
            Err(MapError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_range_rejects_wraparound() {
        assert!(PhysicalAddressRange::new(0xFFFF_FFF0, 0x10).is_ok());
        assert!(matches!(
            PhysicalAddressRange::new(0xFFFF_FFF0, 0x11),
            Err(MapError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_unaligned_base_alignment() {
        let (_sim, mapper) = mapper();
        let range = PhysicalAddressRange::new(0xFE20_4200, 0x18).unwrap();
        let region = mapper.map(range).unwrap();

        assert_eq!(region.raw_base(), 0xFE20_4000);
        assert_eq!(region.user_offset(), 0x200);
        assert_eq!(region.raw_length(), 0x218);
        assert_eq!(region.raw_ptr() as usize % 4096, 0);
        assert_eq!(region.as_ptr() as usize - region.raw_ptr() as usize, 0x200);

        mapper.unmap(region);
    }

    #[test]
    fn test_region_accesses_requested_physical_bytes() {
        let (sim, mapper) = mapper();

        for base in [0xFE20_1000u32, 0xFE20_4000, 0xFE20_4204, 0xFE20_5FF0] {
            let length = 0x20;
            let region = mapper
                .map(PhysicalAddressRange::new(base, length).unwrap())
                .unwrap();

            for offset in (0..length).step_by(4) {
                let value = base ^ (offset as u32).wrapping_mul(0x0101_0101);
                region.write_u32(offset, value);
                assert_eq!(sim.read_u32(u64::from(base) + offset as u64), value);
            }

            sim.write_u32(u64::from(base), 0xA5A5_5A5A);
            assert_eq!(region.read_u32(0), 0xA5A5_5A5A);

            mapper.unmap(region);
        }
    }

    #[test]
    fn test_map_unmap_leaks_nothing() {
        let (sim, mapper) = mapper();
        let region = mapper
            .map(PhysicalAddressRange::new(0xFE20_4000, 0x18).unwrap())
            .unwrap();
        assert_eq!(sim.open_handles(), 0);
        assert_eq!(sim.live_mappings(), 1);

        mapper.unmap(region);
        assert_eq!(sim.open_handles(), 0);
        assert_eq!(sim.live_mappings(), 0);
    }

    #[test]
    fn test_failed_map_closes_handle() {
        let (sim, mapper) = mapper();
        sim.fail_next_map();

        let err = mapper
            .map(PhysicalAddressRange::new(0xFE20_4000, 0x18).unwrap())
            .unwrap_err();
        assert!(matches!(err, MapError::MapFailed { .. }));
        assert_eq!(sim.open_handles(), 0);
        assert_eq!(sim.live_mappings(), 0);
    }

    #[test]
    fn test_map_outside_window_fails() {
        let (sim, mapper) = mapper();
        let err = mapper
            .map(PhysicalAddressRange::new(0x3F20_4000, 0x18).unwrap())
            .unwrap_err();
        assert!(matches!(err, MapError::MapFailed { .. }));
        assert_eq!(sim.open_handles(), 0);
    }

    #[test]
    fn test_open_faults() {
        let (sim, mapper) = mapper();
        let range = PhysicalAddressRange::new(0xFE20_4000, 0x18).unwrap();

        sim.fail_open(Some(SimFault::PermissionDenied));
        assert!(matches!(
            mapper.map(range),
            Err(MapError::PermissionDenied { .. })
        ));

        sim.fail_open(Some(SimFault::Unavailable));
        assert!(matches!(
            mapper.map(range),
            Err(MapError::DeviceUnavailable { .. })
        ));

        sim.fail_open(None);
        let region = mapper.map(range).unwrap();
        mapper.unmap(region);
        assert_eq!(sim.open_handles(), 0);
    }

    #[test]
    fn test_region_outlives_mapper() {
        let region = {
            let mapper = PeripheralMemoryMapper::new(SimulatedMemory::new(WINDOW, 0x1_0000));
            mapper
                .map(PhysicalAddressRange::new(0xFE20_4000, 0x18).unwrap())
                .unwrap()
        };

        // A fresh window of the same shape must not alias the old mapping
        let other = SimulatedMemory::new(WINDOW, 0x1_0000);
        other.write_u32(0xFE20_4000, 0x1234_5678);

        region.write_u32(0, 0xDEAD_BEEF);
        assert_eq!(region.read_u32(0), 0xDEAD_BEEF);
        assert_eq!(other.read_u32(0xFE20_4000), 0x1234_5678);
    }

    #[test]
    #[should_panic(expected = "outside")]
    fn test_region_bounds_checked() {
        let (_sim, mapper) = mapper();
        let region = mapper
            .map(PhysicalAddressRange::new(0xFE20_4000, 0x18).unwrap())
            .unwrap();
        region.read_u32(0x18);
    }
}
