//! `/dev/mem` backend
//!
//! Maps physical memory through the kernel's `/dev/mem` character device.
//! Requires root (or `CAP_SYS_RAWIO`), and on kernels built with
//! `CONFIG_STRICT_DEVMEM` only I/O ranges such as the peripheral window are
//! accessible.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};

use super::PhysicalMemory;
use crate::error::MapError;

/// Physical memory device on Linux
pub const DEV_MEM_PATH: &str = "/dev/mem";

/// Used only if `sysconf` cannot report the page size
const FALLBACK_PAGE_SIZE: usize = 4096;

/// Physical memory exposed by a `/dev/mem`-style device node
#[derive(Debug, Clone)]
pub struct DevMem {
    path: PathBuf,
}

impl Default for DevMem {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEV_MEM_PATH),
        }
    }
}

impl DevMem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different device node (e.g. `/dev/gpiomem`)
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PhysicalMemory for DevMem {
    type Handle = File;

    fn page_size(&self) -> usize {
        // Safety: sysconf has no memory-safety preconditions
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            FALLBACK_PAGE_SIZE
        }
    }

    fn open(&self) -> Result<File, MapError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(&self.path)
            .map_err(|source| {
                let path = self.path.clone();
                if source.kind() == io::ErrorKind::PermissionDenied {
                    MapError::PermissionDenied { path, source }
                } else {
                    MapError::DeviceUnavailable { path, source }
                }
            })
    }

    unsafe fn map(
        &self,
        handle: &File,
        raw_base: u64,
        raw_length: usize,
    ) -> Result<NonNull<u8>, MapError> {
        let failed = |source| MapError::MapFailed {
            base: raw_base,
            length: raw_length,
            source,
        };

        let offset = libc::off_t::try_from(raw_base).map_err(|_| {
            failed(io::Error::new(
                io::ErrorKind::InvalidInput,
                "physical base does not fit in off_t",
            ))
        })?;

        let mem = libc::mmap(
            ptr::null_mut(),
            raw_length,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            handle.as_raw_fd(),
            offset,
        );
        if mem == libc::MAP_FAILED {
            return Err(failed(io::Error::last_os_error()));
        }

        NonNull::new(mem.cast::<u8>())
            .ok_or_else(|| failed(io::Error::new(io::ErrorKind::Other, "mmap returned null")))
    }

    unsafe fn unmap(&self, raw: NonNull<u8>, raw_length: usize) -> io::Result<()> {
        if libc::munmap(raw.as_ptr().cast::<libc::c_void>(), raw_length) == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}
