// SPDX-License-Identifier: MIT

//! Physical-memory window management.
//!
//! [`RegionMapper`] owns a handle to the physical-memory device and every
//! window mapped through it. A [`MappedRegion`] is only valid while its
//! owning mapper is alive and the region has not been unmapped; teardown
//! unmaps everything and closes the device handle iff the mapper opened it.

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

use log::warn;
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Public definitions
//--------------------------------------------------------------------------------------------------

/// The physical-memory device node.
pub const PHYS_MEM_DEVICE: &str = "/dev/mem";

/// The physical-memory device could not be opened. Fatal at startup.
#[derive(Debug, Error)]
#[error("cannot open physical-memory device {path}")]
pub struct MapInitError {
    path: String,
    #[source]
    source: io::Error,
}

/// A specific physical address range could not be mapped.
#[derive(Debug, Error)]
#[error("cannot map {size:#x} bytes at physical address {physical_address:#x}")]
pub struct MapError {
    physical_address: u64,
    size: usize,
    #[source]
    source: io::Error,
}

/// One process-visible window over a physical address range.
///
/// The virtual address is valid only while the owning [`RegionMapper`] is
/// alive and the region has not been unmapped.
#[derive(Copy, Clone, Debug)]
pub struct MappedRegion {
    physical_address: u64,
    virtual_address: *mut u8,
    size: usize,
}

/// Owns the physical-memory device handle and all windows mapped through it.
pub struct RegionMapper {
    fd: RawFd,
    owns_fd: bool,
    regions: Vec<MappedRegion>,
}

//--------------------------------------------------------------------------------------------------
// Public code
//--------------------------------------------------------------------------------------------------

impl MapError {
    /// The physical address of the failed mapping request.
    pub fn physical_address(&self) -> u64 {
        self.physical_address
    }
}

impl MappedRegion {
    /// Physical base address of the window.
    pub fn physical_address(&self) -> u64 {
        self.physical_address
    }

    /// Process-visible base address of the window.
    pub fn virtual_address(&self) -> *mut u8 {
        self.virtual_address
    }

    /// Window length in bytes. Unmapping must use the same length that
    /// produced the mapping.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl RegionMapper {
    /// Open the physical-memory device and take ownership of the handle.
    ///
    /// `O_SYNC` keeps the resulting windows uncached; register accesses must
    /// reach the hardware, not a cache line.
    pub fn open() -> Result<Self, MapInitError> {
        Self::open_device(PHYS_MEM_DEVICE)
    }

    /// Adopt an externally supplied device handle.
    ///
    /// The mapper never closes an adopted handle; the caller keeps that
    /// responsibility.
    pub fn from_handle(fd: RawFd) -> Self {
        Self {
            fd,
            owns_fd: false,
            regions: Vec::new(),
        }
    }

    /// Map `[physical_address, physical_address + size)` into the process.
    ///
    /// The region is recorded in the tracked collection before it is
    /// returned.
    pub fn map(&mut self, physical_address: u64, size: usize) -> Result<MappedRegion, MapError> {
        let virtual_address = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd,
                physical_address as libc::off_t,
            )
        };

        if virtual_address == libc::MAP_FAILED {
            return Err(MapError {
                physical_address,
                size,
                source: io::Error::last_os_error(),
            });
        }

        let region = MappedRegion {
            physical_address,
            virtual_address: virtual_address.cast::<u8>(),
            size,
        };
        self.regions.push(region);

        Ok(region)
    }

    /// Unmap the tracked region whose virtual address matches.
    ///
    /// A no-op when the address is not tracked.
    pub fn unmap(&mut self, virtual_address: *mut u8) {
        if let Some(i) = self
            .regions
            .iter()
            .position(|r| r.virtual_address == virtual_address)
        {
            let region = self.regions.remove(i);
            Self::unmap_region(&region);
        }
    }

    /// Unmap every tracked region and clear the collection.
    pub fn unmap_all(&mut self) {
        for region in self.regions.drain(..) {
            Self::unmap_region(&region);
        }
    }

    /// The currently tracked regions, in mapping order.
    pub fn regions(&self) -> &[MappedRegion] {
        &self.regions
    }
}

impl Drop for RegionMapper {
    fn drop(&mut self) {
        self.unmap_all();
        if self.owns_fd {
            // Closed at most once: Drop runs once and ownership is never
            // transferred back out.
            unsafe { libc::close(self.fd) };
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Private code
//--------------------------------------------------------------------------------------------------

impl RegionMapper {
    fn open_device(path: &str) -> Result<Self, MapInitError> {
        let c_path = CString::new(path).map_err(|_| MapInitError {
            path: path.to_owned(),
            source: io::Error::from(io::ErrorKind::InvalidInput),
        })?;

        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR | libc::O_SYNC) };
        if fd < 0 {
            return Err(MapInitError {
                path: path.to_owned(),
                source: io::Error::last_os_error(),
            });
        }

        Ok(Self {
            fd,
            owns_fd: true,
            regions: Vec::new(),
        })
    }

    fn unmap_region(region: &MappedRegion) {
        let rc = unsafe {
            libc::munmap(region.virtual_address.cast::<libc::c_void>(), region.size)
        };
        if rc != 0 {
            warn!(
                "munmap of {:#x} ({:#x} bytes) failed: {}",
                region.physical_address,
                region.size,
                io::Error::last_os_error()
            );
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
