//! Memory-mapped register aperture
//!
//! Maps a PCI resource file (typically BAR0 of the GPU) with rustix and
//! serves PMU register accesses from it. DMEM copies go through the default
//! DMEMC/DMEMD port implementation of [`PmuTransport`].

use crate::error::{PmuError, Result};
use crate::transport::PmuTransport;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// Value returned for reads outside the mapping, like a master abort on PCI.
const BAD_READ: u32 = 0xffff_ffff;

/// Register aperture backed by an `mmap` of a resource file.
#[derive(Debug)]
pub struct MmioTransport {
    ptr: NonNull<u8>,
    size: usize,
    _file: File,
    path: PathBuf,
}

// SAFETY: Send - the mapping is owned exclusively by this struct and is valid
// process-wide; moving it between threads does not invalidate it.
unsafe impl Send for MmioTransport {}

// SAFETY: Sync - every access is a bounds-checked, aligned 32-bit volatile
// read or write, so no access can tear or leave the mapping. Memory safety
// does not depend on the order of concurrent accesses. Multi-register
// sequences are the caller's business: queue registers are ordered by the
// channel's queue locks, and DMEMC/DMEMD copies by `SerializedPort`.
unsafe impl Sync for MmioTransport {}

impl MmioTransport {
    /// Map the PCI resource `resource_index` of the device at `pcie_address`.
    ///
    /// # Errors
    ///
    /// As [`MmioTransport::open`].
    pub fn pci(pcie_address: &str, resource_index: usize) -> Result<Self> {
        Self::open(format!(
            "/sys/bus/pci/devices/{pcie_address}/resource{resource_index}"
        ))
    }

    /// Map the whole of `path` read-write and shared.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The file cannot be opened read-write
    /// - The file is empty
    /// - mmap fails
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        tracing::debug!("Mapping register aperture: {}", path.display());

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| PmuError::transport(format!("Cannot open {}: {e}", path.display())))?;

        let len = file
            .metadata()
            .map_err(|e| PmuError::transport(format!("Cannot stat {}: {e}", path.display())))?
            .len();
        let size = usize::try_from(len)
            .map_err(|_| PmuError::transport(format!("aperture of {len} bytes too large")))?;
        if size == 0 {
            return Err(PmuError::transport(format!(
                "{} is empty (device not enabled?)",
                path.display()
            )));
        }

        // SAFETY: mmap preconditions:
        // - fd is valid (just opened) and stored in the struct for the
        //   lifetime of the mapping
        // - size is non-zero and equals the file length
        // - PROT_READ|PROT_WRITE with MAP_SHARED so writes reach the device
        // - offset 0
        // The mapping is released in Drop.
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                0,
            )
            .map_err(|e| PmuError::transport(format!("mmap failed: {e}")))?
        };
        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| PmuError::transport("mmap returned a null mapping"))?;

        tracing::info!(
            "Mapped {} ({size:#x} bytes at {ptr:p})",
            path.display()
        );

        Ok(Self {
            ptr,
            size,
            _file: file,
            path,
        })
    }

    /// Size of the mapping in bytes.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Mapped file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn checked(&self, addr: u32) -> Option<usize> {
        let offset = usize::try_from(addr).ok()?;
        (offset % 4 == 0 && offset.checked_add(4)? <= self.size).then_some(offset)
    }
}

impl PmuTransport for MmioTransport {
    fn read_register(&self, addr: u32) -> u32 {
        let Some(offset) = self.checked(addr) else {
            tracing::error!(
                "register read {addr:#x} outside aperture of {:#x} bytes",
                self.size
            );
            return BAD_READ;
        };
        // SAFETY: volatile read of a device register.
        // - offset + 4 <= size and offset is 4-byte aligned (checked above)
        // - ptr is the base of a live mapping of `size` bytes
        // - read_volatile keeps the compiler from merging or reordering
        //   accesses whose side effects live in hardware
        #[allow(clippy::cast_ptr_alignment)]
        let value = unsafe { self.ptr.as_ptr().add(offset).cast::<u32>().read_volatile() };
        tracing::trace!("rd {addr:#x} = {value:#x}");
        value
    }

    fn write_register(&self, addr: u32, value: u32) {
        let Some(offset) = self.checked(addr) else {
            tracing::error!(
                "register write {addr:#x} outside aperture of {:#x} bytes",
                self.size
            );
            return;
        };
        tracing::trace!("wr {addr:#x} = {value:#x}");
        // SAFETY: volatile write of a device register.
        // - offset + 4 <= size and offset is 4-byte aligned (checked above)
        // - ptr is the base of a live, writable mapping of `size` bytes
        // - write_volatile is required: register writes trigger hardware
        //   side effects and must not be elided or reordered
        #[allow(clippy::cast_ptr_alignment)]
        unsafe {
            self.ptr.as_ptr().add(offset).cast::<u32>().write_volatile(value);
        }
    }
}

impl Drop for MmioTransport {
    fn drop(&mut self) {
        // SAFETY: ptr and size describe the mapping created in `open`; Drop
        // runs once and no references into the mapping outlive self.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), self.size);
        }
        tracing::debug!("Unmapped {}", self.path.display());
    }
}
