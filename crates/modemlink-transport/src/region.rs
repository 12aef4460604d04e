//! Backing stores for the shared-memory window.
//!
//! Every access is bounds-checked against the region size; nothing above
//! this module touches raw pointers.

use std::sync::{Mutex, PoisonError};

use crate::error::{Result, TransportError};

/// Byte-addressed access to a memory window shared with the modem.
///
/// Word accessors are little-endian. Implementations must make a 32-bit
/// aligned word store visible to the peer as a single access.
pub trait SharedMemory: Send + Sync {
    /// Size of the window in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `dst.len()` bytes out of the window starting at `offset`.
    fn read_bytes(&self, offset: usize, dst: &mut [u8]) -> Result<()>;

    /// Copy `src` into the window starting at `offset`.
    fn write_bytes(&self, offset: usize, src: &[u8]) -> Result<()>;

    fn read_u32(&self, offset: usize) -> Result<u32> {
        let mut raw = [0u8; 4];
        self.read_bytes(offset, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    fn read_u16(&self, offset: usize) -> Result<u16> {
        let mut raw = [0u8; 2];
        self.read_bytes(offset, &mut raw)?;
        Ok(u16::from_le_bytes(raw))
    }

    fn write_u16(&self, offset: usize, value: u16) -> Result<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    /// Replace a 16-bit register with `f(previous)`, returning `previous`.
    ///
    /// Backends that can do so make this a single access with respect to
    /// other users of the same region.
    fn update_u16(&self, offset: usize, f: &mut dyn FnMut(u16) -> u16) -> Result<u16> {
        let previous = self.read_u16(offset)?;
        self.write_u16(offset, f(previous))?;
        Ok(previous)
    }
}

pub(crate) fn check_bounds(offset: usize, len: usize, size: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(TransportError::OutOfBounds { offset, len, size }),
    }
}

/// In-process region backed by heap memory.
///
/// Both ends of a simulated link share one `HeapRegion` through an `Arc`.
#[derive(Debug)]
pub struct HeapRegion {
    bytes: Mutex<Vec<u8>>,
    len: usize,
}

impl HeapRegion {
    /// Allocate a zero-filled region.
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0; len]),
            len,
        }
    }

    /// Copy of the whole region, for inspection.
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SharedMemory for HeapRegion {
    fn len(&self) -> usize {
        self.len
    }

    fn read_bytes(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        check_bounds(offset, dst.len(), self.len)?;
        let bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        dst.copy_from_slice(&bytes[offset..offset + dst.len()]);
        Ok(())
    }

    fn write_bytes(&self, offset: usize, src: &[u8]) -> Result<()> {
        check_bounds(offset, src.len(), self.len)?;
        let mut bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        bytes[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn update_u16(&self, offset: usize, f: &mut dyn FnMut(u16) -> u16) -> Result<u16> {
        check_bounds(offset, 2, self.len)?;
        let mut bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = u16::from_le_bytes([bytes[offset], bytes[offset + 1]]);
        bytes[offset..offset + 2].copy_from_slice(&f(previous).to_le_bytes());
        Ok(previous)
    }
}

#[cfg(unix)]
pub use mapped::MappedRegion;

#[cfg(unix)]
mod mapped {
    use std::fs::{File, OpenOptions};
    use std::os::fd::AsRawFd;
    use std::path::Path;
    use std::ptr::NonNull;

    use tracing::{debug, info};

    use super::{check_bounds, SharedMemory};
    use crate::error::Result;

    /// A window of a file or device node mapped `MAP_SHARED`.
    ///
    /// All accesses are volatile so stores reach the peer in program order.
    pub struct MappedRegion {
        ptr: NonNull<u8>,
        len: usize,
        _file: File,
    }

    // SAFETY: the mapping is owned by this value and only accessed through
    // volatile reads/writes; the peer processor races on it by protocol,
    // which the ring discipline tolerates.
    unsafe impl Send for MappedRegion {}
    // SAFETY: see `Send`; no method hands out references into the mapping.
    unsafe impl Sync for MappedRegion {}

    impl MappedRegion {
        /// Map `len` bytes of `path` starting at `offset`.
        ///
        /// `offset` must be a multiple of the page size.
        pub fn open(path: impl AsRef<Path>, offset: u64, len: usize) -> Result<Self> {
            let path = path.as_ref();
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            if len == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "cannot map an empty region",
                )
                .into());
            }
            let file_offset = libc::off_t::try_from(offset).map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "offset out of range")
            })?;

            // SAFETY: the fd is open for read/write for the duration of the
            // call; a null hint lets the kernel choose the address, and the
            // result is checked against MAP_FAILED before use.
            let addr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    file.as_raw_fd(),
                    file_offset,
                )
            };
            if addr == libc::MAP_FAILED {
                return Err(std::io::Error::last_os_error().into());
            }
            let ptr = NonNull::new(addr.cast::<u8>())
                .ok_or_else(|| std::io::Error::other("mmap returned null"))?;

            info!(?path, offset, len, "mapped shared memory window");
            Ok(Self {
                ptr,
                len,
                _file: file,
            })
        }
    }

    impl SharedMemory for MappedRegion {
        fn len(&self) -> usize {
            self.len
        }

        fn read_bytes(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
            check_bounds(offset, dst.len(), self.len)?;
            for (i, byte) in dst.iter_mut().enumerate() {
                // SAFETY: offset + i < len was checked above and the mapping
                // stays valid until drop.
                *byte = unsafe { self.ptr.as_ptr().add(offset + i).read_volatile() };
            }
            Ok(())
        }

        fn write_bytes(&self, offset: usize, src: &[u8]) -> Result<()> {
            check_bounds(offset, src.len(), self.len)?;
            for (i, byte) in src.iter().enumerate() {
                // SAFETY: offset + i < len was checked above.
                unsafe { self.ptr.as_ptr().add(offset + i).write_volatile(*byte) };
            }
            Ok(())
        }

        fn read_u32(&self, offset: usize) -> Result<u32> {
            check_bounds(offset, 4, self.len)?;
            let addr = self.ptr.as_ptr().wrapping_add(offset);
            if addr.align_offset(4) != 0 {
                let mut raw = [0u8; 4];
                self.read_bytes(offset, &mut raw)?;
                return Ok(u32::from_le_bytes(raw));
            }
            // SAFETY: in bounds and 4-byte aligned.
            let word = unsafe { addr.cast::<u32>().read_volatile() };
            Ok(u32::from_le(word))
        }

        fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
            check_bounds(offset, 4, self.len)?;
            let addr = self.ptr.as_ptr().wrapping_add(offset);
            if addr.align_offset(4) != 0 {
                return self.write_bytes(offset, &value.to_le_bytes());
            }
            // SAFETY: in bounds and 4-byte aligned.
            unsafe { addr.cast::<u32>().write_volatile(value.to_le()) };
            Ok(())
        }
    }

    impl Drop for MappedRegion {
        fn drop(&mut self) {
            // SAFETY: ptr/len describe the mapping created in `open`, and no
            // references into it outlive `self`.
            let rc = unsafe { libc::munmap(self.ptr.as_ptr().cast::<libc::c_void>(), self.len) };
            if rc != 0 {
                debug!(error = %std::io::Error::last_os_error(), "munmap failed");
            }
        }
    }

    impl std::fmt::Debug for MappedRegion {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MappedRegion")
                .field("len", &self.len)
                .finish()
        }
    }
}
