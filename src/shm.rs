//! Shared memory regions.

use std::ffi::CStr;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::ptr;
use std::sync::{Mutex, PoisonError};

use tracing::error;

/// Name attached to anonymous memory file descriptors.
const MEMFD_NAME: &CStr = c"vellum-shm";

/// Memory mapped shared memory file.
#[derive(Debug)]
pub struct ShmRegion {
    fd: OwnedFd,
    ptr: *mut u8,
    len: usize,

    // Serializes access from within the server process.
    access: Mutex<()>,
}

// The mapping is only accessed through `access`.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.ptr.cast(), self.len) } == -1 {
            error!("Failed to unmap shared memory: {}", io::Error::last_os_error());
        }
    }
}

impl ShmRegion {
    /// Create a new anonymous shared memory region.
    pub fn anonymous(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "zero-sized shm region"));
        }

        let fd = unsafe { libc::memfd_create(MEMFD_NAME.as_ptr(), libc::MFD_CLOEXEC) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let file_len = libc::off_t::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "shm region too large"))?;
        if unsafe { libc::ftruncate(fd.as_raw_fd(), file_len) } == -1 {
            return Err(io::Error::last_os_error());
        }

        Self::from_fd(fd, len)
    }

    /// Map an existing shared memory file, like a client's pool.
    pub fn from_fd(fd: OwnedFd, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "zero-sized shm region"));
        }

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { fd, len, ptr: ptr.cast(), access: Mutex::new(()) })
    }

    /// Size of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read a range of the mapping.
    ///
    /// Returns `None` if the range exceeds the mapping.
    pub fn with_contents<T>(
        &self,
        offset: usize,
        len: usize,
        f: impl FnOnce(&[u8]) -> T,
    ) -> Option<T> {
        self.check_range(offset, len)?;

        let _guard = self.access.lock().unwrap_or_else(PoisonError::into_inner);
        let data = unsafe { std::slice::from_raw_parts(self.ptr.add(offset), len) };
        Some(f(data))
    }

    /// Modify a range of the mapping.
    ///
    /// Returns `None` if the range exceeds the mapping.
    pub fn with_contents_mut<T>(
        &self,
        offset: usize,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> T,
    ) -> Option<T> {
        self.check_range(offset, len)?;

        let _guard = self.access.lock().unwrap_or_else(PoisonError::into_inner);
        let data = unsafe { std::slice::from_raw_parts_mut(self.ptr.add(offset), len) };
        Some(f(data))
    }

    fn check_range(&self, offset: usize, len: usize) -> Option<()> {
        let end = offset.checked_add(len)?;
        (end <= self.len).then_some(())
    }
}

impl AsFd for ShmRegion {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zero_sized_region_is_rejected() {
        assert!(ShmRegion::anonymous(0).is_err());
    }

    #[test]
    fn contents_are_shared_between_mappings() {
        let region = ShmRegion::anonymous(64).unwrap();
        region.with_contents_mut(8, 4, |data| data.copy_from_slice(&[1, 2, 3, 4])).unwrap();

        // Map the same file a second time, like a client would.
        let fd = region.as_fd().try_clone_to_owned().unwrap();
        let client = ShmRegion::from_fd(fd, 64).unwrap();
        assert_eq!(client.with_contents(8, 4, |data| data.to_vec()), Some(vec![1, 2, 3, 4]));
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let region = ShmRegion::anonymous(16).unwrap();
        assert!(region.with_contents(8, 9, |_| ()).is_none());
        assert!(region.with_contents(usize::MAX, 2, |_| ()).is_none());
        assert!(region.with_contents(0, 16, |_| ()).is_some());
    }
}
