//! POSIX shared-memory segments
//!
//! Segments live under a process-scoped namespace
//! (`/mediagraph-<pid>-<suffix>`) and the creating side unlinks them on
//! drop, so no segments outlive their session.

use crate::{Error, Result};
use std::ptr::NonNull;

#[cfg(unix)]
use nix::fcntl::OFlag;
#[cfg(unix)]
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
#[cfg(unix)]
use nix::sys::stat::Mode;
#[cfg(unix)]
use std::num::NonZeroUsize;
#[cfg(unix)]
use std::os::fd::OwnedFd;

/// A mapped shared-memory segment.
///
/// The owner (creator) unlinks the name on drop; attachers only unmap.
pub struct ShmSegment {
    name: String,
    ptr: NonNull<std::ffi::c_void>,
    len: usize,
    owner: bool,
}

// The segment is plain bytes; all concurrent access goes through atomics
// placed in it by the ring layer.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Build a namespaced segment name: `/mediagraph-<pid>-<suffix>`.
    ///
    /// The suffix is sanitized; POSIX shm names allow one leading slash
    /// and no others.
    pub fn scoped_name(suffix: &str) -> String {
        let sanitized: String = suffix
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
            .collect();
        let mut name = format!("/mediagraph-{}-{}", std::process::id(), sanitized);
        name.truncate(250);
        name
    }

    /// Create a fresh segment of `len` bytes. Fails if the name exists.
    #[cfg(unix)]
    pub fn create(name: &str, len: usize) -> Result<Self> {
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| Error::Ipc(format!("shm_open({name}) failed: {e}")))?;

        nix::unistd::ftruncate(&fd, len as libc::off_t)
            .map_err(|e| Error::Ipc(format!("ftruncate({name}, {len}) failed: {e}")))?;

        let ptr = Self::map(&fd, len, name)?;
        // Freshly created segments are zero-filled by the kernel
        Ok(Self {
            name: name.to_string(),
            ptr,
            len,
            owner: true,
        })
    }

    /// Attach to an existing segment, taking its length from the fd
    #[cfg(unix)]
    pub fn attach(name: &str) -> Result<Self> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty())
            .map_err(|e| Error::Ipc(format!("shm_open({name}) failed: {e}")))?;

        let stat = nix::sys::stat::fstat(&fd)
            .map_err(|e| Error::Ipc(format!("fstat({name}) failed: {e}")))?;
        let len = stat.st_size as usize;
        if len == 0 {
            return Err(Error::Ipc(format!("segment {name} has zero length")));
        }

        let ptr = Self::map(&fd, len, name)?;
        Ok(Self {
            name: name.to_string(),
            ptr,
            len,
            owner: false,
        })
    }

    #[cfg(unix)]
    fn map(fd: &OwnedFd, len: usize, name: &str) -> Result<NonNull<std::ffi::c_void>> {
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| Error::Ipc("cannot map zero-length segment".into()))?;
        unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
        .map_err(|e| Error::Ipc(format!("mmap({name}) failed: {e}")))
    }

    #[cfg(not(unix))]
    pub fn create(_name: &str, _len: usize) -> Result<Self> {
        Err(Error::Ipc("shared memory IPC requires a unix platform".into()))
    }

    #[cfg(not(unix))]
    pub fn attach(_name: &str) -> Result<Self> {
        Err(Error::Ipc("shared memory IPC requires a unix platform".into()))
    }

    /// Segment name (pass to the worker for attach)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mapped length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty (never true for a valid segment)
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base pointer of the mapping
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr() as *mut u8
    }

    /// Pointer at `offset`, bounds-checked against the mapping
    pub fn ptr_at(&self, offset: usize, size: usize) -> *mut u8 {
        assert!(
            offset + size <= self.len,
            "shm access out of bounds: {}+{} > {}",
            offset,
            size,
            self.len
        );
        unsafe { self.as_ptr().add(offset) }
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            unsafe {
                let _ = munmap(self.ptr, self.len);
            }
            if self.owner {
                if let Err(e) = shm_unlink(self.name.as_str()) {
                    tracing::warn!(name = %self.name, error = %e, "failed to unlink shm segment");
                }
            }
        }
    }
}

impl std::fmt::Debug for ShmSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmSegment")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("owner", &self.owner)
            .finish()
    }
}
