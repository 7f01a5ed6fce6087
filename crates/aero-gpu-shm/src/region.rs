//! Owned shared-memory mappings.
//!
//! A [`SharedMemory`] is a page-aligned, zero-initialized byte window. It is either process-local
//! (heap-backed, used by tests and in-process backends) or a POSIX shared memory object that the
//! backend process maps by name after the handshake.
//!
//! Nothing in this crate ever forms a `&[u8]` over the mapping: bulk bytes are copied in and out
//! through raw pointers and concurrently written words are accessed as atomics, so peers writing
//! to the same memory from other address spaces never alias a Rust reference.

use std::alloc::{self, Layout};
use std::io;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

pub const PAGE_SIZE: usize = 4096;

static NEXT_ANONYMOUS_ID: AtomicU64 = AtomicU64::new(1);

enum Backing {
    Heap {
        layout: Layout,
    },
    #[cfg(unix)]
    Posix {
        unlink_on_drop: bool,
    },
}

pub struct SharedMemory {
    ptr: NonNull<u8>,
    len: usize,
    identifier: String,
    backing: Backing,
}

// SAFETY: the mapping is plain memory owned by this value; all concurrent access goes through
// atomics or explicit copies.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Allocates a process-local mapping of `len` zeroed bytes.
    pub fn anonymous(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "shared memory length must be non-zero",
            ));
        }
        let layout = Layout::from_size_align(len, PAGE_SIZE)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "mapping size overflows"))?;

        // SAFETY: `layout` has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            io::Error::new(io::ErrorKind::OutOfMemory, "failed to allocate shared memory")
        })?;

        let id = NEXT_ANONYMOUS_ID.fetch_add(1, Ordering::Relaxed);
        Ok(Self {
            ptr,
            len,
            identifier: format!("anon:{id}"),
            backing: Backing::Heap { layout },
        })
    }

    /// Creates a new POSIX shared memory object named `name` and maps it. The name is unlinked
    /// when the returned value is dropped.
    #[cfg(unix)]
    pub fn create(name: &str, len: usize) -> io::Result<Self> {
        use rustix::fs::{ftruncate, Mode};
        use rustix::shm;

        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "shared memory length must be non-zero",
            ));
        }

        let fd = shm::open(
            name,
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )?;

        // A freshly truncated object reads as zeroes.
        if let Err(err) = ftruncate(&fd, len as u64) {
            drop(fd);
            let _ = shm::unlink(name);
            return Err(err.into());
        }

        let ptr = match map_shared(&fd, len) {
            Ok(ptr) => ptr,
            Err(err) => {
                drop(fd);
                let _ = shm::unlink(name);
                return Err(err);
            }
        };

        tracing::debug!(name, len, "created shared memory object");
        Ok(Self {
            ptr,
            len,
            identifier: name.to_string(),
            backing: Backing::Posix {
                unlink_on_drop: true,
            },
        })
    }

    /// Maps an existing POSIX shared memory object. Fails with `InvalidData` if the object is
    /// smaller than `len`.
    #[cfg(unix)]
    pub fn open(name: &str, len: usize) -> io::Result<Self> {
        use rustix::fs::{fstat, Mode};
        use rustix::shm;

        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "shared memory length must be non-zero",
            ));
        }

        let fd = shm::open(name, shm::OFlags::RDWR, Mode::empty())?;
        let stat = fstat(&fd)?;
        let actual = u64::try_from(stat.st_size).unwrap_or(0);
        if actual < len as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("shared memory object {name} is {actual} bytes, expected at least {len}"),
            ));
        }

        let ptr = map_shared(&fd, len)?;
        tracing::debug!(name, len, "opened shared memory object");
        Ok(Self {
            ptr,
            len,
            identifier: name.to_string(),
            backing: Backing::Posix {
                unlink_on_drop: false,
            },
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Name sent to the peer during the handshake.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Copies `src` into the mapping at `offset`.
    pub fn write_at(&self, offset: usize, src: &[u8]) -> io::Result<()> {
        self.check_range(offset, src.len())?;
        // SAFETY: the range was bounds-checked above and `src` cannot overlap the mapping because
        // no Rust reference into the mapping is ever handed out.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(offset), src.len()) };
        Ok(())
    }

    /// Copies `dst.len()` bytes starting at `offset` out of the mapping.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> io::Result<()> {
        self.check_range(offset, dst.len())?;
        // SAFETY: see `write_at`.
        unsafe { ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    fn check_range(&self, offset: usize, len: usize) -> io::Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "range {offset}+{len} is outside the {} byte mapping",
                    self.len
                ),
            )),
        }
    }
}

#[cfg(unix)]
fn map_shared(fd: &rustix::fd::OwnedFd, len: usize) -> io::Result<NonNull<u8>> {
    use rustix::mm::{mmap, MapFlags, ProtFlags};

    // SAFETY: a fresh mapping of an object at least `len` bytes long; it does not alias any
    // existing Rust allocation.
    let ptr = unsafe {
        mmap(
            ptr::null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )?
    };
    NonNull::new(ptr.cast::<u8>())
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned a null mapping"))
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        match &self.backing {
            Backing::Heap { layout } => {
                // SAFETY: allocated in `anonymous` with exactly this layout.
                unsafe { alloc::dealloc(self.ptr.as_ptr(), *layout) };
            }
            #[cfg(unix)]
            Backing::Posix { unlink_on_drop } => {
                // SAFETY: mapped in `create`/`open` with exactly this length.
                unsafe {
                    let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
                }
                if *unlink_on_drop {
                    let _ = rustix::shm::unlink(self.identifier.as_str());
                }
            }
        }
    }
}

impl std::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemory")
            .field("identifier", &self.identifier)
            .field("len", &self.len)
            .finish()
    }
}
