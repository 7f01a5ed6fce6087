//! Turning the identifier from a `HANDSHAKE` into a mapping.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use aero_gpu_shm::SharedMemory;

use crate::error::{BackendError, Result};

pub trait ShmResolver: Send + Sync {
    /// Maps the shared memory named `identifier`, which must be at least `size` bytes.
    fn resolve(&self, identifier: &str, size: u64) -> Result<Arc<SharedMemory>>;
}

/// Opens POSIX shared memory objects (`shm_open`) by name.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixShmResolver;

#[cfg(unix)]
impl ShmResolver for PosixShmResolver {
    fn resolve(&self, identifier: &str, size: u64) -> Result<Arc<SharedMemory>> {
        let map_err = |source| BackendError::Map {
            identifier: identifier.to_string(),
            source,
        };
        let len = usize::try_from(size).map_err(|_| {
            map_err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "mapping size does not fit the address space",
            ))
        })?;
        let mem = SharedMemory::open(identifier, len).map_err(map_err)?;
        Ok(Arc::new(mem))
    }
}

/// Resolves mappings that already live in this process, keyed by [`SharedMemory::identifier`].
/// Used when relay and backend run in one process.
#[derive(Default)]
pub struct InProcessResolver {
    regions: Mutex<HashMap<String, Arc<SharedMemory>>>,
}

impl InProcessResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, mem: Arc<SharedMemory>) {
        self.lock().insert(mem.identifier().to_string(), mem);
    }

    pub fn remove(&self, identifier: &str) -> Option<Arc<SharedMemory>> {
        self.lock().remove(identifier)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<SharedMemory>>> {
        self.regions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ShmResolver for InProcessResolver {
    fn resolve(&self, identifier: &str, size: u64) -> Result<Arc<SharedMemory>> {
        let mem = self.lock().get(identifier).cloned().ok_or_else(|| BackendError::Map {
            identifier: identifier.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no such region"),
        })?;
        if (mem.len() as u64) < size {
            return Err(BackendError::Map {
                identifier: identifier.to_string(),
                source: io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("region is {} bytes, expected at least {size}", mem.len()),
                ),
            });
        }
        Ok(mem)
    }
}
