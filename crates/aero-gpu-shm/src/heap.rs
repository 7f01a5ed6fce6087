//! Resource heap: the bulk-data window after the command ring.
//!
//! Commands never embed large buffers; they reference heap ranges with a [`HeapSpan`]. The
//! producer carves the window with a [`HeapAllocator`] and frees allocations once the fence that
//! covers their last use has completed. The consumer only ever reads through the bounds-checked
//! [`ResourceHeap`] view.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use thiserror::Error;

use crate::channel::ShmChannel;
use crate::error::{ChannelError, Result};
use crate::layout::{align_up, HEAP_ALIGN};

pub type ResourceId = u32;

/// Heap-relative byte range referenced from a command payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapSpan {
    pub offset: u64,
    pub len: u64,
}

impl HeapSpan {
    pub const ENCODED_LEN: usize = 16;

    pub fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.len)
    }

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..8].copy_from_slice(&self.offset.to_le_bytes());
        out[8..].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    /// Decodes a span from the first 16 bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let offset = u64::from_le_bytes(buf.get(..8)?.try_into().ok()?);
        let len = u64::from_le_bytes(buf.get(8..16)?.try_into().ok()?);
        Some(Self { offset, len })
    }
}

/// Bounds-checked view of the heap window.
pub struct ResourceHeap {
    channel: Arc<ShmChannel>,
}

impl ResourceHeap {
    pub(crate) fn new(channel: Arc<ShmChannel>) -> Self {
        Self { channel }
    }

    pub fn size(&self) -> u64 {
        self.channel.layout().heap_size
    }

    pub fn validate(&self, span: HeapSpan) -> Result<()> {
        let heap_size = self.size();
        match span.end() {
            Some(end) if end <= heap_size => Ok(()),
            _ => Err(ChannelError::OutOfBounds {
                offset: span.offset,
                len: span.len,
                heap_size,
            }),
        }
    }

    /// Writes `bytes` at `at` bytes into `span`. The write must stay inside the span.
    pub fn write(&self, span: HeapSpan, at: u64, bytes: &[u8]) -> Result<()> {
        self.validate(span)?;
        let inner = at
            .checked_add(bytes.len() as u64)
            .filter(|&end| end <= span.len)
            .map(|_| HeapSpan::new(span.offset + at, bytes.len() as u64))
            .ok_or(ChannelError::OutOfBounds {
                offset: span.offset.saturating_add(at),
                len: bytes.len() as u64,
                heap_size: self.size(),
            })?;
        self.channel
            .memory()
            .write_at(self.mapping_offset(inner), bytes)?;
        Ok(())
    }

    pub fn read(&self, span: HeapSpan) -> Result<Vec<u8>> {
        self.validate(span)?;
        let mut out = vec![0u8; span.len as usize];
        self.channel
            .memory()
            .read_at(self.mapping_offset(span), &mut out)?;
        Ok(out)
    }

    /// Reads `buf.len()` bytes from the start of `span`.
    pub fn read_into(&self, span: HeapSpan, buf: &mut [u8]) -> Result<()> {
        self.validate(span)?;
        if buf.len() as u64 > span.len {
            return Err(ChannelError::OutOfBounds {
                offset: span.offset,
                len: buf.len() as u64,
                heap_size: self.size(),
            });
        }
        self.channel
            .memory()
            .read_at(self.mapping_offset(span), buf)?;
        Ok(())
    }

    fn mapping_offset(&self, span: HeapSpan) -> usize {
        (self.channel.layout().heap_offset + span.offset) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("zero-length heap allocation")]
    ZeroLength,
    #[error("resource {0} is already allocated")]
    DuplicateResource(ResourceId),
    #[error("resource {0} is not allocated")]
    UnknownResource(ResourceId),
    #[error("heap exhausted: requested {requested} bytes, largest free block is {largest_free}")]
    OutOfMemory { requested: u64, largest_free: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Allocation {
    span: HeapSpan,
    reserved: u64,
}

/// First-fit allocator with a coalescing free list over `[0, heap_size)`.
///
/// Lives entirely on the producer side; the consumer never allocates.
#[derive(Debug)]
pub struct HeapAllocator {
    size: u64,
    /// offset -> length, non-adjacent.
    free: BTreeMap<u64, u64>,
    live: HashMap<ResourceId, Allocation>,
    /// fence -> resources released once that fence completes.
    deferred: BTreeMap<u64, Vec<(ResourceId, HeapSpan)>>,
}

impl HeapAllocator {
    pub fn new(heap_size: u64) -> Self {
        let mut allocator = Self {
            size: heap_size - heap_size % HEAP_ALIGN,
            free: BTreeMap::new(),
            live: HashMap::new(),
            deferred: BTreeMap::new(),
        };
        allocator.reset();
        allocator
    }

    pub fn for_heap(heap: &ResourceHeap) -> Self {
        Self::new(heap.size())
    }

    pub fn capacity(&self) -> u64 {
        self.size
    }

    pub fn free_bytes(&self) -> u64 {
        self.free.values().sum()
    }

    pub fn largest_free_block(&self) -> u64 {
        self.free.values().copied().max().unwrap_or(0)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn alloc(&mut self, id: ResourceId, len: u64) -> std::result::Result<HeapSpan, HeapError> {
        if len == 0 {
            return Err(HeapError::ZeroLength);
        }
        if self.live.contains_key(&id) {
            return Err(HeapError::DuplicateResource(id));
        }

        let out_of_memory = HeapError::OutOfMemory {
            requested: len,
            largest_free: self.largest_free_block(),
        };
        let reserved = len
            .checked_add(HEAP_ALIGN - 1)
            .map(|_| align_up(len, HEAP_ALIGN))
            .ok_or(out_of_memory)?;

        let (offset, block_len) = self
            .free
            .iter()
            .find(|&(_, &block_len)| block_len >= reserved)
            .map(|(&offset, &block_len)| (offset, block_len))
            .ok_or(out_of_memory)?;

        self.free.remove(&offset);
        if block_len > reserved {
            self.free.insert(offset + reserved, block_len - reserved);
        }

        let span = HeapSpan::new(offset, len);
        self.live.insert(id, Allocation { span, reserved });
        Ok(span)
    }

    pub fn get(&self, id: ResourceId) -> Option<HeapSpan> {
        self.live.get(&id).map(|a| a.span)
    }

    pub fn free(&mut self, id: ResourceId) -> std::result::Result<(), HeapError> {
        let allocation = self
            .live
            .remove(&id)
            .ok_or(HeapError::UnknownResource(id))?;
        self.release(allocation.span.offset, allocation.reserved);
        Ok(())
    }

    /// Schedules `id` to be freed once `fence` has completed (see [`HeapAllocator::reclaim`]).
    pub fn free_after_fence(
        &mut self,
        id: ResourceId,
        fence: u64,
    ) -> std::result::Result<(), HeapError> {
        let span = self.get(id).ok_or(HeapError::UnknownResource(id))?;
        self.deferred.entry(fence).or_default().push((id, span));
        Ok(())
    }

    /// Frees every deferred resource whose fence is `<= completed_fence`. Returns the freed ids.
    pub fn reclaim(&mut self, completed_fence: u64) -> Vec<ResourceId> {
        let still_pending = match completed_fence.checked_add(1) {
            Some(next) => self.deferred.split_off(&next),
            None => BTreeMap::new(),
        };
        let ready = std::mem::replace(&mut self.deferred, still_pending);

        let mut freed = Vec::new();
        for (id, span) in ready.into_values().flatten() {
            // Skip ids freed manually (and possibly re-allocated) since they were scheduled.
            if self.get(id) == Some(span) && self.free(id).is_ok() {
                freed.push(id);
            }
        }
        if !freed.is_empty() {
            tracing::trace!(completed_fence, count = freed.len(), "reclaimed heap resources");
        }
        freed
    }

    /// Drops every allocation and pending release.
    pub fn reset(&mut self) {
        self.live.clear();
        self.deferred.clear();
        self.free.clear();
        if self.size > 0 {
            self.free.insert(0, self.size);
        }
    }

    fn release(&mut self, mut offset: u64, mut len: u64) {
        if let Some((&prev_offset, &prev_len)) = self.free.range(..offset).next_back() {
            if prev_offset + prev_len == offset {
                self.free.remove(&prev_offset);
                offset = prev_offset;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free.remove(&(offset + len)) {
            len += next_len;
        }
        self.free.insert(offset, len);
    }
}
