//! Shared memory layout contract for the AeroGPU command channel.
//!
//! A channel occupies one contiguous mapping split into three windows:
//!
//! ```text
//! 0                      ring_offset            heap_offset              total_size
//! | control region (4K)  | command ring         | resource heap          |
//! ```
//!
//! Every offset is a byte offset from the start of the mapping. The guest, the relay and the host
//! backend all derive the same geometry from the values stamped into the control region.

use crate::error::{ChannelError, Result};

/// `b"AGCH"` as a little-endian `u32`.
pub const CHANNEL_MAGIC: u32 = 0x4843_4741;

/// Channel ABI version.
pub const CHANNEL_VERSION: u32 = 1;

/// Size reserved for the control region at offset 0.
pub const CONTROL_REGION_SIZE_BYTES: u64 = 4096;

/// All ring frames start on this boundary and are padded to it.
pub const FRAME_ALIGN: u64 = 8;

/// `{opcode: u32, payload_len: u32}`.
pub const FRAME_HEADER_SIZE_BYTES: u64 = 8;

pub const MIN_RING_SIZE_BYTES: u64 = 64;
pub const MAX_RING_SIZE_BYTES: u64 = 1 << 30;
pub const DEFAULT_RING_SIZE_BYTES: u64 = 256 * 1024;

/// Smallest heap window a channel may be created with.
pub const MIN_HEAP_SIZE_BYTES: u64 = 4096;

/// Allocation granule of the resource heap.
pub const HEAP_ALIGN: u64 = 64;

/// Reserved opcode carrying a `u64` fence value.
///
/// Frames with this opcode are surfaced as [`crate::RingEntry::Fence`] rather than as commands.
pub const OPCODE_FENCE: u32 = 0xFFFF_FF00;

pub const fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + (align - 1)) & !(align - 1)
}

/// Total aligned size of a frame carrying `payload_len` bytes, or `None` when the length cannot be
/// represented in the `u32` header field.
pub fn frame_size(payload_len: usize) -> Option<u64> {
    let len = u32::try_from(payload_len).ok()?;
    Some(align_up(FRAME_HEADER_SIZE_BYTES + u64::from(len), FRAME_ALIGN))
}

/// Smallest mapping that can hold a channel with the given ring size.
pub const fn min_channel_size(ring_size: u64) -> u64 {
    CONTROL_REGION_SIZE_BYTES + ring_size + MIN_HEAP_SIZE_BYTES
}

/// Geometry of a channel mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelLayout {
    pub total_size: u64,
    pub ring_offset: u64,
    pub ring_size: u64,
    pub heap_offset: u64,
    pub heap_size: u64,
}

impl ChannelLayout {
    pub fn new(total_size: u64, ring_size: u64) -> Result<Self> {
        if !ring_size.is_power_of_two() {
            return Err(ChannelError::InvalidConfiguration(
                "ring size must be a power of two",
            ));
        }
        if ring_size < MIN_RING_SIZE_BYTES {
            return Err(ChannelError::InvalidConfiguration("ring size is too small"));
        }
        if ring_size > MAX_RING_SIZE_BYTES {
            return Err(ChannelError::InvalidConfiguration("ring size is too large"));
        }
        if ring_size % FRAME_ALIGN != 0 {
            return Err(ChannelError::InvalidConfiguration(
                "ring size must be a multiple of the frame alignment",
            ));
        }
        if total_size < min_channel_size(ring_size) {
            return Err(ChannelError::InvalidConfiguration(
                "shared memory is too small for the requested ring",
            ));
        }

        let ring_offset = CONTROL_REGION_SIZE_BYTES;
        let heap_offset = ring_offset + ring_size;
        Ok(Self {
            total_size,
            ring_offset,
            ring_size,
            heap_offset,
            heap_size: total_size - heap_offset,
        })
    }

    /// Largest payload a single frame can carry in this ring.
    pub fn max_payload_len(&self) -> u64 {
        self.ring_size - FRAME_HEADER_SIZE_BYTES
    }

    pub(crate) fn ring_physical(&self, logical: u64) -> u64 {
        logical & (self.ring_size - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_is_contiguous_and_bounded() {
        let layout = ChannelLayout::new(1 << 20, 64 * 1024).unwrap();
        assert_eq!(layout.ring_offset, CONTROL_REGION_SIZE_BYTES);
        assert_eq!(layout.heap_offset, layout.ring_offset + layout.ring_size);
        assert_eq!(layout.heap_offset + layout.heap_size, layout.total_size);
    }

    #[test]
    fn rejects_bad_ring_sizes() {
        for ring_size in [0, 32, 96, 3 * 1024] {
            assert!(
                matches!(
                    ChannelLayout::new(1 << 20, ring_size),
                    Err(ChannelError::InvalidConfiguration(_))
                ),
                "ring_size={ring_size}"
            );
        }
    }

    #[test]
    fn rejects_mapping_without_room_for_heap() {
        let ring_size = 4096;
        let err = ChannelLayout::new(min_channel_size(ring_size) - 1, ring_size).unwrap_err();
        assert!(matches!(err, ChannelError::InvalidConfiguration(_)));
        ChannelLayout::new(min_channel_size(ring_size), ring_size).unwrap();
    }

    #[test]
    fn frame_size_rounds_to_alignment() {
        assert_eq!(frame_size(0), Some(8));
        assert_eq!(frame_size(1), Some(16));
        assert_eq!(frame_size(8), Some(16));
        assert_eq!(frame_size(56), Some(64));
        assert_eq!(frame_size(192), Some(200));
    }

    #[test]
    fn physical_offset_wraps() {
        let layout = ChannelLayout::new(1 << 20, 256).unwrap();
        assert_eq!(layout.ring_physical(0), 0);
        assert_eq!(layout.ring_physical(264), 8);
        assert_eq!(layout.ring_physical(512), 0);
    }
}
