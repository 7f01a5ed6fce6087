//! Control region at offset 0 of every channel mapping.
//!
//! The region is a `#[repr(C)]` block of atomics so that it can be shared between address spaces
//! without locks. The producer and consumer pointers sit on separate cache lines because they are
//! written from different sides at high frequency.
//!
//! Ownership of each field:
//!
//! | field | written by |
//! |---|---|
//! | header + geometry, `reset_epoch` | initializer (create / reset) |
//! | `producer_ptr`, `guest_fence_request` | producer |
//! | `consumer_ptr`, `host_fence_completed`, `ring_state`, display mode | consumer |
//! | `error_code` | consumer sets, producer clears (compare-and-clear) |
//!
//! A reset may land while the consumer is mid-drain. `reset_epoch` is bumped before the pointers
//! are zeroed; the consumer advances `consumer_ptr` and `host_fence_completed` with a
//! compare-and-swap and re-reads the epoch afterwards, undoing its write if a reset overlapped.

use std::mem::{offset_of, size_of};
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

use crate::error::FaultCode;
use crate::features::Features;
use crate::layout::{ChannelLayout, CHANNEL_MAGIC, CHANNEL_VERSION, CONTROL_REGION_SIZE_BYTES};

pub const RING_STATE_ACTIVE: u32 = 0;
pub const RING_STATE_FAULTED: u32 = 1;

/// Internal bit used to mark `display_generation` as "being updated".
///
/// Published generations never have this bit set and increment by 1 per completed update.
pub const DISPLAY_GENERATION_BUSY_BIT: u32 = 1 << 31;

/// Attempts [`ControlRegion::display_mode`] makes before giving up on a held busy bit. The
/// first `DISPLAY_READ_SPINS` spin; the rest yield the thread.
const DISPLAY_READ_ATTEMPTS: u32 = 4096;
const DISPLAY_READ_SPINS: u32 = 64;

/// Display mode published by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayMode {
    pub width: u32,
    pub height: u32,
    pub refresh_mhz: u32,
    pub pixel_format: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayModeSnapshot {
    pub generation: u32,
    pub mode: DisplayMode,
}

#[repr(C)]
pub struct ControlRegion {
    magic: AtomicU32,
    version: AtomicU32,
    features: AtomicU64,
    total_size: AtomicU64,
    ring_offset: AtomicU64,
    ring_size: AtomicU64,
    heap_offset: AtomicU64,
    heap_size: AtomicU64,
    reset_epoch: AtomicU64,

    producer_ptr: AtomicU64,
    _pad_producer: [u64; 7],

    consumer_ptr: AtomicU64,
    _pad_consumer: [u64; 7],

    guest_fence_request: AtomicU64,
    host_fence_completed: AtomicU64,
    error_code: AtomicU32,
    ring_state: AtomicU32,
    _reserved1: [u64; 5],

    display_generation: AtomicU32,
    display_width: AtomicU32,
    display_height: AtomicU32,
    display_refresh_mhz: AtomicU32,
    display_pixel_format: AtomicU32,
    _reserved2: [u32; 3],
}

pub const MAGIC_OFFSET: usize = offset_of!(ControlRegion, magic);
pub const FEATURES_OFFSET: usize = offset_of!(ControlRegion, features);
pub const RESET_EPOCH_OFFSET: usize = offset_of!(ControlRegion, reset_epoch);
pub const PRODUCER_PTR_OFFSET: usize = offset_of!(ControlRegion, producer_ptr);
pub const CONSUMER_PTR_OFFSET: usize = offset_of!(ControlRegion, consumer_ptr);
pub const GUEST_FENCE_REQUEST_OFFSET: usize = offset_of!(ControlRegion, guest_fence_request);
pub const HOST_FENCE_COMPLETED_OFFSET: usize = offset_of!(ControlRegion, host_fence_completed);
pub const ERROR_CODE_OFFSET: usize = offset_of!(ControlRegion, error_code);
pub const RING_STATE_OFFSET: usize = offset_of!(ControlRegion, ring_state);
pub const DISPLAY_GENERATION_OFFSET: usize = offset_of!(ControlRegion, display_generation);

const _: () = assert!(size_of::<ControlRegion>() <= CONTROL_REGION_SIZE_BYTES as usize);
const _: () = assert!(PRODUCER_PTR_OFFSET % 64 == 0);
const _: () = assert!(CONSUMER_PTR_OFFSET % 64 == 0);
const _: () = assert!(CONSUMER_PTR_OFFSET - PRODUCER_PTR_OFFSET >= 64);

impl ControlRegion {
    /// Writes the initial state for `layout` under reset epoch `epoch`. The magic is cleared first
    /// and published last so a concurrent `attach` never accepts a half-written header.
    pub(crate) fn stamp(&self, layout: &ChannelLayout, features: Features, epoch: u64) {
        // The epoch goes out before any counter is zeroed.
        self.reset_epoch.store(epoch, Ordering::SeqCst);
        self.magic.store(0, Ordering::Release);
        self.version.store(0, Ordering::Relaxed);

        self.producer_ptr.store(0, Ordering::SeqCst);
        self.consumer_ptr.store(0, Ordering::SeqCst);
        self.guest_fence_request.store(0, Ordering::Relaxed);
        self.host_fence_completed.store(0, Ordering::SeqCst);
        self.error_code.store(FaultCode::None.as_u32(), Ordering::SeqCst);
        self.ring_state.store(RING_STATE_ACTIVE, Ordering::SeqCst);

        self.display_generation.store(0, Ordering::Relaxed);
        self.display_width.store(0, Ordering::Relaxed);
        self.display_height.store(0, Ordering::Relaxed);
        self.display_refresh_mhz.store(0, Ordering::Relaxed);
        self.display_pixel_format.store(0, Ordering::Relaxed);

        self.features.store(features.bits(), Ordering::Relaxed);
        self.total_size.store(layout.total_size, Ordering::Relaxed);
        self.ring_offset.store(layout.ring_offset, Ordering::Relaxed);
        self.ring_size.store(layout.ring_size, Ordering::Relaxed);
        self.heap_offset.store(layout.heap_offset, Ordering::Relaxed);
        self.heap_size.store(layout.heap_size, Ordering::Relaxed);

        self.version.store(CHANNEL_VERSION, Ordering::Relaxed);
        self.magic.store(CHANNEL_MAGIC, Ordering::Release);
    }

    pub fn magic(&self) -> u32 {
        self.magic.load(Ordering::Acquire)
    }

    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    /// Number of resets since the channel was created.
    pub fn reset_epoch(&self) -> u64 {
        self.reset_epoch.load(Ordering::SeqCst)
    }

    pub fn features(&self) -> Features {
        Features::from_bits_retain(self.features.load(Ordering::Acquire))
    }

    /// Overwrites the feature word with the set negotiated during the handshake.
    pub fn set_features(&self, features: Features) {
        self.features.store(features.bits(), Ordering::Release);
    }

    /// Geometry as stamped in the header (not validated).
    pub fn stamped_layout(&self) -> ChannelLayout {
        ChannelLayout {
            total_size: self.total_size.load(Ordering::Acquire),
            ring_offset: self.ring_offset.load(Ordering::Acquire),
            ring_size: self.ring_size.load(Ordering::Acquire),
            heap_offset: self.heap_offset.load(Ordering::Acquire),
            heap_size: self.heap_size.load(Ordering::Acquire),
        }
    }

    pub fn producer_ptr(&self) -> u64 {
        self.producer_ptr.load(Ordering::Acquire)
    }

    pub fn consumer_ptr(&self) -> u64 {
        self.consumer_ptr.load(Ordering::Acquire)
    }

    pub(crate) fn publish_producer_ptr(&self, value: u64) {
        self.producer_ptr.store(value, Ordering::Release);
    }

    /// Moves `consumer_ptr` from `from` to `to` within reset epoch `epoch`. Returns `false`, with
    /// the pointer left as the reset wrote it, if a reset got in the way.
    pub(crate) fn advance_consumer_ptr(&self, epoch: u64, from: u64, to: u64) -> bool {
        if self
            .consumer_ptr
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        if self.reset_epoch() != epoch {
            let _ = self
                .consumer_ptr
                .compare_exchange(to, 0, Ordering::SeqCst, Ordering::SeqCst);
            return false;
        }
        true
    }

    pub fn guest_fence_request(&self) -> u64 {
        self.guest_fence_request.load(Ordering::Acquire)
    }

    pub(crate) fn request_fence(&self, value: u64) {
        self.guest_fence_request.fetch_max(value, Ordering::AcqRel);
    }

    pub fn host_fence_completed(&self) -> u64 {
        self.host_fence_completed.load(Ordering::Acquire)
    }

    /// Advances `host_fence_completed` to `value` for a fence drained in reset epoch `epoch` and
    /// returns the previous value; the counter never decreases within an epoch. Returns `None`
    /// if the fence belongs to a ring that has since been reset.
    pub(crate) fn complete_fence(&self, epoch: u64, value: u64) -> Option<u64> {
        if self.reset_epoch() != epoch {
            return None;
        }
        let previous = self
            .host_fence_completed
            .fetch_max(value, Ordering::SeqCst);
        if self.reset_epoch() != epoch {
            if value > previous {
                let _ = self.host_fence_completed.compare_exchange(
                    value,
                    0,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            }
            return None;
        }
        Some(previous)
    }

    pub fn error_code(&self) -> FaultCode {
        FaultCode::from_u32(self.error_code.load(Ordering::Acquire))
    }

    pub(crate) fn set_error_code(&self, code: FaultCode) {
        self.error_code.store(code.as_u32(), Ordering::Release);
    }

    /// Clears `error_code` if it still holds `observed`. Returns `false` when a newer fault
    /// replaced it in the meantime, which must then be handled separately.
    pub fn acknowledge_fault(&self, observed: FaultCode) -> bool {
        self.error_code
            .compare_exchange(
                observed.as_u32(),
                FaultCode::None.as_u32(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn is_faulted(&self) -> bool {
        self.ring_state.load(Ordering::Acquire) == RING_STATE_FAULTED
    }

    /// Records `code` and moves the ring to FAULTED, unless the ring was reset after epoch
    /// `epoch`. A fault that raced with a reset is withdrawn and `false` is returned.
    pub(crate) fn fault_ring(&self, epoch: u64, code: FaultCode) -> bool {
        if self.reset_epoch() != epoch {
            return false;
        }
        self.error_code.store(code.as_u32(), Ordering::SeqCst);
        self.ring_state.store(RING_STATE_FAULTED, Ordering::SeqCst);
        if self.reset_epoch() != epoch {
            let _ = self.ring_state.compare_exchange(
                RING_STATE_FAULTED,
                RING_STATE_ACTIVE,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            let _ = self.acknowledge_fault(code);
            return false;
        }
        true
    }

    /// Publishes a complete display mode and returns its generation.
    ///
    /// `display_generation` doubles as a sequence lock: the busy bit is held while the fields are
    /// written, and the release store of the next generation makes them visible together.
    pub(crate) fn publish_display_mode(&self, mode: DisplayMode) -> u32 {
        let previous = loop {
            let previous = self
                .display_generation
                .fetch_or(DISPLAY_GENERATION_BUSY_BIT, Ordering::Acquire);
            if previous & DISPLAY_GENERATION_BUSY_BIT == 0 {
                break previous;
            }
            std::hint::spin_loop();
        };
        fence(Ordering::Release);

        let DisplayMode {
            width,
            height,
            refresh_mhz,
            pixel_format,
        } = mode;
        self.display_width.store(width, Ordering::Relaxed);
        self.display_height.store(height, Ordering::Relaxed);
        self.display_refresh_mhz.store(refresh_mhz, Ordering::Relaxed);
        self.display_pixel_format.store(pixel_format, Ordering::Relaxed);

        let generation = previous.wrapping_add(1) & !DISPLAY_GENERATION_BUSY_BIT;
        self.display_generation.store(generation, Ordering::Release);
        generation
    }

    /// Reads a coherent display mode.
    ///
    /// Returns `None` if every attempt raced an update, which in practice means the peer died
    /// with the busy bit held; a channel reset clears it.
    pub fn display_mode(&self) -> Option<DisplayModeSnapshot> {
        let mut generation = 0;
        for attempt in 0..DISPLAY_READ_ATTEMPTS {
            if attempt >= DISPLAY_READ_SPINS {
                std::thread::yield_now();
            } else if attempt > 0 {
                std::hint::spin_loop();
            }

            generation = self.display_generation.load(Ordering::Acquire);
            if generation & DISPLAY_GENERATION_BUSY_BIT != 0 {
                continue;
            }
            let mode = DisplayMode {
                width: self.display_width.load(Ordering::Relaxed),
                height: self.display_height.load(Ordering::Relaxed),
                refresh_mhz: self.display_refresh_mhz.load(Ordering::Relaxed),
                pixel_format: self.display_pixel_format.load(Ordering::Relaxed),
            };
            fence(Ordering::Acquire);
            if self.display_generation.load(Ordering::Relaxed) == generation {
                return Some(DisplayModeSnapshot { generation, mode });
            }
        }
        tracing::warn!(generation, "display mode is stuck mid-update");
        None
    }
}
