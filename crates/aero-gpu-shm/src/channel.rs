use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::control::ControlRegion;
use crate::error::{ChannelError, Result};
use crate::features::Features;
use crate::heap::ResourceHeap;
use crate::layout::{ChannelLayout, CHANNEL_MAGIC, CHANNEL_VERSION};
use crate::region::SharedMemory;
use crate::ring::{RingConsumer, RingProducer};

/// One side's view of a channel mapping.
///
/// The initializing side calls [`ShmChannel::create`]; the peer mapping the same memory calls
/// [`ShmChannel::attach`]. Each view hands out at most one [`RingProducer`] and one
/// [`RingConsumer`] at a time.
pub struct ShmChannel {
    mem: Arc<SharedMemory>,
    layout: ChannelLayout,
    features: AtomicU64,
    producer_claimed: AtomicBool,
    consumer_claimed: AtomicBool,
}

impl ShmChannel {
    /// Stamps a fresh control region over `mem` and returns the initializer's view.
    pub fn create(mem: Arc<SharedMemory>, ring_size: u64, features: Features) -> Result<Arc<Self>> {
        let layout = ChannelLayout::new(mem.len() as u64, ring_size)?;
        let channel = Self::with_layout(mem, layout, features);
        channel.control().stamp(&layout, features, 0);
        tracing::debug!(
            identifier = channel.mem.identifier(),
            total_size = layout.total_size,
            ring_size = layout.ring_size,
            heap_size = layout.heap_size,
            features = features.bits(),
            "initialized channel control region"
        );
        Ok(Arc::new(channel))
    }

    /// Validates the control region stamped by the peer and returns a view over it.
    pub fn attach(mem: Arc<SharedMemory>) -> Result<Arc<Self>> {
        if (mem.len() as u64) < crate::layout::CONTROL_REGION_SIZE_BYTES {
            return Err(ChannelError::InvalidConfiguration(
                "mapping is smaller than the control region",
            ));
        }
        // SAFETY: length checked above; see `control`.
        let control = unsafe { &*(mem.as_ptr() as *const ControlRegion) };

        let magic = control.magic();
        let version = control.version();
        if magic != CHANNEL_MAGIC || version != CHANNEL_VERSION {
            return Err(ChannelError::VersionMismatch { magic, version });
        }

        let stamped = control.stamped_layout();
        if stamped.total_size > mem.len() as u64 {
            return Err(ChannelError::InvalidConfiguration(
                "control region describes more memory than is mapped",
            ));
        }
        let expected = ChannelLayout::new(stamped.total_size, stamped.ring_size)?;
        if expected != stamped {
            return Err(ChannelError::InvalidConfiguration(
                "control region geometry is inconsistent",
            ));
        }

        let features = control.features();
        Ok(Arc::new(Self::with_layout(mem, expected, features)))
    }

    fn with_layout(mem: Arc<SharedMemory>, layout: ChannelLayout, features: Features) -> Self {
        Self {
            mem,
            layout,
            features: AtomicU64::new(features.bits()),
            producer_claimed: AtomicBool::new(false),
            consumer_claimed: AtomicBool::new(false),
        }
    }

    /// Returns the control region to its initial state: pointers, fences, error code, ring state
    /// and display mode are zeroed and the geometry is re-stamped. Apart from the reset epoch,
    /// calling it twice in a row leaves a byte-identical header.
    ///
    /// In-flight frames are discarded. The producer must be quiescent; a consumer that is
    /// mid-drain notices the epoch change and stops without touching the fresh ring.
    pub fn reset(&self) {
        let features = Features::from_bits_retain(self.features.load(Ordering::Acquire));
        let control = self.control();
        let epoch = control.reset_epoch().wrapping_add(1);
        control.stamp(&self.layout, features, epoch);
        tracing::info!(identifier = self.mem.identifier(), epoch, "channel reset");
    }

    /// Records the negotiated feature set in the header; survives later resets.
    pub fn set_features(&self, features: Features) {
        self.features.store(features.bits(), Ordering::Release);
        self.control().set_features(features);
    }

    pub fn layout(&self) -> &ChannelLayout {
        &self.layout
    }

    pub fn memory(&self) -> &Arc<SharedMemory> {
        &self.mem
    }

    pub fn control(&self) -> &ControlRegion {
        // SAFETY: the mapping is page aligned, at least `CONTROL_REGION_SIZE_BYTES` long (checked
        // by `ChannelLayout::new`/`attach`) and outlives `self`. Every field is an atomic or
        // never-written padding, so sharing the reference across threads and processes is sound.
        unsafe { &*(self.mem.as_ptr() as *const ControlRegion) }
    }

    /// Claims the producer side of this view.
    pub fn producer(self: &Arc<Self>) -> Result<RingProducer> {
        if self.producer_claimed.swap(true, Ordering::AcqRel) {
            return Err(ChannelError::InvalidConfiguration(
                "ring producer already claimed",
            ));
        }
        Ok(RingProducer::new(self.clone()))
    }

    /// Claims the consumer side of this view.
    pub fn consumer(self: &Arc<Self>) -> Result<RingConsumer> {
        if self.consumer_claimed.swap(true, Ordering::AcqRel) {
            return Err(ChannelError::InvalidConfiguration(
                "ring consumer already claimed",
            ));
        }
        Ok(RingConsumer::new(self.clone()))
    }

    pub(crate) fn release_producer(&self) {
        self.producer_claimed.store(false, Ordering::Release);
    }

    pub(crate) fn release_consumer(&self) {
        self.consumer_claimed.store(false, Ordering::Release);
    }

    pub fn heap(self: &Arc<Self>) -> ResourceHeap {
        ResourceHeap::new(self.clone())
    }

    /// Copies `bytes` into the ring starting at logical offset `logical`, wrapping at the end.
    pub(crate) fn write_ring(&self, logical: u64, bytes: &[u8]) {
        let (first, second) = self.split_ring(logical, bytes.len());
        let (head, tail) = bytes.split_at(first.1);
        self.copy_in(first.0, head);
        self.copy_in(second, tail);
    }

    pub(crate) fn read_ring(&self, logical: u64, out: &mut [u8]) {
        let (first, second) = self.split_ring(logical, out.len());
        let (head, tail) = out.split_at_mut(first.1);
        self.copy_out(first.0, head);
        self.copy_out(second, tail);
    }

    /// Returns `((mapping offset, len) of the first piece, mapping offset of the wrapped piece)`.
    fn split_ring(&self, logical: u64, len: usize) -> ((usize, usize), usize) {
        debug_assert!(len as u64 <= self.layout.ring_size);
        let physical = self.layout.ring_physical(logical);
        let until_end = (self.layout.ring_size - physical) as usize;
        let first_len = len.min(until_end);
        let base = self.layout.ring_offset as usize;
        ((base + physical as usize, first_len), base)
    }

    fn copy_in(&self, offset: usize, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        debug_assert!(offset + bytes.len() <= self.mem.len());
        // SAFETY: ring offsets are derived from the validated layout and stay inside the mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.mem.as_ptr().add(offset), bytes.len())
        };
    }

    fn copy_out(&self, offset: usize, out: &mut [u8]) {
        if out.is_empty() {
            return;
        }
        debug_assert!(offset + out.len() <= self.mem.len());
        // SAFETY: see `copy_in`.
        unsafe {
            std::ptr::copy_nonoverlapping(self.mem.as_ptr().add(offset), out.as_mut_ptr(), out.len())
        };
    }
}

impl std::fmt::Debug for ShmChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmChannel")
            .field("identifier", &self.mem.identifier())
            .field("layout", &self.layout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{DisplayMode, RESET_EPOCH_OFFSET};
    use crate::error::FaultCode;
    use crate::layout::{min_channel_size, CONTROL_REGION_SIZE_BYTES};
    use pretty_assertions::assert_eq;

    fn header_bytes(channel: &ShmChannel) -> Vec<u8> {
        let mut buf = vec![0u8; CONTROL_REGION_SIZE_BYTES as usize];
        channel.memory().read_at(0, &mut buf).unwrap();
        buf
    }

    fn without_epoch(mut header: Vec<u8>) -> Vec<u8> {
        header[RESET_EPOCH_OFFSET..RESET_EPOCH_OFFSET + 8].fill(0);
        header
    }

    fn new_channel(ring_size: u64) -> Arc<ShmChannel> {
        let mem = Arc::new(SharedMemory::anonymous(64 * 1024).unwrap());
        ShmChannel::create(mem, ring_size, Features::SUPPORTED).unwrap()
    }

    #[test]
    fn create_twice_with_same_inputs_is_byte_identical() {
        let a = new_channel(4096);
        let b = new_channel(4096);
        assert_eq!(header_bytes(&a), header_bytes(&b));
        assert_eq!(a.layout(), b.layout());
    }

    #[test]
    fn consecutive_resets_zero_state_and_keep_geometry() {
        let channel = new_channel(1024);
        let pristine = header_bytes(&channel);

        let mut producer = channel.producer().unwrap();
        let consumer = channel.consumer().unwrap();
        producer.try_push(7, &[1, 2, 3]).unwrap();
        producer.try_push_fence().unwrap();
        consumer.complete_fence(1);
        consumer.report_fault(FaultCode::DeviceLost);
        consumer.publish_display_mode(DisplayMode {
            width: 640,
            height: 480,
            refresh_mhz: 60_000,
            pixel_format: 1,
        });
        assert_ne!(header_bytes(&channel), pristine);

        channel.reset();
        let first = header_bytes(&channel);
        channel.reset();
        let second = header_bytes(&channel);

        assert_eq!(without_epoch(first), pristine);
        assert_eq!(without_epoch(second), pristine);
        let control = channel.control();
        assert_eq!(control.reset_epoch(), 2);
        assert_eq!(control.producer_ptr(), 0);
        assert_eq!(control.consumer_ptr(), 0);
        assert_eq!(control.guest_fence_request(), 0);
        assert_eq!(control.host_fence_completed(), 0);
        assert_eq!(control.error_code(), FaultCode::None);
        assert!(!control.is_faulted());
        assert_eq!(control.stamped_layout(), *channel.layout());
    }

    #[test]
    fn attach_sees_creator_geometry() {
        let mem = Arc::new(SharedMemory::anonymous(64 * 1024).unwrap());
        let created = ShmChannel::create(mem.clone(), 2048, Features::BASELINE).unwrap();
        let attached = ShmChannel::attach(mem).unwrap();
        assert_eq!(attached.layout(), created.layout());
        assert_eq!(attached.control().features(), Features::BASELINE);
    }

    #[test]
    fn attach_rejects_unstamped_memory() {
        let mem = Arc::new(SharedMemory::anonymous(64 * 1024).unwrap());
        let err = ShmChannel::attach(mem).unwrap_err();
        assert!(matches!(
            err,
            ChannelError::VersionMismatch {
                magic: 0,
                version: 0
            }
        ));
    }

    #[test]
    fn attach_rejects_header_larger_than_mapping() {
        let big = Arc::new(SharedMemory::anonymous(64 * 1024).unwrap());
        ShmChannel::create(big.clone(), 1024, Features::BASELINE).unwrap();

        let mut header = vec![0u8; CONTROL_REGION_SIZE_BYTES as usize];
        big.read_at(0, &mut header).unwrap();
        let small = Arc::new(SharedMemory::anonymous(min_channel_size(1024) as usize).unwrap());
        small.write_at(0, &header).unwrap();

        let err = ShmChannel::attach(small).unwrap_err();
        assert!(matches!(err, ChannelError::InvalidConfiguration(_)));
    }

    #[test]
    fn create_rejects_small_mapping() {
        let mem = Arc::new(SharedMemory::anonymous(4096).unwrap());
        let err = ShmChannel::create(mem, 1024, Features::BASELINE).unwrap_err();
        assert!(matches!(err, ChannelError::InvalidConfiguration(_)));
    }

    #[test]
    fn producer_and_consumer_are_claimed_once() {
        let channel = new_channel(1024);
        let producer = channel.producer().unwrap();
        assert!(channel.producer().is_err());
        drop(producer);
        channel.producer().unwrap();

        let _consumer = channel.consumer().unwrap();
        assert!(channel.consumer().is_err());
    }

    #[test]
    fn negotiated_features_survive_reset() {
        let channel = new_channel(1024);
        channel.set_features(Features::BASELINE | Features::FENCE_IRQ);
        channel.reset();
        assert_eq!(
            channel.control().features(),
            Features::BASELINE | Features::FENCE_IRQ
        );
    }
}
