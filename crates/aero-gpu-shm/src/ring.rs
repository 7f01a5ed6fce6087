//! Single-producer/single-consumer command ring.
//!
//! Frames are `{opcode: u32 LE, payload_len: u32 LE}` followed by the payload, padded to
//! `FRAME_ALIGN`. Pointers are monotonically increasing logical byte offsets; the physical
//! offset is `logical mod ring_size`.
//!
//! Because the ring size and every frame start are multiples of `FRAME_ALIGN`, a frame header
//! never straddles the physical end of the ring. Payload bytes may wrap to offset 0 and are
//! copied in two pieces, so the ring never loses space to wrap padding.
//!
//! The producer writes the frame, then publishes `producer_ptr` with `Release`; the consumer
//! loads it with `Acquire` before reading frame bytes.
//!
//! A guest reset can land in the middle of a drain. Every drain is tied to the reset epoch it
//! started in: the consumer moves `consumer_ptr` with a compare-and-swap, and a frame, fence
//! completion or fault from an earlier epoch is dropped rather than written over the fresh ring.

use std::sync::Arc;

use crate::channel::ShmChannel;
use crate::control::{ControlRegion, DisplayMode};
use crate::error::{ChannelError, FaultCode, PushError, Result};
use crate::layout::{frame_size, FRAME_HEADER_SIZE_BYTES, OPCODE_FENCE};

/// Default retry budget for [`RingProducer::push_spinning`].
pub const DEFAULT_PUSH_SPINS: u32 = 10_000;

/// Spins before `push_spinning` starts yielding the thread.
const SPINS_BEFORE_YIELD: u32 = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingCommand {
    pub opcode: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RingEntry {
    Command(RingCommand),
    Fence(u64),
}

fn encode_header(opcode: u32, payload_len: u32) -> [u8; FRAME_HEADER_SIZE_BYTES as usize] {
    let mut header = [0u8; FRAME_HEADER_SIZE_BYTES as usize];
    header[0..4].copy_from_slice(&opcode.to_le_bytes());
    header[4..8].copy_from_slice(&payload_len.to_le_bytes());
    header
}

fn decode_header(header: &[u8; FRAME_HEADER_SIZE_BYTES as usize]) -> (u32, u32) {
    let opcode = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    (opcode, len)
}

/// Writing side of the ring. Owns `producer_ptr` and `guest_fence_request`.
pub struct RingProducer {
    channel: Arc<ShmChannel>,
}

impl RingProducer {
    pub(crate) fn new(channel: Arc<ShmChannel>) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &Arc<ShmChannel> {
        &self.channel
    }

    fn control(&self) -> &ControlRegion {
        self.channel.control()
    }

    pub fn ring_size(&self) -> u64 {
        self.channel.layout().ring_size
    }

    pub fn used_bytes(&self) -> u64 {
        let control = self.control();
        let used = control
            .producer_ptr()
            .wrapping_sub(control.consumer_ptr());
        used.min(self.ring_size())
    }

    pub fn free_bytes(&self) -> u64 {
        self.ring_size() - self.used_bytes()
    }

    /// Appends one command frame without blocking.
    pub fn try_push(&mut self, opcode: u32, payload: &[u8]) -> std::result::Result<(), PushError> {
        if opcode == OPCODE_FENCE {
            return Err(PushError::ReservedOpcode(opcode));
        }
        self.push_frame(opcode, payload)
    }

    /// Like [`try_push`](Self::try_push), but retries with a spin/yield back-off for up to
    /// `max_spins` attempts while the ring is full. Never blocks indefinitely.
    pub fn push_spinning(
        &mut self,
        opcode: u32,
        payload: &[u8],
        max_spins: u32,
    ) -> std::result::Result<(), PushError> {
        let mut spins = 0u32;
        loop {
            match self.try_push(opcode, payload) {
                Err(PushError::Full { .. }) if spins < max_spins => {
                    spins += 1;
                    if spins < SPINS_BEFORE_YIELD {
                        std::hint::spin_loop();
                    } else {
                        std::thread::yield_now();
                    }
                }
                res => return res,
            }
        }
    }

    /// Pushes a fence marker carrying the next fence value and records it in
    /// `guest_fence_request`. Returns the fence value.
    pub fn try_push_fence(&mut self) -> std::result::Result<u64, PushError> {
        let fence = self.control().guest_fence_request().wrapping_add(1);
        self.push_frame(OPCODE_FENCE, &fence.to_le_bytes())?;
        self.control().request_fence(fence);
        Ok(fence)
    }

    /// Last fence value the consumer reported complete.
    pub fn completed_fence(&self) -> u64 {
        self.control().host_fence_completed()
    }

    pub fn is_fence_complete(&self, fence: u64) -> bool {
        self.completed_fence() >= fence
    }

    fn push_frame(&mut self, opcode: u32, payload: &[u8]) -> std::result::Result<(), PushError> {
        let ring_size = self.ring_size();
        let max = self.channel.layout().max_payload_len();
        let frame = frame_size(payload.len())
            .filter(|&frame| frame <= ring_size)
            .ok_or(PushError::TooLarge {
                len: payload.len() as u64,
                max,
            })?;

        let control = self.control();
        let tail = control.producer_ptr();
        let head = control.consumer_ptr();
        let used = tail.wrapping_sub(head);
        // `used > ring_size` only happens if the consumer side is corrupt; report no space.
        let free = ring_size.saturating_sub(used);
        if frame > free {
            return Err(PushError::Full {
                needed: frame,
                free,
            });
        }

        // Payload length fits in u32: checked by `frame_size`.
        self.channel
            .write_ring(tail, &encode_header(opcode, payload.len() as u32));
        self.channel
            .write_ring(tail.wrapping_add(FRAME_HEADER_SIZE_BYTES), payload);

        control.publish_producer_ptr(tail.wrapping_add(frame));
        Ok(())
    }
}

impl Drop for RingProducer {
    fn drop(&mut self) {
        self.channel.release_producer();
    }
}

/// Reading side of the ring. Owns `consumer_ptr`, `host_fence_completed`, `ring_state` and the
/// display mode.
pub struct RingConsumer {
    channel: Arc<ShmChannel>,
    /// Reset epoch of the most recent drain.
    epoch: u64,
}

impl RingConsumer {
    pub(crate) fn new(channel: Arc<ShmChannel>) -> Self {
        let epoch = channel.control().reset_epoch();
        Self { channel, epoch }
    }

    pub fn channel(&self) -> &Arc<ShmChannel> {
        &self.channel
    }

    fn control(&self) -> &ControlRegion {
        self.channel.control()
    }

    /// True when the producer has published frames that have not been drained yet.
    pub fn has_pending(&self) -> bool {
        let control = self.control();
        control.producer_ptr() != control.consumer_ptr()
    }

    /// Yields every frame published before this call, oldest first.
    ///
    /// The iteration is bounded by a snapshot of `producer_ptr` taken here; frames pushed while
    /// draining are left for the next call. The first error ends the iteration, and so does a
    /// channel reset.
    pub fn drain(&mut self) -> Drain<'_> {
        self.epoch = self.control().reset_epoch();
        let snapshot = self.control().producer_ptr();
        Drain {
            consumer: self,
            snapshot,
            done: false,
        }
    }

    /// Advances `host_fence_completed` to `fence`. Returns `true` if the counter moved, in which
    /// case the caller should raise a fence interrupt.
    ///
    /// A fence drained before a channel reset is not completed against the fresh ring.
    pub fn complete_fence(&self, fence: u64) -> bool {
        match self.control().complete_fence(self.epoch, fence) {
            Some(previous) => fence > previous,
            None => {
                tracing::debug!(fence, "dropping completion of a fence from before the reset");
                false
            }
        }
    }

    pub fn report_fault(&self, code: FaultCode) {
        if self.control().reset_epoch() != self.epoch {
            tracing::debug!(%code, "dropping fault raised before the channel reset");
            return;
        }
        tracing::warn!(%code, "reporting channel fault");
        self.control().set_error_code(code);
    }

    /// Returns the new display generation.
    pub fn publish_display_mode(&self, mode: DisplayMode) -> u32 {
        self.control().publish_display_mode(mode)
    }

    /// Faults the ring. `None` means the channel was reset since the drain began, so what looked
    /// like a violation was a stale snapshot.
    fn violation(&self, head: u64, reason: String) -> Option<Result<RingEntry>> {
        if !self.control().fault_ring(self.epoch, FaultCode::InvalidCommand) {
            tracing::debug!(consumer_ptr = head, %reason, "channel reset mid-drain");
            return None;
        }
        tracing::error!(consumer_ptr = head, %reason, "command ring protocol violation");
        Some(Err(ChannelError::ProtocolViolation(reason)))
    }

    fn next_entry(&mut self, snapshot: u64) -> Option<Result<RingEntry>> {
        let control = self.control();
        if control.reset_epoch() != self.epoch {
            return None;
        }
        if control.is_faulted() {
            return Some(Err(ChannelError::ProtocolViolation(
                "command ring is faulted; reset required".to_string(),
            )));
        }

        let head = control.consumer_ptr();
        if head == snapshot {
            return None;
        }

        let available = snapshot.wrapping_sub(head);

        let ring_size = self.channel.layout().ring_size;
        if available > ring_size {
            return self.violation(
                head,
                format!("producer is {available} bytes ahead of a {ring_size} byte ring"),
            );
        }
        if available < FRAME_HEADER_SIZE_BYTES {
            return self.violation(
                head,
                format!("only {available} bytes published, frame header needs {FRAME_HEADER_SIZE_BYTES}"),
            );
        }

        let mut header = [0u8; FRAME_HEADER_SIZE_BYTES as usize];
        self.channel.read_ring(head, &mut header);
        let (opcode, len) = decode_header(&header);

        let frame = match frame_size(len as usize) {
            Some(frame) if frame <= ring_size => frame,
            _ => {
                return self.violation(
                    head,
                    format!("frame payload of {len} bytes does not fit a {ring_size} byte ring"),
                )
            }
        };
        if frame > available {
            return self.violation(
                head,
                format!("frame of {frame} bytes extends past the {available} published bytes"),
            );
        }

        let mut payload = vec![0u8; len as usize];
        self.channel
            .read_ring(head.wrapping_add(FRAME_HEADER_SIZE_BYTES), &mut payload);

        let entry = if opcode == OPCODE_FENCE {
            let Ok(bytes) = <[u8; 8]>::try_from(payload.as_slice()) else {
                return self.violation(
                    head,
                    format!("fence frame carries {len} bytes, expected 8"),
                );
            };
            RingEntry::Fence(u64::from_le_bytes(bytes))
        } else {
            RingEntry::Command(RingCommand { opcode, payload })
        };

        // Fails if a reset zeroed the pointers while the frame was being copied out.
        if !control.advance_consumer_ptr(self.epoch, head, head.wrapping_add(frame)) {
            tracing::debug!(consumer_ptr = head, "channel reset mid-drain; dropping frame");
            return None;
        }
        Some(Ok(entry))
    }
}

impl Drop for RingConsumer {
    fn drop(&mut self) {
        self.channel.release_consumer();
    }
}

/// Iterator returned by [`RingConsumer::drain`].
pub struct Drain<'a> {
    consumer: &'a mut RingConsumer,
    snapshot: u64,
    done: bool,
}

impl Iterator for Drain<'_> {
    type Item = Result<RingEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.consumer.next_entry(self.snapshot) {
            Some(Ok(entry)) => Some(Ok(entry)),
            Some(Err(err)) => {
                self.done = true;
                Some(Err(err))
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}
