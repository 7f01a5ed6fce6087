//! Shared-memory half of the AeroGPU command channel.
//!
//! A channel is one mapping shared by the guest (producer), the hypervisor relay and the host
//! rendering backend (consumer). It starts with a [`ControlRegion`], followed by a
//! single-producer/single-consumer command ring and a resource heap for bulk data. See
//! [`layout`] for the exact geometry.
//!
//! ```
//! use std::sync::Arc;
//! use aero_gpu_shm::{Features, RingEntry, SharedMemory, ShmChannel};
//!
//! let mem = Arc::new(SharedMemory::anonymous(64 * 1024).unwrap());
//! let channel = ShmChannel::create(mem, 4096, Features::SUPPORTED).unwrap();
//!
//! let mut producer = channel.producer().unwrap();
//! let mut consumer = channel.consumer().unwrap();
//! producer.try_push(0x10, b"draw").unwrap();
//! let fence = producer.try_push_fence().unwrap();
//!
//! let entries: Vec<RingEntry> = consumer.drain().collect::<Result<_, _>>().unwrap();
//! for entry in entries {
//!     if let RingEntry::Fence(value) = entry {
//!         consumer.complete_fence(value);
//!     }
//! }
//! assert!(producer.is_fence_complete(fence));
//! ```

mod channel;
pub mod control;
mod error;
mod features;
pub mod heap;
pub mod layout;
mod region;
mod ring;

pub use channel::ShmChannel;
pub use control::{ControlRegion, DisplayMode, DisplayModeSnapshot};
pub use error::{ChannelError, FaultCode, PushError, Result};
pub use features::Features;
pub use heap::{HeapAllocator, HeapError, HeapSpan, ResourceHeap, ResourceId};
pub use layout::{ChannelLayout, OPCODE_FENCE};
pub use region::{SharedMemory, PAGE_SIZE};
pub use ring::{Drain, RingCommand, RingConsumer, RingEntry, RingProducer, DEFAULT_PUSH_SPINS};
