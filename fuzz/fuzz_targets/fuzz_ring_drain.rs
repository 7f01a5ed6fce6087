#![no_main]

use std::sync::Arc;

use arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;

use aero_gpu_shm::control::{CONSUMER_PTR_OFFSET, PRODUCER_PTR_OFFSET};
use aero_gpu_shm::layout::min_channel_size;
use aero_gpu_shm::{Features, RingCommand, RingEntry, SharedMemory, ShmChannel, OPCODE_FENCE};

/// Small enough that wrapping frames are common.
const RING_SIZE: u64 = 256;

#[derive(Debug, Arbitrary)]
struct Input {
    consumer_ptr: u64,
    /// Bytes published past `consumer_ptr`; may exceed the ring.
    published: u16,
    ring: Vec<u8>,
    /// Frames pushed through the producer after the first drain.
    pushes: Vec<(u32, Vec<u8>)>,
}

fuzz_target!(|data: &[u8]| {
    let mut u = Unstructured::new(data);
    let Ok(input) = Input::arbitrary(&mut u) else {
        return;
    };

    let size = min_channel_size(RING_SIZE) as usize;
    let Ok(mem) = SharedMemory::anonymous(size) else {
        return;
    };
    let mem = Arc::new(mem);
    let channel = ShmChannel::create(mem.clone(), RING_SIZE, Features::SUPPORTED)
        .expect("channel over a fresh mapping");
    let ring_offset = channel.layout().ring_offset as usize;

    // A hostile or buggy producer: arbitrary ring contents and pointers.
    let ring_bytes = &input.ring[..input.ring.len().min(RING_SIZE as usize)];
    mem.write_at(ring_offset, ring_bytes).unwrap();
    let tail = input.consumer_ptr.wrapping_add(u64::from(input.published));
    mem.write_at(CONSUMER_PTR_OFFSET, &input.consumer_ptr.to_le_bytes())
        .unwrap();
    mem.write_at(PRODUCER_PTR_OFFSET, &tail.to_le_bytes()).unwrap();

    let mut consumer = channel.consumer().unwrap();
    let control = channel.control();
    let mut failed = false;
    for entry in consumer.drain() {
        let head = control.consumer_ptr();
        // Never read past what was published.
        assert!(tail.wrapping_sub(head) <= u64::from(input.published));
        if entry.is_err() {
            failed = true;
        }
    }
    assert_eq!(failed, control.is_faulted());
    if failed {
        // Faulted rings stay faulted until reset.
        assert!(consumer.drain().all(|entry| entry.is_err()));
    }

    // After a reset the ring must round-trip well-formed traffic exactly.
    channel.reset();
    assert!(!control.is_faulted());
    let mut producer = channel.producer().unwrap();
    let mut expected = Vec::new();
    for (opcode, payload) in input.pushes.into_iter().take(16) {
        if opcode == OPCODE_FENCE {
            continue;
        }
        if producer.try_push(opcode, &payload).is_err() {
            break;
        }
        expected.push(RingEntry::Command(RingCommand { opcode, payload }));
        let drained: Vec<_> = consumer.drain().collect::<Result<_, _>>().unwrap();
        assert_eq!(drained, expected);
        expected.clear();
    }
});
