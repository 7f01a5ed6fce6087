//! Relay and backend talking over a Unix socket, sharing one in-process mapping.
#![cfg(unix)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aero_gpu_backend::{serve, BackendConfig, CommandExecutor, InProcessResolver};
use aero_gpu_notify::{Endpoint, Listener, NotifyError};
use aero_gpu_relay::regs::{irq_bits, mmio, status_bits, RESET_VALUE};
use aero_gpu_relay::{Acceleration, InterruptSink, RelayConfig, RelayDevice, RelayError};
use aero_gpu_shm::control::PRODUCER_PTR_OFFSET;
use aero_gpu_shm::{
    DisplayMode, FaultCode, Features, HeapAllocator, HeapSpan, ResourceHeap, RingCommand,
    SharedMemory,
};
use pretty_assertions::assert_eq;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const OP_UPLOAD: u32 = 0x100;
const OP_SET_MODE: u32 = 0x200;
const OP_BROKEN_SHADER: u32 = 0xbad;

#[derive(Default)]
struct Record {
    opcodes: Vec<u32>,
    uploads: Vec<Vec<u8>>,
    resets: u32,
}

/// Reads uploads out of the heap and turns mode commands into display mode changes.
struct TestExecutor {
    record: Arc<Mutex<Record>>,
    pending_mode: Option<DisplayMode>,
}

impl CommandExecutor for TestExecutor {
    fn execute(&mut self, heap: &ResourceHeap, command: &RingCommand) -> Result<(), FaultCode> {
        let mut record = self.record.lock().unwrap();
        record.opcodes.push(command.opcode);
        match command.opcode {
            OP_UPLOAD => {
                let span = HeapSpan::decode(&command.payload).ok_or(FaultCode::InvalidCommand)?;
                let bytes = heap.read(span).map_err(|_| FaultCode::ResourceNotFound)?;
                record.uploads.push(bytes);
            }
            OP_SET_MODE => {
                let word = |i: usize| {
                    u32::from_le_bytes(command.payload[i * 4..i * 4 + 4].try_into().unwrap())
                };
                self.pending_mode = Some(DisplayMode {
                    width: word(0),
                    height: word(1),
                    refresh_mhz: 60_000,
                    pixel_format: 1,
                });
            }
            OP_BROKEN_SHADER => return Err(FaultCode::ShaderCompileFailed),
            _ => {}
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.record.lock().unwrap().resets += 1;
        self.pending_mode = None;
    }

    fn take_display_mode(&mut self) -> Option<DisplayMode> {
        self.pending_mode.take()
    }
}

#[derive(Default)]
struct Line(AtomicBool);

impl InterruptSink for Line {
    fn set_level(&self, asserted: bool) {
        self.0.store(asserted, Ordering::SeqCst);
    }
}

struct Rig {
    _dir: tempfile::TempDir,
    endpoint: Endpoint,
    mem: Arc<SharedMemory>,
    resolver: Arc<InProcessResolver>,
    record: Arc<Mutex<Record>>,
    stop: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<aero_gpu_backend::Result<()>>>,
}

impl Rig {
    async fn start(tweak: impl FnOnce(&mut BackendConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::Unix(dir.path().join("gpu.sock"));
        let mut config = BackendConfig::new(endpoint.clone());
        tweak(&mut config);

        let mem = Arc::new(SharedMemory::anonymous(128 * 1024).unwrap());
        let resolver = Arc::new(InProcessResolver::new());
        let record = Arc::new(Mutex::new(Record::default()));
        let listener = Listener::bind(&endpoint).await.unwrap();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = {
            let resolver = resolver.clone();
            let record = record.clone();
            tokio::spawn(async move {
                serve(
                    &listener,
                    &config,
                    &*resolver,
                    move || TestExecutor {
                        record: record.clone(),
                        pending_mode: None,
                    },
                    async {
                        let _ = stop_rx.await;
                    },
                )
                .await
            })
        };

        Self {
            _dir: dir,
            endpoint,
            mem,
            resolver,
            record,
            stop: Some(stop_tx),
            server: Some(server),
        }
    }

    fn device(&self) -> (RelayDevice, Arc<Line>) {
        let mut config = RelayConfig::new(self.endpoint.clone());
        config.ring_size = 4096;
        config.reconnect_on_disconnect = false;
        let line = Arc::new(Line::default());
        let device = RelayDevice::new(self.mem.clone(), config, line.clone()).unwrap();
        (device, line)
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(server) = self.server.take() {
            server.await.unwrap().unwrap();
        }
    }
}

async fn until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

fn mode_payload(width: u32, height: u32) -> Vec<u8> {
    let mut payload = width.to_le_bytes().to_vec();
    payload.extend_from_slice(&height.to_le_bytes());
    payload
}

#[tokio::test]
async fn commands_fences_and_faults_flow_end_to_end() {
    let rig = Rig::start(|config| config.idle_poll = None).await;
    rig.resolver.insert(rig.mem.clone());
    let (device, line) = rig.device();

    let outcome = device.connect().await.unwrap();
    assert_eq!(outcome.features(), Some(Features::SUPPORTED));
    until(|| device.status() & status_bits::BACKEND_CONNECTED != 0).await;
    device.mmio_write(mmio::IRQ_MASK, irq_bits::FENCE | irq_bits::ERROR);

    // Guest: stage a resource in the heap, reference it from the ring, fence.
    let heap = device.channel().heap();
    let mut allocator = HeapAllocator::for_heap(&heap);
    let span = allocator.alloc(7, 5).unwrap();
    heap.write(span, 0, b"pixel").unwrap();

    let mut producer = device.channel().producer().unwrap();
    producer.try_push(OP_UPLOAD, &span.encode()).unwrap();
    producer
        .try_push(OP_SET_MODE, &mode_payload(1024, 768))
        .unwrap();
    let fence = producer.try_push_fence().unwrap();
    allocator.free_after_fence(7, fence).unwrap();
    device.mmio_write(mmio::DOORBELL, 1);

    device
        .wait_for_fence(fence, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(rig.record.lock().unwrap().uploads, vec![b"pixel".to_vec()]);
    assert_eq!(allocator.reclaim(device.completed_fence()), vec![7]);

    until(|| device.mmio_read(mmio::IRQ_STATUS) & irq_bits::DISPLAY != 0).await;
    let snapshot = device.channel().control().display_mode().unwrap();
    assert_eq!((snapshot.mode.width, snapshot.mode.height), (1024, 768));

    until(|| line.0.load(Ordering::SeqCst)).await;
    device.mmio_write(mmio::IRQ_STATUS, irq_bits::ALL);
    assert!(!device.irq_level());

    // A failing command is reported but later work still completes.
    producer.try_push(OP_BROKEN_SHADER, &[]).unwrap();
    producer.try_push(0x300, &[9; 24]).unwrap();
    let fence2 = producer.try_push_fence().unwrap();
    device.mmio_write(mmio::DOORBELL, 1);
    device
        .wait_for_fence(fence2, Duration::from_secs(5))
        .await
        .unwrap();

    until(|| device.mmio_read(mmio::IRQ_STATUS) & irq_bits::ERROR != 0).await;
    assert_eq!(
        device.mmio_read(mmio::ERROR_CODE),
        FaultCode::ShaderCompileFailed.as_u32()
    );
    assert_ne!(device.status() & status_bits::ERROR, 0);
    device.mmio_write(mmio::ERROR_CODE, FaultCode::ShaderCompileFailed.as_u32());
    assert_eq!(device.status() & status_bits::ERROR, 0);

    assert_eq!(
        rig.record.lock().unwrap().opcodes,
        vec![OP_UPLOAD, OP_SET_MODE, OP_BROKEN_SHADER, 0x300]
    );

    drop(producer);
    device.shutdown().await;
    rig.stop().await;
}

#[tokio::test]
async fn idle_poll_drains_without_doorbells() {
    let rig = Rig::start(|config| config.idle_poll = Some(Duration::from_millis(2))).await;
    rig.resolver.insert(rig.mem.clone());
    let (device, _line) = rig.device();
    assert!(device.connect().await.unwrap().is_enabled());

    let mut producer = device.channel().producer().unwrap();
    for i in 0..20u32 {
        producer.try_push(0x10, &i.to_le_bytes()).unwrap();
    }
    let fence = producer.try_push_fence().unwrap();

    device
        .wait_for_fence(fence, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(rig.record.lock().unwrap().opcodes.len(), 20);

    drop(producer);
    device.shutdown().await;
    rig.stop().await;
}

#[tokio::test]
async fn unknown_shared_memory_leaves_relay_unaccelerated() {
    let rig = Rig::start(|_| {}).await;
    // Nothing registered with the resolver.
    let (device, _line) = rig.device();

    match device.connect().await.unwrap() {
        Acceleration::Disabled(NotifyError::HandshakeRejected(_)) => {}
        other => panic!("expected a rejected handshake, got {other:?}"),
    }
    assert_eq!(device.status(), status_bits::READY);

    // The backend keeps serving; a later attempt succeeds once the region is known.
    rig.resolver.insert(rig.mem.clone());
    assert!(device.connect().await.unwrap().is_enabled());

    device.shutdown().await;
    rig.stop().await;
}

#[tokio::test]
async fn corrupt_ring_faults_until_the_guest_resets() {
    let rig = Rig::start(|config| config.idle_poll = None).await;
    rig.resolver.insert(rig.mem.clone());
    let (device, _line) = rig.device();
    device.connect().await.unwrap();
    device.mmio_write(mmio::IRQ_MASK, irq_bits::ERROR);

    let mut producer = device.channel().producer().unwrap();
    producer.try_push(0x10, &[1, 2, 3, 4]).unwrap();

    // A buggy driver publishes a header whose length runs off the ring.
    let tail = device.channel().control().producer_ptr();
    let ring_offset = device.channel().layout().ring_offset;
    let mut header = 0x11u32.to_le_bytes().to_vec();
    header.extend_from_slice(&u32::MAX.to_le_bytes());
    rig.mem
        .write_at((ring_offset + tail) as usize, &header)
        .unwrap();
    rig.mem
        .write_at(PRODUCER_PTR_OFFSET, &(tail + 8).to_le_bytes())
        .unwrap();
    let fence = producer.try_push_fence().unwrap();
    device.mmio_write(mmio::DOORBELL, 1);

    assert!(matches!(
        device.wait_for_fence(fence, Duration::from_secs(5)).await,
        Err(RelayError::Faulted(FaultCode::InvalidCommand))
    ));
    until(|| device.irq_level()).await;
    assert_ne!(device.status() & status_bits::ERROR, 0);
    assert_eq!(rig.record.lock().unwrap().opcodes, vec![0x10]);

    device.mmio_write(mmio::RESET, RESET_VALUE);
    assert_eq!(device.status() & status_bits::ERROR, 0);
    assert_eq!(device.mmio_read(mmio::IRQ_STATUS), 0);

    producer.try_push(0x12, &[]).unwrap();
    let fence = producer.try_push_fence().unwrap();
    assert_eq!(fence, 1);
    device.mmio_write(mmio::DOORBELL, 1);
    device
        .wait_for_fence(fence, Duration::from_secs(5))
        .await
        .unwrap();
    let record = rig.record.lock().unwrap();
    assert_eq!(record.opcodes, vec![0x10, 0x12]);
    assert_eq!(record.resets, 1);
    drop(record);

    drop(producer);
    device.shutdown().await;
    rig.stop().await;
}
