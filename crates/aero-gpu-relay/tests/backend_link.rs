#![cfg(unix)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aero_gpu_notify::{
    accept_handshake, Endpoint, EventHandler, Limits, Link, Listener, Message, StatusCell,
    IRQ_VECTOR_FENCE,
};
use aero_gpu_relay::regs::{irq_bits, mmio, status_bits};
use aero_gpu_relay::{Acceleration, InterruptSink, RelayConfig, RelayDevice};
use aero_gpu_shm::{Features, RingEntry, SharedMemory, ShmChannel};
use tokio::sync::Notify;

#[derive(Default)]
struct Line(AtomicBool);

impl InterruptSink for Line {
    fn set_level(&self, asserted: bool) {
        self.0.store(asserted, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Doorbells(Notify);

impl EventHandler for Doorbells {
    fn on_doorbell(&self) {
        self.0.notify_one();
    }
}

struct FakeBackend {
    link: Link,
    channel: Arc<ShmChannel>,
    doorbells: Arc<Doorbells>,
}

/// Accepts one relay connection and attaches to its memory the way a backend would.
async fn fake_backend(listener: &Listener, mem: Arc<SharedMemory>, offered: Features) -> FakeBackend {
    let conn = listener.accept().await.unwrap();
    let (framed, _request, channel) = accept_handshake(
        conn,
        offered,
        Limits::default(),
        Some(Duration::from_secs(5)),
        |request| {
            assert_eq!(request.shm_identifier, mem.identifier());
            assert_eq!(request.shm_size, mem.len() as u64);
            Ok(ShmChannel::attach(mem.clone()).unwrap())
        },
    )
    .await
    .unwrap();
    let doorbells = Arc::new(Doorbells::default());
    let link = Link::spawn(
        framed,
        Arc::new(StatusCell::default()),
        doorbells.clone(),
        false,
    );
    FakeBackend {
        link,
        channel,
        doorbells,
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

fn setup(
    reconnect: bool,
) -> (
    tempfile::TempDir,
    Endpoint,
    Arc<SharedMemory>,
    Arc<Line>,
    RelayDevice,
) {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = Endpoint::Unix(dir.path().join("gpu.sock"));
    let mut config = RelayConfig::new(endpoint.clone());
    config.ring_size = 4096;
    config.reconnect_on_disconnect = reconnect;
    config.notify.connect_timeout = Duration::from_secs(2);

    let mem = Arc::new(SharedMemory::anonymous(64 * 1024).unwrap());
    let line = Arc::new(Line::default());
    let device = RelayDevice::new(mem.clone(), config, line.clone()).unwrap();
    (dir, endpoint, mem, line, device)
}

#[tokio::test]
async fn doorbell_drain_fence_interrupt_round_trip() {
    let (_dir, endpoint, mem, line, device) = setup(false);
    let listener = Listener::bind(&endpoint).await.unwrap();
    let offered = Features::BASELINE | Features::FENCE_IRQ | Features::RESOURCE_HEAP;

    let (outcome, backend) = tokio::join!(
        device.connect(),
        fake_backend(&listener, mem.clone(), offered)
    );
    let outcome = outcome.unwrap();
    assert!(outcome.is_enabled());
    assert_eq!(outcome.features(), Some(offered));
    assert_eq!(device.mmio_read(mmio::FEATURES_LO), offered.bits() as u32);
    assert_eq!(backend.channel.control().features(), offered);
    assert_eq!(
        device.mmio_read(mmio::STATUS),
        status_bits::READY | status_bits::BACKEND_CONNECTED
    );

    // Guest submits work and rings the doorbell.
    let mut producer = device.channel().producer().unwrap();
    producer.try_push(0x20, b"clear").unwrap();
    let fence = producer.try_push_fence().unwrap();
    device.mmio_write(mmio::IRQ_MASK, irq_bits::FENCE);
    device.mmio_write(mmio::DOORBELL, 1);

    tokio::time::timeout(Duration::from_secs(5), backend.doorbells.0.notified())
        .await
        .unwrap();
    let mut consumer = backend.channel.consumer().unwrap();
    let entries: Vec<RingEntry> = consumer
        .drain()
        .collect::<aero_gpu_shm::Result<_>>()
        .unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1], RingEntry::Fence(fence));
    assert!(consumer.complete_fence(fence));
    backend
        .link
        .send(Message::Irq {
            vector: IRQ_VECTOR_FENCE,
        })
        .unwrap();

    device
        .wait_for_fence(fence, Duration::from_secs(5))
        .await
        .unwrap();
    until(|| device.irq_level()).await;
    assert!(line.0.load(Ordering::SeqCst));
    assert_eq!(device.mmio_read(mmio::COMPLETED_FENCE_LO), fence as u32);

    device.mmio_write(mmio::IRQ_STATUS, irq_bits::FENCE);
    assert!(!device.irq_level());

    device.shutdown().await;
    assert_eq!(device.mmio_read(mmio::STATUS) & status_bits::BACKEND_CONNECTED, 0);
    backend.link.close().await;
}

#[tokio::test]
async fn incompatible_backend_degrades_instead_of_failing() {
    let (_dir, endpoint, mem, _line, device) = setup(false);
    let listener = Listener::bind(&endpoint).await.unwrap();

    let (outcome, backend) = tokio::join!(
        device.connect(),
        fake_backend(&listener, mem.clone(), Features::DISPLAY_MODE)
    );
    assert!(matches!(outcome.unwrap(), Acceleration::Disabled(_)));
    assert_eq!(device.mmio_read(mmio::STATUS), status_bits::READY);
    assert_eq!(device.mmio_read(mmio::FEATURES_LO), 0);
    backend.link.close().await;
}

#[tokio::test]
async fn backend_shutdown_raises_disconnect() {
    let (_dir, endpoint, mem, _line, device) = setup(false);
    let listener = Listener::bind(&endpoint).await.unwrap();

    let (outcome, backend) = tokio::join!(
        device.connect(),
        fake_backend(&listener, mem.clone(), Features::SUPPORTED)
    );
    outcome.unwrap();
    device.mmio_write(mmio::IRQ_MASK, irq_bits::DISCONNECT);

    backend.link.close().await;
    until(|| device.irq_level()).await;
    assert_eq!(device.mmio_read(mmio::IRQ_STATUS), irq_bits::DISCONNECT);
    assert_eq!(device.mmio_read(mmio::STATUS), status_bits::READY);

    device.shutdown().await;
}

#[tokio::test]
async fn dropped_connection_is_reestablished() {
    let (_dir, endpoint, mem, _line, device) = setup(true);
    let listener = Listener::bind(&endpoint).await.unwrap();

    let (outcome, backend) = tokio::join!(
        device.connect(),
        fake_backend(&listener, mem.clone(), Features::SUPPORTED)
    );
    outcome.unwrap();

    // A crash: no SHUTDOWN, the socket just goes away.
    drop(backend);
    let backend = fake_backend(&listener, mem.clone(), Features::MINIMUM_VIABLE).await;
    until(|| device.mmio_read(mmio::STATUS) & status_bits::BACKEND_CONNECTED != 0).await;
    until(|| device.mmio_read(mmio::FEATURES_LO) == Features::MINIMUM_VIABLE.bits() as u32)
        .await;
    assert_ne!(
        device.mmio_read(mmio::IRQ_STATUS) & irq_bits::DISCONNECT,
        0
    );

    device.shutdown().await;
    backend.link.close().await;
}

#[tokio::test]
async fn shutdown_cancels_a_pending_reconnect() {
    let (_dir, endpoint, mem, _line, device) = setup(true);
    let listener = Listener::bind(&endpoint).await.unwrap();

    let (outcome, backend) = tokio::join!(
        device.connect(),
        fake_backend(&listener, mem.clone(), Features::SUPPORTED)
    );
    outcome.unwrap();

    // The backend goes away for good; the relay keeps retrying in the background.
    drop(listener);
    drop(backend);
    until(|| device.mmio_read(mmio::IRQ_STATUS) & irq_bits::DISCONNECT != 0).await;

    device.shutdown().await;
    assert!(device.notification().is_closed());

    // A backend that comes back later must not be picked up. The retry budget is 2s with
    // backoff capped at 500ms, so a live reconnect would arrive well inside this window.
    let listener = Listener::bind(&endpoint).await.unwrap();
    let late = tokio::time::timeout(Duration::from_secs(1), listener.accept()).await;
    assert!(late.is_err(), "relay connected after shutdown");
    assert_eq!(device.mmio_read(mmio::STATUS) & status_bits::BACKEND_CONNECTED, 0);
}
