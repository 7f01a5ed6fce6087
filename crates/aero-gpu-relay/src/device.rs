use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;

use aero_gpu_notify::{
    ChannelConfig, Endpoint, EventHandler, HandshakeParams, NotificationChannel, NotifyError,
    IRQ_VECTOR_DISPLAY, IRQ_VECTOR_ERROR, IRQ_VECTOR_FENCE,
};
use aero_gpu_shm::layout::{CHANNEL_VERSION, DEFAULT_RING_SIZE_BYTES};
use aero_gpu_shm::{FaultCode, Features, SharedMemory, ShmChannel};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{RelayError, Result};
use crate::regs::{irq_bits, mmio, status_bits, RESET_VALUE};

/// Fence waiters re-check shared memory at least this often, so a lost IRQ only costs latency.
const FENCE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Where the relay delivers the guest interrupt line.
///
/// Called with the new level whenever `irq_status & irq_mask` changes between zero and non-zero.
/// Implementations must not block.
pub trait InterruptSink: Send + Sync + 'static {
    fn set_level(&self, asserted: bool);
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub notify: ChannelConfig,
    pub ring_size: u64,
    /// Features the relay is willing to use.
    pub features: Features,
    /// Re-run connect + handshake in the background when the backend connection drops.
    pub reconnect_on_disconnect: bool,
}

impl RelayConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            notify: ChannelConfig::new(endpoint),
            ring_size: DEFAULT_RING_SIZE_BYTES,
            features: Features::SUPPORTED,
            reconnect_on_disconnect: true,
        }
    }
}

/// Outcome of [`RelayDevice::connect`].
#[derive(Debug)]
pub enum Acceleration {
    Enabled(Features),
    /// The device is up but nothing services the ring.
    Disabled(NotifyError),
}

impl Acceleration {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Acceleration::Enabled(_))
    }

    pub fn features(&self) -> Option<Features> {
        match self {
            Acceleration::Enabled(features) => Some(*features),
            Acceleration::Disabled(_) => None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct IrqState {
    status: u32,
    mask: u32,
    level: bool,
}

/// Everything the notification reader task touches. It never takes a ring claim.
struct RelayState {
    channel: Arc<ShmChannel>,
    sink: Arc<dyn InterruptSink>,
    irq: Mutex<IrqState>,
    fence_event: Notify,
    notify: OnceLock<Weak<NotificationChannel>>,
    reconnect_on_disconnect: bool,
    /// Background reconnect started by the last disconnect. Shutdown aborts it.
    reconnect: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl RelayState {
    fn update_irq(&self, f: impl FnOnce(&mut IrqState)) {
        let mut irq = self.irq.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut irq);
        let level = irq.status & irq.mask != 0;
        if level != irq.level {
            irq.level = level;
            self.sink.set_level(level);
        }
    }

    fn irq(&self) -> IrqState {
        *self.irq.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn raise(&self, bits: u32) {
        self.update_irq(|irq| irq.status |= bits);
    }

    fn backend_lost(&self) {
        self.raise(irq_bits::DISCONNECT);
        self.fence_event.notify_waiters();
    }

    fn lock_reconnect(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.reconnect
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stops any background reconnect and waits for it to unwind.
    async fn cancel_reconnect(&self) {
        let task = self.lock_reconnect().take();
        if let Some(task) = task {
            task.abort();
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    tracing::warn!(error = %err, "reconnect task failed");
                }
            }
        }
    }
}

impl EventHandler for RelayState {
    fn on_doorbell(&self) {
        tracing::debug!("ignoring doorbell sent to the relay");
    }

    fn on_irq(&self, vector: u32) {
        match vector {
            IRQ_VECTOR_FENCE => {
                self.fence_event.notify_waiters();
                self.raise(irq_bits::FENCE);
            }
            IRQ_VECTOR_ERROR => {
                tracing::warn!(
                    error_code = %self.channel.control().error_code(),
                    "backend reported a ring fault"
                );
                self.fence_event.notify_waiters();
                self.raise(irq_bits::ERROR);
            }
            IRQ_VECTOR_DISPLAY => self.raise(irq_bits::DISPLAY),
            vector => tracing::warn!(vector, "ignoring unknown interrupt vector"),
        }
    }

    fn on_shutdown(&self) {
        tracing::info!("backend shut down");
        self.backend_lost();
    }

    fn on_disconnect(&self) {
        self.backend_lost();
        if !self.reconnect_on_disconnect {
            return;
        }
        // Shutdown flips the flag before it takes the handle, so checking under the lock means
        // a task spawned here is always seen by `cancel_reconnect`.
        let mut slot = self.lock_reconnect();
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        let Some(notify) = self.notify.get().and_then(Weak::upgrade) else {
            return;
        };
        let channel = self.channel.clone();
        let previous = slot.replace(tokio::spawn(async move {
            match notify.reconnect().await {
                Ok(features) => {
                    channel.set_features(features);
                    tracing::info!(features = ?features, "reconnected to backend");
                }
                Err(NotifyError::Closed) => tracing::debug!("reconnect abandoned; relay shut down"),
                Err(err) => tracing::warn!(error = %err, "reconnect failed"),
            }
        }));
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

/// Hypervisor-side owner of a channel: creates the shared memory layout, talks to the backend
/// and exposes the guest register window.
pub struct RelayDevice {
    channel: Arc<ShmChannel>,
    notify: Arc<NotificationChannel>,
    state: Arc<RelayState>,
    ready: AtomicBool,
}

impl RelayDevice {
    /// Stamps the control region over `mem`. Does not contact the backend; see
    /// [`connect`](Self::connect).
    pub fn new(
        mem: Arc<SharedMemory>,
        config: RelayConfig,
        sink: Arc<dyn InterruptSink>,
    ) -> Result<Self> {
        let channel = ShmChannel::create(mem, config.ring_size, Features::empty())?;
        let params = HandshakeParams {
            shm_size: channel.layout().total_size,
            shm_identifier: channel.memory().identifier().to_string(),
            supported: config.features,
        };

        let state = Arc::new(RelayState {
            channel: channel.clone(),
            sink,
            irq: Mutex::new(IrqState::default()),
            fence_event: Notify::new(),
            notify: OnceLock::new(),
            reconnect_on_disconnect: config.reconnect_on_disconnect,
            reconnect: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        });
        let notify = Arc::new(NotificationChannel::new(
            config.notify,
            params,
            state.clone(),
        ));
        let _ = state.notify.set(Arc::downgrade(&notify));

        Ok(Self {
            channel,
            notify,
            state,
            ready: AtomicBool::new(false),
        })
    }

    pub fn channel(&self) -> &Arc<ShmChannel> {
        &self.channel
    }

    pub fn notification(&self) -> &Arc<NotificationChannel> {
        &self.notify
    }

    /// Connects to the backend and publishes the negotiated features.
    ///
    /// An unreachable, incompatible or refusing backend does not fail bring-up: the device comes
    /// up `READY` without `BACKEND_CONNECTED` and the guest falls back to no acceleration.
    pub async fn connect(&self) -> Result<Acceleration> {
        match self.notify.connect().await {
            Ok(features) => {
                self.channel.set_features(features);
                self.ready.store(true, Ordering::Release);
                Ok(Acceleration::Enabled(features))
            }
            Err(
                err @ (NotifyError::BackendUnavailable(_)
                | NotifyError::IncompatibleBackend { .. }
                | NotifyError::HandshakeRejected(_)),
            ) => {
                tracing::warn!(error = %err, "running without acceleration");
                self.channel.set_features(Features::empty());
                self.ready.store(true, Ordering::Release);
                Ok(Acceleration::Disabled(err))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Ordered teardown: any background reconnect is cancelled, the backend is told to stop and
    /// the reader task has exited when this returns, so the mapping can be dropped afterwards.
    pub async fn shutdown(&self) {
        self.state.shutting_down.store(true, Ordering::Release);
        self.state.cancel_reconnect().await;
        self.notify.close().await;
        self.state.fence_event.notify_waiters();
        tracing::info!("relay shut down");
    }

    pub fn status(&self) -> u32 {
        let control = self.channel.control();
        let mut status = 0;
        if self.ready.load(Ordering::Acquire) {
            status |= status_bits::READY;
        }
        if self.notify.is_ready() {
            status |= status_bits::BACKEND_CONNECTED;
        }
        if control.is_faulted() || control.error_code().is_fault() {
            status |= status_bits::ERROR;
        }
        status
    }

    pub fn irq_level(&self) -> bool {
        self.state.irq().level
    }

    pub fn completed_fence(&self) -> u64 {
        self.channel.control().host_fence_completed()
    }

    /// Guest register read. Write-only and unknown registers read as zero.
    pub fn mmio_read(&self, offset: u64) -> u32 {
        let control = self.channel.control();
        let layout = self.channel.layout();
        match offset {
            mmio::VERSION => CHANNEL_VERSION,
            mmio::FEATURES_LO => control.features().bits() as u32,
            mmio::FEATURES_HI => (control.features().bits() >> 32) as u32,
            mmio::STATUS => self.status(),
            mmio::IRQ_STATUS => self.state.irq().status,
            mmio::IRQ_MASK => self.state.irq().mask,
            mmio::SHMEM_SIZE_LO => layout.total_size as u32,
            mmio::SHMEM_SIZE_HI => (layout.total_size >> 32) as u32,
            mmio::RING_SIZE => layout.ring_size as u32,
            mmio::ERROR_CODE => control.error_code().as_u32(),
            mmio::COMPLETED_FENCE_LO => control.host_fence_completed() as u32,
            mmio::COMPLETED_FENCE_HI => (control.host_fence_completed() >> 32) as u32,
            _ => 0,
        }
    }

    /// Guest register write. Writes to read-only and unknown registers are ignored.
    pub fn mmio_write(&self, offset: u64, value: u32) {
        match offset {
            mmio::IRQ_STATUS => self.state.update_irq(|irq| irq.status &= !value),
            mmio::IRQ_MASK => self.state.update_irq(|irq| irq.mask = value & irq_bits::ALL),
            mmio::DOORBELL => {
                if !self.notify.ring_doorbell() {
                    tracing::trace!("doorbell with no backend connected");
                }
            }
            mmio::RESET => {
                if value == RESET_VALUE {
                    self.reset();
                } else {
                    tracing::debug!(value, "ignoring RESET write");
                }
            }
            mmio::ERROR_CODE => {
                let observed = FaultCode::from_u32(value);
                if !self.channel.control().acknowledge_fault(observed) {
                    tracing::debug!(%observed, "stale fault acknowledgement");
                }
            }
            _ => {}
        }
    }

    /// Reinitializes the control region and clears interrupt state. The negotiated features
    /// and the backend connection are kept.
    pub fn reset(&self) {
        self.channel.reset();
        self.state.update_irq(|irq| irq.status = 0);
        self.state.fence_event.notify_waiters();
    }

    /// Waits until `host_fence_completed >= fence`.
    ///
    /// Shared memory is checked first; the caller only blocks (on the fence IRQ, with a polling
    /// fallback) when the fence is still outstanding.
    pub async fn wait_for_fence(&self, fence: u64, timeout: Duration) -> Result<()> {
        let control = self.channel.control();
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.state.fence_event.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let completed = control.host_fence_completed();
            if completed >= fence {
                return Ok(());
            }
            let submitted = control.guest_fence_request();
            if fence > submitted {
                return Err(RelayError::FenceNotSubmitted { fence, submitted });
            }
            if control.is_faulted() {
                return Err(RelayError::Faulted(control.error_code()));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(RelayError::FenceTimeout {
                    fence,
                    completed,
                    timeout,
                });
            }
            let wake = (now + FENCE_POLL_INTERVAL).min(deadline);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }
}

impl std::fmt::Debug for RelayDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayDevice")
            .field("identifier", &self.channel.memory().identifier())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::status_bits;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct Line {
        level: AtomicBool,
        edges: AtomicU32,
    }

    impl InterruptSink for Line {
        fn set_level(&self, asserted: bool) {
            self.level.store(asserted, Ordering::SeqCst);
            self.edges.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[cfg(unix)]
    fn absent_endpoint(dir: &std::path::Path) -> Endpoint {
        Endpoint::Unix(dir.join("absent.sock"))
    }

    #[cfg(not(unix))]
    fn absent_endpoint(_dir: &std::path::Path) -> Endpoint {
        Endpoint::Tcp("127.0.0.1:9".to_string())
    }

    /// Overwrites the length of the oldest unread frame so the next drain faults the ring.
    fn corrupt_next_frame(device: &RelayDevice) {
        let channel = device.channel();
        let head = channel.control().consumer_ptr() & (channel.layout().ring_size - 1);
        let at = (channel.layout().ring_offset + head + 4) as usize;
        channel.memory().write_at(at, &u32::MAX.to_le_bytes()).unwrap();
    }

    fn device() -> (RelayDevice, Arc<Line>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RelayConfig::new(absent_endpoint(dir.path()));
        config.ring_size = 4096;
        config.notify.connect_timeout = Duration::from_millis(50);
        let line = Arc::new(Line::default());
        let mem = Arc::new(SharedMemory::anonymous(64 * 1024).unwrap());
        let device = RelayDevice::new(mem, config, line.clone()).unwrap();
        (device, line, dir)
    }

    #[tokio::test]
    async fn unreachable_backend_leaves_device_ready_without_acceleration() {
        let (device, _line, _dir) = device();
        assert_eq!(device.mmio_read(mmio::STATUS), 0);

        let outcome = device.connect().await.unwrap();
        assert!(matches!(
            outcome,
            Acceleration::Disabled(NotifyError::BackendUnavailable(_))
        ));
        assert_eq!(device.mmio_read(mmio::STATUS), status_bits::READY);
        assert_eq!(device.mmio_read(mmio::FEATURES_LO), 0);

        // Doorbells go nowhere but must not fail.
        device.mmio_write(mmio::DOORBELL, 1);
    }

    #[test]
    fn geometry_registers() {
        let (device, _line, _dir) = device();
        assert_eq!(device.mmio_read(mmio::VERSION), CHANNEL_VERSION);
        assert_eq!(device.mmio_read(mmio::SHMEM_SIZE_LO), 64 * 1024);
        assert_eq!(device.mmio_read(mmio::SHMEM_SIZE_HI), 0);
        assert_eq!(device.mmio_read(mmio::RING_SIZE), 4096);
        assert_eq!(device.mmio_read(mmio::DOORBELL), 0);
        assert_eq!(device.mmio_read(0x3c), 0);
    }

    #[test]
    fn irq_status_is_write_one_to_clear_and_gated_by_mask() {
        let (device, line, _dir) = device();

        device.state.on_irq(IRQ_VECTOR_FENCE);
        device.state.on_irq(IRQ_VECTOR_DISPLAY);
        assert_eq!(
            device.mmio_read(mmio::IRQ_STATUS),
            irq_bits::FENCE | irq_bits::DISPLAY
        );
        // Latched but masked.
        assert!(!device.irq_level());
        assert_eq!(line.edges.load(Ordering::SeqCst), 0);

        device.mmio_write(mmio::IRQ_MASK, irq_bits::FENCE | 0xffff_0000);
        assert_eq!(device.mmio_read(mmio::IRQ_MASK), irq_bits::FENCE);
        assert!(device.irq_level());
        assert!(line.level.load(Ordering::SeqCst));

        // Clearing an unrelated bit keeps the line asserted.
        device.mmio_write(mmio::IRQ_STATUS, irq_bits::DISPLAY);
        assert_eq!(device.mmio_read(mmio::IRQ_STATUS), irq_bits::FENCE);
        assert!(device.irq_level());

        device.mmio_write(mmio::IRQ_STATUS, irq_bits::FENCE);
        assert_eq!(device.mmio_read(mmio::IRQ_STATUS), 0);
        assert!(!device.irq_level());
        assert!(!line.level.load(Ordering::SeqCst));
        assert_eq!(line.edges.load(Ordering::SeqCst), 2);

        device.state.on_irq(0xdead);
        assert_eq!(device.mmio_read(mmio::IRQ_STATUS), 0);
    }

    #[test]
    fn reset_clears_pointers_fences_and_irq_state() {
        let (device, _line, _dir) = device();
        device.mmio_write(mmio::IRQ_MASK, irq_bits::ALL);

        {
            let mut producer = device.channel().producer().unwrap();
            let mut consumer = device.channel().consumer().unwrap();
            producer.try_push(0x10, &[1, 2, 3]).unwrap();
            let fence = producer.try_push_fence().unwrap();
            let entries: Vec<_> = consumer.drain().collect::<aero_gpu_shm::Result<_>>().unwrap();
            assert_eq!(entries.len(), 2);
            consumer.complete_fence(fence);
        }
        device.state.on_irq(IRQ_VECTOR_FENCE);
        assert_eq!(device.mmio_read(mmio::COMPLETED_FENCE_LO), 1);
        assert!(device.irq_level());

        // Only the value 1 resets.
        device.mmio_write(mmio::RESET, 2);
        assert_eq!(device.completed_fence(), 1);

        device.mmio_write(mmio::RESET, RESET_VALUE);
        let control = device.channel().control();
        assert_eq!(control.producer_ptr(), 0);
        assert_eq!(control.consumer_ptr(), 0);
        assert_eq!(control.guest_fence_request(), 0);
        assert_eq!(device.mmio_read(mmio::COMPLETED_FENCE_LO), 0);
        assert_eq!(device.mmio_read(mmio::IRQ_STATUS), 0);
        assert_eq!(device.mmio_read(mmio::IRQ_MASK), irq_bits::ALL);
        assert!(!device.irq_level());
        assert_eq!(device.mmio_read(mmio::RING_SIZE), 4096);
    }

    #[test]
    fn fault_is_visible_until_acknowledged_and_reset() {
        let (device, _line, _dir) = device();
        {
            let mut producer = device.channel().producer().unwrap();
            let mut consumer = device.channel().consumer().unwrap();
            producer.try_push(0x10, &[]).unwrap();
            corrupt_next_frame(&device);
            assert!(matches!(
                consumer.drain().next(),
                Some(Err(aero_gpu_shm::ChannelError::ProtocolViolation(_)))
            ));
        }
        assert_eq!(
            device.mmio_read(mmio::ERROR_CODE),
            FaultCode::InvalidCommand.as_u32()
        );
        assert_ne!(device.status() & status_bits::ERROR, 0);

        // A stale acknowledgement is ignored.
        device.mmio_write(mmio::ERROR_CODE, FaultCode::OutOfMemory.as_u32());
        assert_eq!(
            device.mmio_read(mmio::ERROR_CODE),
            FaultCode::InvalidCommand.as_u32()
        );

        device.mmio_write(mmio::ERROR_CODE, FaultCode::InvalidCommand.as_u32());
        assert_eq!(device.mmio_read(mmio::ERROR_CODE), 0);
        // The ring stays faulted until reset.
        assert_ne!(device.status() & status_bits::ERROR, 0);

        device.mmio_write(mmio::RESET, RESET_VALUE);
        assert_eq!(device.status() & status_bits::ERROR, 0);
    }

    #[test]
    fn executor_fault_code_is_reported_without_faulting_the_ring() {
        let (device, _line, _dir) = device();
        let consumer = device.channel().consumer().unwrap();
        consumer.report_fault(FaultCode::ResourceNotFound);
        assert_eq!(
            device.mmio_read(mmio::ERROR_CODE),
            FaultCode::ResourceNotFound.as_u32()
        );
        assert_ne!(device.status() & status_bits::ERROR, 0);

        device.mmio_write(mmio::ERROR_CODE, FaultCode::ResourceNotFound.as_u32());
        assert_eq!(device.status() & status_bits::ERROR, 0);
    }

    #[tokio::test]
    async fn wait_for_fence_checks_shared_memory_first() {
        let (device, _line, _dir) = device();
        let mut producer = device.channel().producer().unwrap();
        let consumer = device.channel().consumer().unwrap();

        assert!(matches!(
            device.wait_for_fence(1, Duration::from_millis(10)).await,
            Err(RelayError::FenceNotSubmitted {
                fence: 1,
                submitted: 0
            })
        ));

        let fence = producer.try_push_fence().unwrap();
        assert!(matches!(
            device.wait_for_fence(fence, Duration::from_millis(30)).await,
            Err(RelayError::FenceTimeout { completed: 0, .. })
        ));

        consumer.complete_fence(fence);
        device
            .wait_for_fence(fence, Duration::from_millis(0))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn fence_irq_wakes_a_blocked_waiter() {
        let (device, _line, _dir) = device();
        let device = Arc::new(device);
        let mut producer = device.channel().producer().unwrap();
        let consumer = device.channel().consumer().unwrap();
        let fence = producer.try_push_fence().unwrap();

        let waiter = {
            let device = device.clone();
            tokio::spawn(async move { device.wait_for_fence(fence, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        consumer.complete_fence(fence);
        device.state.on_irq(IRQ_VECTOR_FENCE);

        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn fault_fails_outstanding_fence_waits() {
        let (device, _line, _dir) = device();
        let mut producer = device.channel().producer().unwrap();
        let mut consumer = device.channel().consumer().unwrap();
        producer.try_push(0x10, &[1]).unwrap();
        let fence = producer.try_push_fence().unwrap();
        corrupt_next_frame(&device);
        assert!(consumer.drain().next().unwrap().is_err());

        assert!(matches!(
            device.wait_for_fence(fence, Duration::from_secs(5)).await,
            Err(RelayError::Faulted(FaultCode::InvalidCommand))
        ));
    }
}
