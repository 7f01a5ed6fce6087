use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use aero_gpu_notify::{
    accept_handshake, Connection, EventHandler, Link, Message, NotifyError, StatusCell,
    IRQ_VECTOR_DISPLAY, IRQ_VECTOR_ERROR, IRQ_VECTOR_FENCE,
};
use aero_gpu_shm::{Features, ResourceHeap, RingConsumer, RingEntry, ShmChannel};

use crate::config::BackendConfig;
use crate::error::Result;
use crate::executor::CommandExecutor;
use crate::resolver::ShmResolver;

#[derive(Default)]
struct SessionEvents {
    doorbell: tokio::sync::Notify,
    wake: tokio::sync::Notify,
    stop_requested: AtomicBool,
}

impl EventHandler for SessionEvents {
    fn on_doorbell(&self) {
        self.doorbell.notify_one();
    }

    fn on_irq(&self, vector: u32) {
        tracing::debug!(vector, "ignoring interrupt sent to the backend");
    }

    fn on_shutdown(&self) {
        self.wake.notify_one();
    }

    fn on_disconnect(&self) {
        self.wake.notify_one();
    }
}

/// Asks a running [`BackendSession`] to wind down.
#[derive(Clone)]
pub struct StopHandle(Arc<SessionEvents>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.stop_requested.store(true, Ordering::Release);
        self.0.wake.notify_one();
    }
}

/// What a finished session did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub commands: u64,
    pub faults: u64,
    pub last_fence: u64,
}

/// One relay connection: the consumer side of its ring plus the notification link.
pub struct BackendSession<E> {
    channel: Arc<ShmChannel>,
    consumer: RingConsumer,
    heap: ResourceHeap,
    link: Link,
    events: Arc<SessionEvents>,
    executor: E,
    config: BackendConfig,
    reset_epoch: u64,
    summary: SessionSummary,
}

impl<E: CommandExecutor> BackendSession<E> {
    /// Answers the relay's handshake on `conn`, mapping the memory it names through `resolver`.
    pub async fn accept(
        conn: Connection,
        config: &BackendConfig,
        resolver: &dyn ShmResolver,
        executor: E,
    ) -> Result<Self> {
        let (framed, request, channel) = accept_handshake(
            conn,
            config.features,
            config.limits,
            config.handshake_timeout,
            |request| {
                let mem = resolver
                    .resolve(&request.shm_identifier, request.shm_size)
                    .map_err(|err| NotifyError::HandshakeRejected(err.to_string()))?;
                ShmChannel::attach(mem).map_err(|err| NotifyError::HandshakeRejected(err.to_string()))
            },
        )
        .await?;

        let consumer = channel.consumer()?;
        let heap = channel.heap();
        let events = Arc::new(SessionEvents::default());
        let link = Link::spawn(
            framed,
            Arc::new(StatusCell::default()),
            events.clone(),
            false,
        );
        tracing::info!(
            shm_identifier = %request.shm_identifier,
            shm_size = request.shm_size,
            ring_size = channel.layout().ring_size,
            "session established"
        );

        Ok(Self {
            reset_epoch: channel.control().reset_epoch(),
            channel,
            consumer,
            heap,
            link,
            events,
            executor,
            config: config.clone(),
            summary: SessionSummary::default(),
        })
    }

    pub fn channel(&self) -> &Arc<ShmChannel> {
        &self.channel
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.events.clone())
    }

    /// Services the ring until the relay shuts down, the connection drops or [`StopHandle::stop`]
    /// is called. The link is closed before the mapping is released.
    pub async fn run(mut self) -> SessionSummary {
        loop {
            if self.events.stop_requested.load(Ordering::Acquire) || !self.link.is_ready() {
                break;
            }
            self.service();

            let doorbell = self.events.doorbell.notified();
            let wake = self.events.wake.notified();
            match self.config.idle_poll {
                Some(period) => tokio::select! {
                    _ = doorbell => {}
                    _ = wake => {}
                    _ = tokio::time::sleep(period) => {}
                },
                None => tokio::select! {
                    _ = doorbell => {}
                    _ = wake => {}
                },
            }
        }

        tracing::info!(
            commands = self.summary.commands,
            faults = self.summary.faults,
            last_fence = self.summary.last_fence,
            "session ending"
        );
        self.link.close().await;
        self.summary
    }

    /// Drains and executes everything published so far.
    fn service(&mut self) {
        let control = self.channel.control();
        let epoch = control.reset_epoch();
        if epoch != self.reset_epoch {
            tracing::info!(epoch, "channel was reset by the guest");
            self.executor.reset();
            self.reset_epoch = epoch;
        }

        if control.is_faulted() {
            // Nothing is drained until the guest resets the channel.
            return;
        }

        let entries: Vec<_> = self.consumer.drain().collect();
        let mut fence_advanced = false;
        for entry in entries {
            match entry {
                Ok(RingEntry::Command(command)) => {
                    self.summary.commands += 1;
                    if let Err(code) = self.executor.execute(&self.heap, &command) {
                        tracing::warn!(opcode = command.opcode, %code, "command failed");
                        self.summary.faults += 1;
                        self.consumer.report_fault(code);
                        self.raise(IRQ_VECTOR_ERROR);
                    }
                }
                Ok(RingEntry::Fence(value)) => {
                    if self.consumer.complete_fence(value) {
                        fence_advanced = true;
                        self.summary.last_fence = value;
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "stopped draining a faulted ring");
                    self.summary.faults += 1;
                    self.raise(IRQ_VECTOR_ERROR);
                }
            }
        }
        if fence_advanced {
            self.raise(IRQ_VECTOR_FENCE);
        }

        if let Some(mode) = self.executor.take_display_mode() {
            // The relay publishes the negotiated set in the header.
            if self.channel.control().features().contains(Features::DISPLAY_MODE) {
                let generation = self.consumer.publish_display_mode(mode);
                tracing::debug!(generation, ?mode, "published display mode");
                self.raise(IRQ_VECTOR_DISPLAY);
            }
        }
    }

    fn raise(&self, vector: u32) {
        if let Err(err) = self.link.send(Message::Irq { vector }) {
            tracing::debug!(vector, error = %err, "interrupt not delivered");
        }
    }
}
