//! An established (`Ready`) notification connection and its background tasks.
//!
//! Outgoing messages go through an unbounded queue to a writer task, so senders never block and
//! can call in from synchronous contexts such as a register write. Incoming messages are parsed
//! by a reader task and dispatched to an [`EventHandler`] while the link is `Ready`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{NotifyError, Result};
use crate::framed::{Framed, READ_CHUNK};
use crate::protocol::{Frame, FrameParser, Limits, Message};
use crate::status::{ChannelStatus, StatusCell};
use crate::transport::Connection;

/// How long `close` waits for each background task before aborting it.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Receives events from a link's reader task.
///
/// Callbacks run on the reader task and must not block; hand work off instead.
pub trait EventHandler: Send + Sync + 'static {
    fn on_doorbell(&self) {}

    fn on_irq(&self, _vector: u32) {}

    /// The peer announced an orderly shutdown. The link is already `Disconnected`.
    fn on_shutdown(&self) {}

    /// The connection failed or the peer went away without a shutdown message.
    fn on_disconnect(&self) {}
}

pub struct Link {
    status: Arc<StatusCell>,
    tx: Option<mpsc::UnboundedSender<Message>>,
    doorbell_pending: Arc<AtomicBool>,
    coalesce_doorbells: bool,
    stop_tx: Option<oneshot::Sender<()>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl Link {
    /// Marks `status` as `Ready` and starts the reader and writer tasks. Must be called from
    /// within a Tokio runtime.
    pub fn spawn(
        framed: Framed,
        status: Arc<StatusCell>,
        handler: Arc<dyn EventHandler>,
        coalesce_doorbells: bool,
    ) -> Self {
        let limits = framed.limits();
        let (conn, parser, backlog) = framed.into_parts();
        let (read_half, write_half) = tokio::io::split(conn);
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let doorbell_pending = Arc::new(AtomicBool::new(false));

        status.set(ChannelStatus::Ready);

        let writer = tokio::spawn(write_loop(
            write_half,
            rx,
            limits,
            doorbell_pending.clone(),
            status.clone(),
            handler.clone(),
        ));
        let reader = tokio::spawn(read_loop(
            read_half,
            parser,
            backlog,
            stop_rx,
            status.clone(),
            handler,
        ));

        Self {
            status,
            tx: Some(tx),
            doorbell_pending,
            coalesce_doorbells,
            stop_tx: Some(stop_tx),
            reader: Some(reader),
            writer: Some(writer),
        }
    }

    pub fn status(&self) -> ChannelStatus {
        self.status.get()
    }

    pub fn is_ready(&self) -> bool {
        self.status.is_ready()
    }

    /// Queues `msg` for the writer task.
    pub fn send(&self, msg: Message) -> Result<()> {
        if !self.status.is_ready() {
            return Err(NotifyError::NotConnected);
        }
        let tx = self.tx.as_ref().ok_or(NotifyError::NotConnected)?;
        tx.send(msg).map_err(|_| NotifyError::NotConnected)
    }

    /// Queues a doorbell. With coalescing enabled, a doorbell that is already queued but not yet
    /// written absorbs this one.
    pub fn ring_doorbell(&self) -> Result<()> {
        if !self.status.is_ready() {
            return Err(NotifyError::NotConnected);
        }
        if self.coalesce_doorbells && self.doorbell_pending.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.send(Message::Doorbell).inspect_err(|_| {
            self.doorbell_pending.store(false, Ordering::Release);
        })
    }

    /// Ordered teardown: queue a `Shutdown` message, stop dispatching, then wait for both tasks
    /// (bounded) so the caller can safely unmap shared memory afterwards.
    pub async fn close(mut self) {
        if let Some(tx) = self.tx.take() {
            // Dropping the sender lets the writer exit after flushing the queue.
            let _ = tx.send(Message::Shutdown);
        }
        self.status.set(ChannelStatus::Disconnected);
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(writer) = self.writer.take() {
            join_bounded(writer, "writer").await;
        }
        if let Some(reader) = self.reader.take() {
            join_bounded(reader, "reader").await;
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(task) = self.writer.take() {
            task.abort();
        }
        if let Some(task) = self.reader.take() {
            task.abort();
        }
    }
}

async fn join_bounded(mut task: JoinHandle<()>, name: &'static str) {
    if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
        tracing::warn!(task = name, "link task did not stop in time; aborting");
        task.abort();
    }
}

fn mark_disconnected(status: &StatusCell, handler: &dyn EventHandler) {
    if status.transition(ChannelStatus::Ready, ChannelStatus::Disconnected) {
        tracing::info!("notification link disconnected");
        handler.on_disconnect();
    }
}

async fn write_loop(
    mut io: WriteHalf<Connection>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    limits: Limits,
    doorbell_pending: Arc<AtomicBool>,
    status: Arc<StatusCell>,
    handler: Arc<dyn EventHandler>,
) {
    while let Some(msg) = rx.recv().await {
        if msg == Message::Doorbell {
            // Cleared before the write so a doorbell rung from here on queues a new one.
            doorbell_pending.store(false, Ordering::Release);
        }

        let bytes = match msg.encode(&limits) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(msg = msg.name(), error = %err, "dropping unencodable notification");
                continue;
            }
        };

        // Each message is flushed on its own; a doorbell must never sit in a buffer.
        let res = async {
            io.write_all(&bytes).await?;
            io.flush().await
        }
        .await;
        if let Err(err) = res {
            tracing::warn!(msg = msg.name(), error = %err, "notification write failed");
            mark_disconnected(&status, &*handler);
            return;
        }
        tracing::trace!(msg = msg.name(), "sent notification");
    }
    let _ = io.shutdown().await;
}

async fn read_loop(
    mut io: ReadHalf<Connection>,
    mut parser: FrameParser,
    backlog: VecDeque<Frame>,
    mut stop_rx: oneshot::Receiver<()>,
    status: Arc<StatusCell>,
    handler: Arc<dyn EventHandler>,
) {
    for frame in backlog {
        if !dispatch(frame, &status, &*handler) {
            return;
        }
    }

    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let res = tokio::select! {
            _ = &mut stop_rx => return,
            res = io.read(&mut buf) => res,
        };
        let frames = match res {
            Ok(0) => {
                if let Err(err) = parser.finish() {
                    tracing::debug!(error = %err, "stream ended mid-frame");
                }
                tracing::debug!("peer closed the notification stream");
                mark_disconnected(&status, &*handler);
                return;
            }
            Ok(n) => match parser.push(&buf[..n]) {
                Ok(frames) => frames,
                Err(err) => {
                    tracing::warn!(error = %err, "notification framing error");
                    mark_disconnected(&status, &*handler);
                    return;
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, "notification read failed");
                mark_disconnected(&status, &*handler);
                return;
            }
        };

        for frame in frames {
            if !dispatch(frame, &status, &*handler) {
                return;
            }
        }
    }
}

/// Returns `false` once the reader should stop.
fn dispatch(frame: Frame, status: &StatusCell, handler: &dyn EventHandler) -> bool {
    let msg = match Message::from_frame(frame) {
        Ok(msg) => msg,
        Err(err) => {
            tracing::warn!(error = %err, "dropping malformed notification");
            return true;
        }
    };
    if !status.is_ready() {
        tracing::trace!(msg = msg.name(), "dropping notification; link not ready");
        return true;
    }

    match &msg {
        Message::Doorbell => handler.on_doorbell(),
        Message::Irq { vector } => handler.on_irq(*vector),
        Message::Shutdown => {
            tracing::info!("peer requested shutdown");
            if status.transition(ChannelStatus::Ready, ChannelStatus::Disconnected) {
                handler.on_shutdown();
            }
            return false;
        }
        Message::Unknown { msg_type, payload } => {
            tracing::warn!(
                msg_type,
                len = payload.len(),
                "ignoring unknown notification type"
            );
        }
        Message::Handshake { .. } | Message::HandshakeAck { .. } => {
            tracing::warn!(msg = msg.name(), "ignoring handshake message on an established link");
        }
    }
    true
}
