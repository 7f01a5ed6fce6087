use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use aero_gpu_shm::Features;
use tokio::task::JoinHandle;

use crate::deadline::bounded;
use crate::error::{NotifyError, Result};
use crate::framed::Framed;
use crate::handshake::{self, HandshakeParams};
use crate::link::{EventHandler, Link};
use crate::protocol::{Limits, Message};
use crate::status::{ChannelStatus, StatusCell};
use crate::transport::{connect_with_backoff, Backoff, Endpoint};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub endpoint: Endpoint,
    pub connect_timeout: Duration,
    /// `None` waits for the acknowledgement indefinitely.
    pub handshake_timeout: Option<Duration>,
    pub backoff: Backoff,
    pub limits: Limits,
    pub coalesce_doorbells: bool,
}

impl ChannelConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
            backoff: Backoff::default(),
            limits: Limits::default(),
            coalesce_doorbells: true,
        }
    }
}

/// Initiator end of the notification channel (the relay side).
///
/// Owns the connection lifecycle: connect with backoff, handshake, the `Ready` link, and
/// reconnection after a failure.
pub struct NotificationChannel {
    config: ChannelConfig,
    params: HandshakeParams,
    status: Arc<StatusCell>,
    handler: Arc<dyn EventHandler>,
    link: Mutex<Option<Link>>,
    negotiated: AtomicU64,
    closed: AtomicBool,
}

impl NotificationChannel {
    pub fn new(
        config: ChannelConfig,
        params: HandshakeParams,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            config,
            params,
            status: Arc::new(StatusCell::default()),
            handler,
            link: Mutex::new(None),
            negotiated: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn status(&self) -> ChannelStatus {
        self.status.get()
    }

    pub fn is_ready(&self) -> bool {
        self.status.is_ready()
    }

    /// Feature set from the last successful handshake.
    pub fn negotiated_features(&self) -> Option<Features> {
        match self.negotiated.load(Ordering::Acquire) {
            0 => None,
            bits => Some(Features::from_bits_retain(bits)),
        }
    }

    fn lock_link(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Connects and handshakes. Any previous link is torn down first.
    ///
    /// Fails with [`NotifyError::Closed`] once [`close`](Self::close) has been called, including
    /// when the close lands while this call is still connecting.
    pub async fn connect(&self) -> Result<Features> {
        if self.is_closed() {
            return Err(NotifyError::Closed);
        }
        let stale = self.lock_link().take();
        if let Some(link) = stale {
            link.close().await;
        }

        self.status.set(ChannelStatus::Connecting);
        tracing::info!(endpoint = %self.config.endpoint, "connecting to backend");
        let conn = match connect_with_backoff(
            &self.config.endpoint,
            self.config.connect_timeout,
            self.config.backoff,
        )
        .await
        {
            Ok(conn) => conn,
            Err(err) => {
                self.status.set(ChannelStatus::Disconnected);
                return Err(err);
            }
        };

        self.status.set(ChannelStatus::Handshaking);
        let mut framed = Framed::new(conn, self.config.limits);
        let res = bounded(
            self.config.handshake_timeout,
            handshake::initiate(&mut framed, &self.params),
        )
        .await;
        let features = match res {
            Some(Ok(features)) => features,
            Some(Err(err)) => {
                self.status.set(ChannelStatus::Disconnected);
                return Err(err);
            }
            None => {
                self.status.set(ChannelStatus::Disconnected);
                return Err(NotifyError::BackendUnavailable(
                    "handshake timed out".to_string(),
                ));
            }
        };

        // Checked under the link lock: `close` sets the flag before it takes the link, so either
        // it sees the link installed here or this sees the flag.
        let mut slot = self.lock_link();
        if self.is_closed() {
            drop(slot);
            tracing::debug!("channel closed during connect; dropping the new connection");
            self.status.set(ChannelStatus::Disconnected);
            return Err(NotifyError::Closed);
        }
        self.negotiated.store(features.bits(), Ordering::Release);
        *slot = Some(Link::spawn(
            framed,
            self.status.clone(),
            self.handler.clone(),
            self.config.coalesce_doorbells,
        ));
        drop(slot);
        tracing::info!(features = ?features, "notification channel ready");
        Ok(features)
    }

    /// Same as [`connect`](Self::connect); named for call sites recovering from a disconnect.
    pub async fn reconnect(&self) -> Result<Features> {
        self.connect().await
    }

    /// Runs [`reconnect`](Self::reconnect) on a background task.
    pub fn spawn_reconnecting(self: &Arc<Self>) -> JoinHandle<Result<Features>> {
        let this = self.clone();
        tokio::spawn(async move { this.reconnect().await })
    }

    /// Signals the backend that new ring entries are available. A no-op unless the channel is
    /// `Ready`; returns whether a doorbell was queued (or absorbed by a pending one).
    pub fn ring_doorbell(&self) -> bool {
        if !self.status.is_ready() {
            tracing::trace!("doorbell dropped; channel not ready");
            return false;
        }
        match self.lock_link().as_ref() {
            Some(link) => link.ring_doorbell().is_ok(),
            None => false,
        }
    }

    pub fn send(&self, msg: Message) -> Result<()> {
        match self.lock_link().as_ref() {
            Some(link) => link.send(msg),
            None => Err(NotifyError::NotConnected),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Ordered teardown; see [`Link::close`]. Safe to call when not connected. The channel stays
    /// closed: later [`connect`](Self::connect) calls fail.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let link = self.lock_link().take();
        if let Some(link) = link {
            link.close().await;
        }
        self.status.set(ChannelStatus::Disconnected);
    }
}

impl std::fmt::Debug for NotificationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationChannel")
            .field("endpoint", &self.config.endpoint)
            .field("status", &self.status())
            .finish()
    }
}
