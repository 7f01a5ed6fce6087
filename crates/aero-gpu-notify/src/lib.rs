//! Out-of-band notification channel between the AeroGPU relay (initiator) and the backend
//! (responder).
//!
//! The shared-memory ring carries the commands; this channel only carries the signals around it:
//! the handshake that names the shared memory and negotiates features, doorbells from the relay,
//! interrupts from the backend, and an orderly shutdown.

mod channel;
mod deadline;
mod error;
mod framed;
pub mod handshake;
mod link;
pub mod protocol;
mod status;
pub mod transport;

pub use channel::{
    ChannelConfig, NotificationChannel, DEFAULT_CONNECT_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT,
};
pub use error::{NotifyError, Result};
pub use framed::Framed;
pub use handshake::{accept as accept_handshake, HandshakeParams, HandshakeRequest};
pub use link::{EventHandler, Link};
pub use protocol::{
    FrameParser, Limits, Message, ProtocolError, IRQ_VECTOR_DISPLAY, IRQ_VECTOR_ERROR,
    IRQ_VECTOR_FENCE,
};
pub use status::{ChannelStatus, StatusCell};
pub use transport::{connect_with_backoff, Backoff, Connection, Endpoint, Listener};
