use std::io;

use aero_gpu_shm::Features;
use thiserror::Error;

use crate::protocol::ProtocolError;

pub type Result<T> = std::result::Result<T, NotifyError>;

#[derive(Debug, Error)]
pub enum NotifyError {
    /// The backend could not be reached (or did not answer the handshake) in time.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("backend offers features {offered:?}, which lack the required {required:?}")]
    IncompatibleBackend {
        offered: Features,
        required: Features,
    },

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("unexpected {0} message")]
    UnexpectedMessage(&'static str),

    #[error("notification channel is not connected")]
    NotConnected,

    #[error("notification channel has been closed")]
    Closed,

    #[error("invalid endpoint {0:?}: expected `unix:<path>` or `tcp:<host>:<port>`")]
    InvalidEndpoint(String),
}
