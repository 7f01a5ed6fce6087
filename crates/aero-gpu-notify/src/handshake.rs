//! Handshake for both ends of the notification channel.
//!
//! The initiator (relay) sends `HANDSHAKE` naming the shared memory; the responder (backend) maps
//! it and answers `HANDSHAKE_ACK` with the features it offers.

use std::time::Duration;

use aero_gpu_shm::Features;

use crate::deadline::bounded;
use crate::error::{NotifyError, Result};
use crate::framed::Framed;
use crate::protocol::{Limits, Message};
use crate::transport::Connection;

/// What the initiator tells the responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeParams {
    pub shm_size: u64,
    pub shm_identifier: String,
    /// Features this side can use; the negotiated set never exceeds it.
    pub supported: Features,
}

/// What the responder learned from the initiator's `HANDSHAKE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub shm_size: u64,
    pub shm_identifier: String,
}

/// Turns the responder's acknowledgement into the negotiated feature set.
///
/// An acknowledgement without a payload means the responder advertises nothing; it is treated as
/// offering [`Features::MINIMUM_VIABLE`].
pub fn negotiate(ack_features: Option<u64>, supported: Features) -> Result<Features> {
    let offered = match ack_features {
        Some(bits) => Features::from_bits_retain(bits),
        None => Features::MINIMUM_VIABLE,
    };
    if !offered.has_required() {
        return Err(NotifyError::IncompatibleBackend {
            offered,
            required: Features::REQUIRED,
        });
    }
    Ok(Features::negotiate(offered, supported))
}

/// Initiator side. Sends `HANDSHAKE` and waits for the acknowledgement.
pub async fn initiate(framed: &mut Framed, params: &HandshakeParams) -> Result<Features> {
    framed
        .send(&Message::Handshake {
            shm_size: params.shm_size,
            shm_identifier: params.shm_identifier.clone(),
        })
        .await?;

    loop {
        match framed.recv().await? {
            Some(Message::HandshakeAck { features }) => {
                return negotiate(features, params.supported);
            }
            Some(Message::Unknown { msg_type, .. }) => {
                tracing::warn!(msg_type, "ignoring unknown message during handshake");
            }
            Some(Message::Shutdown) | None => {
                return Err(NotifyError::HandshakeRejected(
                    "backend closed the connection during the handshake".to_string(),
                ));
            }
            Some(other) => return Err(NotifyError::UnexpectedMessage(other.name())),
        }
    }
}

async fn wait_for_request(framed: &mut Framed) -> Result<HandshakeRequest> {
    loop {
        match framed.recv().await? {
            Some(Message::Handshake {
                shm_size,
                shm_identifier,
            }) => {
                return Ok(HandshakeRequest {
                    shm_size,
                    shm_identifier,
                })
            }
            Some(Message::Unknown { msg_type, .. }) => {
                tracing::warn!(msg_type, "ignoring unknown message before handshake");
            }
            Some(other) => return Err(NotifyError::UnexpectedMessage(other.name())),
            None => return Err(NotifyError::NotConnected),
        }
    }
}

/// Responder side. Waits (bounded by `timeout`) for the initiator's `HANDSHAKE`, lets `map`
/// attach the named shared memory, then acknowledges with `offered`.
///
/// If `map` fails the initiator gets a `SHUTDOWN` instead of an acknowledgement.
pub async fn accept<T, F>(
    conn: Connection,
    offered: Features,
    limits: Limits,
    timeout: Option<Duration>,
    map: F,
) -> Result<(Framed, HandshakeRequest, T)>
where
    F: FnOnce(&HandshakeRequest) -> Result<T>,
{
    let mut framed = Framed::new(conn, limits);
    let request = bounded(timeout, wait_for_request(&mut framed))
        .await
        .ok_or_else(|| {
            NotifyError::Transport(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "initiator did not send a handshake in time",
            ))
        })??;

    tracing::debug!(
        shm_identifier = %request.shm_identifier,
        shm_size = request.shm_size,
        "received handshake"
    );

    let mapped = match map(&request) {
        Ok(mapped) => mapped,
        Err(err) => {
            tracing::warn!(error = %err, "rejecting handshake");
            let _ = framed.send(&Message::Shutdown).await;
            return Err(err);
        }
    };

    framed
        .send(&Message::HandshakeAck {
            features: Some(offered.bits()),
        })
        .await?;
    Ok((framed, request, mapped))
}
