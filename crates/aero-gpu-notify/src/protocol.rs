//! Notification channel wire codec.
//!
//! Wire format (all integer fields little-endian):
//!
//! ```text
//! 0                 4                    8
//! +-----------------+--------------------+
//! | msg_type (u32)  | payload_size (u32) |  header (8 bytes)
//! +-----------------+--------------------+
//! | payload (payload_size bytes)         |
//! +--------------------------------------+
//! ```
//!
//! Payloads:
//! - `HANDSHAKE`: `u64` shared memory size, then the NUL-terminated shared memory identifier.
//! - `HANDSHAKE_ACK`: empty, or a `u64` feature bitset.
//! - `DOORBELL`, `SHUTDOWN`: empty (any payload is ignored).
//! - `IRQ`: `u32` vector.
//!
//! Unknown message types are not an error; they decode to [`Message::Unknown`].

use core::fmt;

pub const HEADER_LEN: usize = 8;

pub const MSG_TYPE_HANDSHAKE: u32 = 1;
pub const MSG_TYPE_HANDSHAKE_ACK: u32 = 2;
pub const MSG_TYPE_DOORBELL: u32 = 3;
pub const MSG_TYPE_IRQ: u32 = 4;
pub const MSG_TYPE_SHUTDOWN: u32 = 5;

pub const IRQ_VECTOR_FENCE: u32 = 0;
pub const IRQ_VECTOR_ERROR: u32 = 1;
pub const IRQ_VECTOR_DISPLAY: u32 = 2;

pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_payload_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Handshake { shm_size: u64, shm_identifier: String },
    HandshakeAck { features: Option<u64> },
    Doorbell,
    Irq { vector: u32 },
    Shutdown,
    Unknown { msg_type: u32, payload: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    FrameTooLarge { len: usize, max: usize },
    FrameTooShort { len: usize },
    FrameTruncatedPayload { expected: usize, got: usize },
    FrameTrailingBytes { trailing: usize },

    TruncatedStreamHeader { pending: usize },
    TruncatedStreamPayload { pending: usize, payload_len: usize },

    HandshakePayloadTooShort { len: usize },
    HandshakeMissingTerminator,
    HandshakeTrailingBytes { trailing: usize },
    HandshakeIdentifierContainsNul,

    AckPayloadWrongLen { len: usize },
    IrqPayloadWrongLen { len: usize },

    InvalidUtf8 { context: &'static str },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::FrameTooLarge { len, max } => {
                write!(f, "frame too large: {len} > {max}")
            }
            ProtocolError::FrameTooShort { len } => write!(
                f,
                "notification frame too short: {len} < {HEADER_LEN} (truncated header)"
            ),
            ProtocolError::FrameTruncatedPayload { expected, got } => write!(
                f,
                "notification frame truncated payload: expected {expected} bytes, got {got}"
            ),
            ProtocolError::FrameTrailingBytes { trailing } => {
                write!(f, "notification frame has trailing bytes: {trailing}")
            }

            ProtocolError::TruncatedStreamHeader { pending } => write!(
                f,
                "truncated notification stream (truncated header: {pending} pending bytes)"
            ),
            ProtocolError::TruncatedStreamPayload {
                pending,
                payload_len,
            } => write!(
                f,
                "truncated notification stream (truncated payload: {pending}/{payload_len} payload bytes)"
            ),

            ProtocolError::HandshakePayloadTooShort { len } => {
                write!(f, "HANDSHAKE payload too short: {len}")
            }
            ProtocolError::HandshakeMissingTerminator => {
                write!(f, "HANDSHAKE identifier is not NUL-terminated")
            }
            ProtocolError::HandshakeTrailingBytes { trailing } => {
                write!(f, "HANDSHAKE payload has trailing bytes: {trailing}")
            }
            ProtocolError::HandshakeIdentifierContainsNul => {
                write!(f, "HANDSHAKE identifier contains a NUL byte")
            }

            ProtocolError::AckPayloadWrongLen { len } => {
                write!(f, "HANDSHAKE_ACK payload must be 0 or 8 bytes (got {len})")
            }
            ProtocolError::IrqPayloadWrongLen { len } => {
                write!(f, "IRQ payload must be exactly 4 bytes (got {len})")
            }

            ProtocolError::InvalidUtf8 { context } => write!(f, "invalid UTF-8 in {context}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl Message {
    pub fn msg_type(&self) -> u32 {
        match self {
            Message::Handshake { .. } => MSG_TYPE_HANDSHAKE,
            Message::HandshakeAck { .. } => MSG_TYPE_HANDSHAKE_ACK,
            Message::Doorbell => MSG_TYPE_DOORBELL,
            Message::Irq { .. } => MSG_TYPE_IRQ,
            Message::Shutdown => MSG_TYPE_SHUTDOWN,
            Message::Unknown { msg_type, .. } => *msg_type,
        }
    }

    /// Short name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Handshake { .. } => "HANDSHAKE",
            Message::HandshakeAck { .. } => "HANDSHAKE_ACK",
            Message::Doorbell => "DOORBELL",
            Message::Irq { .. } => "IRQ",
            Message::Shutdown => "SHUTDOWN",
            Message::Unknown { .. } => "UNKNOWN",
        }
    }

    pub fn encode_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(match self {
            Message::Handshake {
                shm_size,
                shm_identifier,
            } => {
                let id = shm_identifier.as_bytes();
                if id.contains(&0) {
                    return Err(ProtocolError::HandshakeIdentifierContainsNul);
                }
                let mut out = Vec::with_capacity(8 + id.len() + 1);
                out.extend_from_slice(&shm_size.to_le_bytes());
                out.extend_from_slice(id);
                out.push(0);
                out
            }
            Message::HandshakeAck { features } => match features {
                Some(bits) => bits.to_le_bytes().to_vec(),
                None => Vec::new(),
            },
            Message::Doorbell | Message::Shutdown => Vec::new(),
            Message::Irq { vector } => vector.to_le_bytes().to_vec(),
            Message::Unknown { payload, .. } => payload.clone(),
        })
    }

    pub fn encode(&self, limits: &Limits) -> Result<Vec<u8>, ProtocolError> {
        encode_frame_with_limits(self.msg_type(), &self.encode_payload()?, limits)
    }

    pub fn from_frame(frame: Frame) -> Result<Self, ProtocolError> {
        let Frame { msg_type, payload } = frame;
        Ok(match msg_type {
            MSG_TYPE_HANDSHAKE => decode_handshake_payload(&payload)?,
            MSG_TYPE_HANDSHAKE_ACK => match payload.len() {
                0 => Message::HandshakeAck { features: None },
                8 => Message::HandshakeAck {
                    features: Some(u64::from_le_bytes(read_array(&payload))),
                },
                len => return Err(ProtocolError::AckPayloadWrongLen { len }),
            },
            MSG_TYPE_DOORBELL => Message::Doorbell,
            MSG_TYPE_IRQ => match payload.len() {
                4 => Message::Irq {
                    vector: u32::from_le_bytes(read_array(&payload)),
                },
                len => return Err(ProtocolError::IrqPayloadWrongLen { len }),
            },
            MSG_TYPE_SHUTDOWN => Message::Shutdown,
            _ => Message::Unknown { msg_type, payload },
        })
    }
}

/// Copies the first `N` bytes of `buf`; callers check the length first.
fn read_array<const N: usize>(buf: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[..N]);
    out
}

fn decode_handshake_payload(buf: &[u8]) -> Result<Message, ProtocolError> {
    // shm_size (8) + at least the terminator.
    if buf.len() < 9 {
        return Err(ProtocolError::HandshakePayloadTooShort { len: buf.len() });
    }
    let shm_size = u64::from_le_bytes(read_array(buf));
    let rest = &buf[8..];
    let nul = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(ProtocolError::HandshakeMissingTerminator)?;
    if nul + 1 != rest.len() {
        return Err(ProtocolError::HandshakeTrailingBytes {
            trailing: rest.len() - nul - 1,
        });
    }
    let shm_identifier = core::str::from_utf8(&rest[..nul])
        .map_err(|_| ProtocolError::InvalidUtf8 {
            context: "HANDSHAKE identifier",
        })?
        .to_owned();
    Ok(Message::Handshake {
        shm_size,
        shm_identifier,
    })
}

pub fn encode_frame_with_limits(
    msg_type: u32,
    payload: &[u8],
    limits: &Limits,
) -> Result<Vec<u8>, ProtocolError> {
    if payload.len() > limits.max_payload_len {
        return Err(ProtocolError::FrameTooLarge {
            len: payload.len(),
            max: limits.max_payload_len,
        });
    }

    // Length is encoded as u32.
    if payload.len() > u32::MAX as usize {
        return Err(ProtocolError::FrameTooLarge {
            len: payload.len(),
            max: u32::MAX as usize,
        });
    }

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&msg_type.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// `(msg_type, payload_len)` from the front of `buf`, if a whole header is there.
fn split_header(buf: &[u8]) -> Option<(u32, usize)> {
    let header = buf.get(..HEADER_LEN)?;
    let msg_type = u32::from_le_bytes(read_array(&header[..4]));
    let payload_len = u32::from_le_bytes(read_array(&header[4..]));
    Some((msg_type, payload_len as usize))
}

pub fn decode_frame_with_limits(buf: &[u8], limits: &Limits) -> Result<Frame, ProtocolError> {
    let Some((msg_type, payload_len)) = split_header(buf) else {
        return Err(ProtocolError::FrameTooShort { len: buf.len() });
    };

    if payload_len > limits.max_payload_len {
        return Err(ProtocolError::FrameTooLarge {
            len: payload_len,
            max: limits.max_payload_len,
        });
    }

    let expected_total = HEADER_LEN + payload_len;
    if buf.len() < expected_total {
        return Err(ProtocolError::FrameTruncatedPayload {
            expected: expected_total,
            got: buf.len(),
        });
    }
    if buf.len() > expected_total {
        return Err(ProtocolError::FrameTrailingBytes {
            trailing: buf.len() - expected_total,
        });
    }

    Ok(Frame {
        msg_type,
        payload: buf[HEADER_LEN..].to_vec(),
    })
}

pub fn decode_message_with_limits(buf: &[u8], limits: &Limits) -> Result<Message, ProtocolError> {
    Message::from_frame(decode_frame_with_limits(buf, limits)?)
}

/// Incremental frame splitter for a byte stream.
///
/// Bytes are buffered until a whole frame is present, so chunk boundaries do not matter. An
/// oversized length is rejected as soon as its header arrives, which keeps the buffer under
/// one maximum-size frame plus the chunk being pushed.
#[derive(Debug, Clone)]
pub struct FrameParser {
    limits: Limits,
    pending: Vec<u8>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            limits,
            pending: Vec::new(),
        }
    }

    /// Appends `chunk` and returns every frame it completes, oldest first.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, ProtocolError> {
        self.pending.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut consumed = 0;
        while let Some((msg_type, payload_len)) = split_header(&self.pending[consumed..]) {
            if payload_len > self.limits.max_payload_len {
                return Err(ProtocolError::FrameTooLarge {
                    len: payload_len,
                    max: self.limits.max_payload_len,
                });
            }
            let body = consumed + HEADER_LEN;
            let Some(payload) = self.pending.get(body..body + payload_len) else {
                break;
            };
            frames.push(Frame {
                msg_type,
                payload: payload.to_vec(),
            });
            consumed = body + payload_len;
        }
        self.pending.drain(..consumed);
        Ok(frames)
    }

    /// Checks that the stream ended on a frame boundary.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        match split_header(&self.pending) {
            None => Err(ProtocolError::TruncatedStreamHeader {
                pending: self.pending.len(),
            }),
            Some((_, payload_len)) => Err(ProtocolError::TruncatedStreamPayload {
                pending: self.pending.len() - HEADER_LEN,
                payload_len,
            }),
        }
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}
