use std::collections::VecDeque;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::Result;
use crate::protocol::{Frame, FrameParser, Limits, Message};
use crate::transport::Connection;

pub(crate) const READ_CHUNK: usize = 4096;

/// A [`Connection`] with message framing, used while handshaking. Once the handshake is done it
/// is handed to [`crate::Link::spawn`], together with any frames that were already buffered.
#[derive(Debug)]
pub struct Framed {
    conn: Connection,
    parser: FrameParser,
    pending: VecDeque<Frame>,
    limits: Limits,
}

impl Framed {
    pub fn new(conn: Connection, limits: Limits) -> Self {
        Self {
            conn,
            parser: FrameParser::with_limits(limits),
            pending: VecDeque::new(),
            limits,
        }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Writes one message and flushes it.
    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        let bytes = msg.encode(&self.limits)?;
        self.conn.write_all(&bytes).await?;
        self.conn.flush().await?;
        Ok(())
    }

    /// Next message, or `None` on a clean end of stream. Cancel safe.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(Message::from_frame(frame)?));
            }
            let mut buf = [0u8; READ_CHUNK];
            let n = self.conn.read(&mut buf).await?;
            if n == 0 {
                self.parser.finish()?;
                return Ok(None);
            }
            self.pending.extend(self.parser.push(&buf[..n])?);
        }
    }

    pub(crate) fn into_parts(self) -> (Connection, FrameParser, VecDeque<Frame>) {
        (self.conn, self.parser, self.pending)
    }
}
