use std::sync::atomic::{AtomicU8, Ordering};

/// Connection state of a notification channel.
///
/// `Disconnected -> Connecting -> Handshaking -> Ready -> Disconnected`. Only a `Ready` channel
/// dispatches or forwards messages.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelStatus {
    Disconnected = 0,
    Connecting = 1,
    Handshaking = 2,
    Ready = 3,
}

impl ChannelStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ChannelStatus::Connecting,
            2 => ChannelStatus::Handshaking,
            3 => ChannelStatus::Ready,
            _ => ChannelStatus::Disconnected,
        }
    }
}

/// Status shared between the owner of a channel and its background tasks.
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new(status: ChannelStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub fn get(&self) -> ChannelStatus {
        ChannelStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, status: ChannelStatus) {
        self.0.store(status as u8, Ordering::Release);
    }

    /// Moves from `from` to `to`; returns `false` (and changes nothing) if the current status is
    /// not `from`. Exactly one of several racing callers wins.
    pub fn transition(&self, from: ChannelStatus, to: ChannelStatus) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_ready(&self) -> bool {
        self.get() == ChannelStatus::Ready
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new(ChannelStatus::Disconnected)
    }
}
