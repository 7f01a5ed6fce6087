use thiserror::Error;

use crate::heap::HeapError;

pub type Result<T> = std::result::Result<T, ChannelError>;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid channel configuration: {0}")]
    InvalidConfiguration(&'static str),

    #[error("control region mismatch: magic={magic:#010x} version={version}")]
    VersionMismatch { magic: u32, version: u32 },

    #[error("command ring full: frame needs {needed} bytes, {free} free")]
    RingFull { needed: u64, free: u64 },

    #[error("frame payload of {len} bytes exceeds the ring limit of {max} bytes")]
    FrameTooLarge { len: u64, max: u64 },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("heap access out of bounds: offset={offset} len={len} heap_size={heap_size}")]
    OutOfBounds { offset: u64, len: u64, heap_size: u64 },

    #[error(transparent)]
    Heap(#[from] HeapError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error returned by the non-blocking producer operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PushError {
    /// Not enough free space right now; the caller should back off and retry.
    #[error("ring full: frame needs {needed} bytes, {free} free")]
    Full { needed: u64, free: u64 },
    /// The frame can never fit in this ring.
    #[error("frame payload of {len} bytes exceeds the ring limit of {max} bytes")]
    TooLarge { len: u64, max: u64 },
    /// The opcode is reserved for channel-internal frames.
    #[error("opcode {0:#010x} is reserved")]
    ReservedOpcode(u32),
}

impl From<PushError> for ChannelError {
    fn from(err: PushError) -> Self {
        match err {
            PushError::Full { needed, free } => ChannelError::RingFull { needed, free },
            PushError::TooLarge { len, max } => ChannelError::FrameTooLarge { len, max },
            PushError::ReservedOpcode(_) => {
                ChannelError::InvalidConfiguration("opcode is reserved for fence frames")
            }
        }
    }
}

/// Fault reported by the consumer through the control region's `error_code` field.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FaultCode {
    #[default]
    None = 0,
    InvalidCommand = 1,
    InvalidResourceId = 2,
    ResourceNotFound = 3,
    OutOfMemory = 4,
    ShaderCompileFailed = 5,
    DeviceLost = 6,
    Internal = 7,
}

impl FaultCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Decodes a raw `error_code` value. Values this build does not know about map to
    /// [`FaultCode::Internal`] so a newer peer can never make a fault disappear.
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => FaultCode::None,
            1 => FaultCode::InvalidCommand,
            2 => FaultCode::InvalidResourceId,
            3 => FaultCode::ResourceNotFound,
            4 => FaultCode::OutOfMemory,
            5 => FaultCode::ShaderCompileFailed,
            6 => FaultCode::DeviceLost,
            _ => FaultCode::Internal,
        }
    }

    pub fn is_fault(self) -> bool {
        self != FaultCode::None
    }
}

impl std::fmt::Display for FaultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FaultCode::None => "none",
            FaultCode::InvalidCommand => "invalid command",
            FaultCode::InvalidResourceId => "invalid resource id",
            FaultCode::ResourceNotFound => "resource not found",
            FaultCode::OutOfMemory => "out of memory",
            FaultCode::ShaderCompileFailed => "shader compile failed",
            FaultCode::DeviceLost => "device lost",
            FaultCode::Internal => "internal error",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_code_values_are_stable() {
        for code in [
            FaultCode::None,
            FaultCode::InvalidCommand,
            FaultCode::InvalidResourceId,
            FaultCode::ResourceNotFound,
            FaultCode::OutOfMemory,
            FaultCode::ShaderCompileFailed,
            FaultCode::DeviceLost,
            FaultCode::Internal,
        ] {
            assert_eq!(FaultCode::from_u32(code.as_u32()), code);
        }
        assert_eq!(FaultCode::InvalidCommand.as_u32(), 1);
        assert_eq!(FaultCode::from_u32(0xdead), FaultCode::Internal);
    }

    #[test]
    fn push_errors_map_onto_channel_errors() {
        let err: ChannelError = PushError::Full { needed: 200, free: 64 }.into();
        assert!(matches!(err, ChannelError::RingFull { needed: 200, free: 64 }));
        let err: ChannelError = PushError::TooLarge { len: 9000, max: 248 }.into();
        assert!(matches!(err, ChannelError::FrameTooLarge { len: 9000, max: 248 }));
    }
}
