//! Guest-visible register window of the relay.
//!
//! All registers are 32 bits wide and dword aligned. 64-bit values are split into `_LO`/`_HI`
//! halves.

/// Size of the register window in bytes.
pub const REGISTER_WINDOW_SIZE_BYTES: u64 = 0x40;

pub mod mmio {
    pub const VERSION: u64 = 0x00;
    pub const FEATURES_LO: u64 = 0x04;
    pub const FEATURES_HI: u64 = 0x08;
    pub const STATUS: u64 = 0x0c;
    /// Write-1-to-clear.
    pub const IRQ_STATUS: u64 = 0x10;
    pub const IRQ_MASK: u64 = 0x14;
    pub const SHMEM_SIZE_LO: u64 = 0x18;
    pub const SHMEM_SIZE_HI: u64 = 0x1c;
    pub const RING_SIZE: u64 = 0x20;
    /// Write-only; any value rings the doorbell.
    pub const DOORBELL: u64 = 0x24;
    /// Write [`super::RESET_VALUE`] to reinitialize the control region.
    pub const RESET: u64 = 0x28;
    /// Reads the current fault code; writing the observed code back acknowledges it.
    pub const ERROR_CODE: u64 = 0x2c;
    pub const COMPLETED_FENCE_LO: u64 = 0x30;
    pub const COMPLETED_FENCE_HI: u64 = 0x34;
}

pub mod status_bits {
    /// The device finished bring-up (possibly without acceleration).
    pub const READY: u32 = 1 << 0;
    /// The notification channel to the backend is `Ready`.
    pub const BACKEND_CONNECTED: u32 = 1 << 1;
    /// The ring is faulted or an unacknowledged fault code is pending.
    pub const ERROR: u32 = 1 << 2;
}

pub mod irq_bits {
    pub const FENCE: u32 = 1 << 0;
    pub const ERROR: u32 = 1 << 1;
    pub const DISPLAY: u32 = 1 << 2;
    pub const DISCONNECT: u32 = 1 << 3;

    pub const ALL: u32 = FENCE | ERROR | DISPLAY | DISCONNECT;
}

pub const RESET_VALUE: u32 = 1;
