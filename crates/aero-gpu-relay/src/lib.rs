//! Hypervisor side of the AeroGPU command channel.
//!
//! [`RelayDevice`] owns the shared memory it hands to the guest, exposes the guest register
//! window ([`regs`]), turns `DOORBELL` writes into notification messages and backend IRQ
//! messages into a guest interrupt line.

mod device;
mod error;
pub mod regs;

pub use device::{Acceleration, InterruptSink, RelayConfig, RelayDevice};
pub use error::{RelayError, Result};
