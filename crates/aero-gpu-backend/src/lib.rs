//! Host side of the AeroGPU command channel.
//!
//! The backend listens for the relay, maps the shared memory named in its handshake, and drains
//! the command ring into a [`CommandExecutor`], completing fences and reporting faults back
//! through the control region and `IRQ` notifications.

mod config;
mod error;
mod executor;
mod resolver;
mod server;
mod session;

pub use config::{BackendConfig, DEFAULT_IDLE_POLL};
pub use error::{BackendError, Result};
pub use executor::{CommandExecutor, NullExecutor};
#[cfg(unix)]
pub use resolver::PosixShmResolver;
pub use resolver::{InProcessResolver, ShmResolver};
pub use server::serve;
pub use session::{BackendSession, SessionSummary, StopHandle};
