use std::time::Duration;

use aero_gpu_notify::NotifyError;
use aero_gpu_shm::{ChannelError, FaultCode};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Notify(#[from] NotifyError),

    #[error("fence {fence} was never submitted (last submitted: {submitted})")]
    FenceNotSubmitted { fence: u64, submitted: u64 },

    #[error("fence {fence} did not complete within {timeout:?} (completed: {completed})")]
    FenceTimeout {
        fence: u64,
        completed: u64,
        timeout: Duration,
    },

    #[error("command ring faulted ({0}) before the fence completed")]
    Faulted(FaultCode),
}
