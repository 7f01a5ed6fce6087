use std::io;

use aero_gpu_notify::NotifyError;
use aero_gpu_shm::ChannelError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackendError>;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cannot map shared memory {identifier:?}: {source}")]
    Map {
        identifier: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Notify(#[from] NotifyError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
