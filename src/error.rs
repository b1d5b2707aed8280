use crate::capture::CaptureError;
use crate::config::ConfigError;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StreamerError>;

#[derive(Error, Debug)]
pub enum StreamerError {
    #[error("Failed to listen on {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Audio capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Thread error: {0}")]
    Thread(String),
}
