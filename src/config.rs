use crate::types::{StreamFormat, DEFAULT_CHUNK_BYTES};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_QUEUE_DEPTH: usize = 32;
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(1000);
pub const DEFAULT_CLIENT_QUEUE_DEPTH: usize = 16;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Chunk size {chunk_bytes} is not a positive multiple of the {frame_bytes}-byte frame")]
    InvalidChunkSize {
        chunk_bytes: usize,
        frame_bytes: usize,
    },

    #[error("Invalid stream format: {0}")]
    InvalidFormat(String),

    #[error("Queue depth must be at least 1")]
    InvalidQueueDepth,

    #[error("Write timeout must be non-zero")]
    InvalidWriteTimeout,
}

/// Broadcast server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_address: SocketAddr,
    /// Upper bound on writing one chunk to one client before it is dropped
    pub write_timeout: Duration,
    /// Chunks a client may fall behind by before it is dropped
    pub client_queue_depth: usize,
    /// Format advertised in the envelope sent to each new client
    pub format: StreamFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            client_queue_depth: DEFAULT_CLIENT_QUEUE_DEPTH,
            format: StreamFormat::default(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.write_timeout.is_zero() {
            return Err(ConfigError::InvalidWriteTimeout);
        }
        if self.client_queue_depth == 0 {
            return Err(ConfigError::InvalidQueueDepth);
        }
        validate_format(&self.format)
    }
}

/// Where the producer reads audio from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// Live capture device (None = system default input)
    Device(Option<String>),
    /// Replay a 16-bit PCM WAV file at real-time pace
    WavFile { path: PathBuf, loop_audio: bool },
}

impl Default for SourceKind {
    fn default() -> Self {
        SourceKind::Device(None)
    }
}

/// Capture producer settings
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub source: SourceKind,
    pub format: StreamFormat,
    /// Bytes per emitted chunk, a whole number of frames
    pub chunk_bytes: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::default(),
            format: StreamFormat::default(),
            chunk_bytes: DEFAULT_CHUNK_BYTES,
        }
    }
}

impl CaptureConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_format(&self.format)?;
        let frame_bytes = self.format.bytes_per_frame();
        if self.chunk_bytes == 0 || self.chunk_bytes % frame_bytes != 0 {
            return Err(ConfigError::InvalidChunkSize {
                chunk_bytes: self.chunk_bytes,
                frame_bytes,
            });
        }
        Ok(())
    }

    pub fn frames_per_chunk(&self) -> usize {
        self.chunk_bytes / self.format.bytes_per_frame()
    }
}

/// Full process configuration
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    pub server: ServerConfig,
    pub capture: CaptureConfig,
    /// Chunks buffered between producer and server before the oldest is dropped
    pub queue_depth: usize,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            capture: CaptureConfig::default(),
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl StreamerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_depth == 0 {
            return Err(ConfigError::InvalidQueueDepth);
        }
        self.server.validate()?;
        self.capture.validate()
    }
}

fn validate_format(format: &StreamFormat) -> Result<(), ConfigError> {
    if format.sample_rate == 0 {
        return Err(ConfigError::InvalidFormat(
            "sample rate must be non-zero".to_string(),
        ));
    }
    if format.channels == 0 {
        return Err(ConfigError::InvalidFormat(
            "channel count must be non-zero".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StreamerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.listen_address.port(), 8080);
        assert!(config.server.listen_address.ip().is_unspecified());
        assert_eq!(config.capture.frames_per_chunk(), 2048);
    }

    #[test]
    fn test_chunk_size_must_hold_whole_frames() {
        let config = CaptureConfig {
            format: StreamFormat::new(48_000, 2),
            chunk_bytes: 4094,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidChunkSize {
                chunk_bytes: 4094,
                frame_bytes: 4
            })
        );

        let empty = CaptureConfig {
            chunk_bytes: 0,
            ..Default::default()
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_rate_and_channels() {
        let mut config = StreamerConfig::default();
        config.capture.format.channels = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidFormat(_))
        ));

        let mut config = StreamerConfig::default();
        config.server.format.sample_rate = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_rejects_zero_queue_and_timeout() {
        let config = StreamerConfig {
            queue_depth: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidQueueDepth));

        let mut config = StreamerConfig::default();
        config.server.write_timeout = Duration::ZERO;
        assert_eq!(config.validate(), Err(ConfigError::InvalidWriteTimeout));

        let mut config = StreamerConfig::default();
        config.server.client_queue_depth = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidQueueDepth));
    }
}
