pub mod capture;
pub mod channel;
pub mod config;
pub mod envelope;
pub mod error;
pub mod server;
pub mod shutdown;
pub mod types;

pub use capture::{spawn_producer, CaptureError, FrameSource, ProducerHandle, ProducerSummary};
pub use channel::{chunk_channel, ChunkReceiver, ChunkSender};
pub use config::{CaptureConfig, ServerConfig, SourceKind, StreamerConfig};
pub use error::{Result, StreamerError};
pub use server::{BroadcastServer, ServerStats, ServerSummary};
pub use shutdown::Shutdown;
pub use types::{AudioChunk, StreamFormat};
