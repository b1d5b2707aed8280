#![allow(dead_code)]

use audio_streamer::envelope::{HTTP_PREAMBLE, WAV_HEADER_LEN};
use audio_streamer::{
    chunk_channel, AudioChunk, BroadcastServer, ChunkSender, ServerConfig, ServerStats,
    ServerSummary, Shutdown, StreamFormat,
};
use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const CHUNK_LEN: usize = 256;
pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn test_format() -> StreamFormat {
    StreamFormat::new(16_000, 1)
}

pub fn loopback_config(format: StreamFormat) -> ServerConfig {
    ServerConfig {
        listen_address: "127.0.0.1:0".parse().unwrap(),
        format,
        ..ServerConfig::default()
    }
}

/// Chunk whose every byte is `tag`, so receivers can check order.
pub fn tagged_chunk(tag: u8) -> AudioChunk {
    AudioChunk::from(vec![tag; CHUNK_LEN])
}

/// Chunk of `len` bytes, all `tag`.
pub fn tagged_chunk_of(tag: u8, len: usize) -> AudioChunk {
    AudioChunk::from(vec![tag; len])
}

/// Broadcast server running on a background thread, fed by the test.
pub struct TestServer {
    pub addr: SocketAddr,
    pub stats: Arc<ServerStats>,
    pub shutdown: Shutdown,
    sender: Option<ChunkSender>,
    handle: JoinHandle<audio_streamer::Result<ServerSummary>>,
}

impl TestServer {
    pub fn start() -> Self {
        Self::start_with(loopback_config(test_format()))
    }

    pub fn start_with(config: ServerConfig) -> Self {
        env_logger::try_init().ok();

        let server = BroadcastServer::bind(config).expect("Failed to bind test server");
        let addr = server.local_addr();
        let stats = server.stats();
        let shutdown = server.shutdown_handle();
        let (sender, receiver) = chunk_channel(64);
        let handle = thread::spawn(move || server.run(receiver));

        Self {
            addr,
            stats,
            shutdown,
            sender: Some(sender),
            handle,
        }
    }

    pub fn send(&self, chunk: AudioChunk) {
        self.sender
            .as_ref()
            .expect("Producer already ended")
            .send(chunk)
            .expect("Server stopped receiving");
    }

    /// Wait until the server has registered exactly `count` clients.
    pub fn wait_for_clients(&self, count: usize) {
        wait_until(|| self.stats.connected() == count, "client count");
    }

    pub fn wait_for_chunks(&self, count: u64) {
        wait_until(|| self.stats.chunks_broadcast() >= count, "chunks broadcast");
    }

    /// End the stream as a finished producer would and collect the summary.
    pub fn finish(mut self) -> ServerSummary {
        self.sender.take();
        self.join()
    }

    pub fn join(self) -> ServerSummary {
        self.handle
            .join()
            .expect("Server thread panicked")
            .expect("Server returned an error")
    }
}

pub fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "Timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

/// Consumer that speaks just enough of the stream format to verify it.
pub struct TestClient {
    stream: TcpStream,
    pub envelope: Vec<u8>,
}

impl TestClient {
    /// Connect and read the envelope.
    pub fn connect(addr: SocketAddr) -> Self {
        let mut stream = TcpStream::connect(addr).expect("Failed to connect");
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();

        let mut envelope = vec![0u8; HTTP_PREAMBLE.len() + WAV_HEADER_LEN];
        stream
            .read_exact(&mut envelope)
            .expect("Failed to read envelope");
        Self { stream, envelope }
    }

    /// Connect without consuming anything.
    pub fn connect_raw(addr: SocketAddr) -> TcpStream {
        TcpStream::connect(addr).expect("Failed to connect")
    }

    pub fn read_bytes(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf).expect("Failed to read chunk");
        buf
    }

    /// Read one tagged chunk and return its tag.
    pub fn read_tag(&mut self) -> u8 {
        self.read_tag_of(CHUNK_LEN)
    }

    pub fn read_tag_of(&mut self, len: usize) -> u8 {
        let chunk = self.read_bytes(len);
        let tag = chunk[0];
        assert!(chunk.iter().all(|&b| b == tag), "Chunk bytes interleaved");
        tag
    }

    /// Read whatever is available. False once the connection is closed.
    pub fn read_some(&mut self, buf: &mut [u8]) -> bool {
        matches!(self.stream.read(buf), Ok(n) if n > 0)
    }

    /// True once the server has closed the connection.
    pub fn at_eof(&mut self) -> bool {
        let mut buf = [0u8; 64];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::ConnectionReset => return true,
                Err(_) => return false,
            }
        }
    }
}
