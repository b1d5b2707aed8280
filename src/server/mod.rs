//! Broadcast server: fans every captured chunk out to all connected clients.
//!
//! A single control loop owns the client set and never writes to a socket
//! itself. Helper threads only forward events to it: one acceptor thread hands
//! over new sockets, and each client has a writer thread draining a small
//! queue plus a watcher reporting when the peer closes its side.

mod clients;

pub use clients::{
    write_within, BroadcastReport, ClientConnection, ClientEvent, ClientId, ClientSet,
    DeliveryError, FailedClient,
};

use crate::channel::ChunkReceiver;
use crate::config::ServerConfig;
use crate::envelope;
use crate::error::{Result, StreamerError};
use crate::shutdown::Shutdown;
use crate::types::AudioChunk;
use crossbeam::channel::{self, Receiver, Select, Sender, TryRecvError};
use log::{debug, error, info, trace, warn};
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);
const ACCEPT_BACKLOG: usize = 64;

/// Live counters, readable from any thread while the server runs.
#[derive(Debug, Default)]
pub struct ServerStats {
    accepted: AtomicU64,
    envelope_failures: AtomicU64,
    connected: AtomicUsize,
    removed: AtomicU64,
    closed_at_shutdown: AtomicU64,
    chunks_broadcast: AtomicU64,
    bytes_broadcast: AtomicU64,
}

impl ServerStats {
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Clients currently in the broadcast set.
    pub fn connected(&self) -> usize {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn removed(&self) -> u64 {
        self.removed.load(Ordering::Relaxed)
    }

    pub fn chunks_broadcast(&self) -> u64 {
        self.chunks_broadcast.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ServerSummary {
        ServerSummary {
            accepted: self.accepted(),
            envelope_failures: self.envelope_failures.load(Ordering::Relaxed),
            connected: self.connected(),
            removed: self.removed(),
            closed_at_shutdown: self.closed_at_shutdown.load(Ordering::Relaxed),
            chunks_broadcast: self.chunks_broadcast(),
            bytes_broadcast: self.bytes_broadcast.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerSummary {
    pub accepted: u64,
    /// Connections discarded because the envelope could not be written
    pub envelope_failures: u64,
    pub connected: usize,
    /// Clients removed while streaming (failed write or peer closed)
    pub removed: u64,
    pub closed_at_shutdown: u64,
    pub chunks_broadcast: u64,
    /// Total payload bytes handed to client writers, summed over clients
    pub bytes_broadcast: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Shutdown,
    EndOfStream,
    AcceptorStopped,
}

pub struct BroadcastServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ServerConfig,
    envelope: Vec<u8>,
    stats: Arc<ServerStats>,
    shutdown: Shutdown,
}

impl BroadcastServer {
    /// Bind the listening socket. The envelope sent to every client is fixed
    /// here from `config.format`.
    pub fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let listener =
            TcpListener::bind(config.listen_address).map_err(|source| StreamerError::Bind {
                address: config.listen_address,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        info!(
            "🎧 Listening on {} ({}Hz, {} channel(s), 16-bit PCM)",
            local_addr, config.format.sample_rate, config.format.channels
        );

        Ok(Self {
            listener,
            local_addr,
            envelope: envelope::envelope(&config.format),
            config,
            stats: Arc::new(ServerStats::default()),
            shutdown: Shutdown::new(),
        })
    }

    /// Share an existing shutdown signal instead of the server's own.
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Run the broadcast loop until shutdown is requested or the producer ends
    /// the stream. Every client is closed and the listener released on return.
    pub fn run(self, chunks: ChunkReceiver) -> Result<ServerSummary> {
        let BroadcastServer {
            listener,
            local_addr,
            config,
            envelope,
            stats,
            shutdown,
        } = self;

        listener.set_nonblocking(true)?;
        let accepting = Arc::new(AtomicBool::new(true));
        let (accept_tx, accept_rx) = channel::bounded(ACCEPT_BACKLOG);
        let acceptor = spawn_acceptor(listener, accept_tx, Arc::clone(&accepting))?;

        let (event_tx, event_rx) = channel::unbounded();
        let mut control = ControlLoop {
            clients: ClientSet::new(),
            next_id: 1,
            envelope,
            write_timeout: config.write_timeout,
            client_queue_depth: config.client_queue_depth,
            events: event_tx,
            stats: Arc::clone(&stats),
        };

        let exit = control.run(&accept_rx, &chunks, &event_rx, &shutdown);

        accepting.store(false, Ordering::SeqCst);
        let closed = match exit {
            // Clients get what was already fanned out before the stream ends
            LoopExit::EndOfStream => control.clients.flush_and_close_all(config.write_timeout),
            LoopExit::Shutdown | LoopExit::AcceptorStopped => control.clients.close_all(),
        };
        stats
            .closed_at_shutdown
            .store(closed as u64, Ordering::Relaxed);
        stats.connected.store(0, Ordering::Relaxed);

        drop(accept_rx);
        if acceptor.join().is_err() {
            error!("❌ Connection acceptor panicked");
        }

        let summary = stats.snapshot();
        info!(
            "🛑 Broadcast on {} stopped ({:?}): {} accepted, {} removed, {} closed, {} chunks, {} bytes, {} evicted",
            local_addr,
            exit,
            summary.accepted,
            summary.removed,
            summary.closed_at_shutdown,
            summary.chunks_broadcast,
            summary.bytes_broadcast,
            chunks.evicted()
        );

        match exit {
            LoopExit::AcceptorStopped => Err(StreamerError::Thread(
                "Connection acceptor stopped unexpectedly".into(),
            )),
            LoopExit::Shutdown | LoopExit::EndOfStream => Ok(summary),
        }
    }
}

/// State owned by the control loop thread.
struct ControlLoop {
    clients: ClientSet,
    next_id: ClientId,
    envelope: Vec<u8>,
    write_timeout: Duration,
    client_queue_depth: usize,
    events: Sender<ClientEvent>,
    stats: Arc<ServerStats>,
}

impl ControlLoop {
    fn run(
        &mut self,
        accepts: &Receiver<(TcpStream, SocketAddr)>,
        chunks: &ChunkReceiver,
        events: &Receiver<ClientEvent>,
        shutdown: &Shutdown,
    ) -> LoopExit {
        let mut select = Select::new();
        select.recv(accepts);
        select.recv(chunks.channel());
        select.recv(events);
        select.recv(shutdown.receiver());

        loop {
            select.ready();

            // Service everything that is ready, in registration order
            loop {
                match accepts.try_recv() {
                    Ok((stream, peer)) => self.admit(stream, peer),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return LoopExit::AcceptorStopped,
                }
            }

            // Bounded by what is queued now so a busy producer cannot starve
            // the other sources
            let pending = chunks.channel().len().max(1);
            for _ in 0..pending {
                match chunks.channel().try_recv() {
                    Ok(chunk) => self.fan_out(&chunk),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        info!("📭 Producer ended the stream");
                        return LoopExit::EndOfStream;
                    }
                }
            }

            while let Ok(event) = events.try_recv() {
                self.handle_event(event);
            }

            if shutdown.is_triggered() {
                return LoopExit::Shutdown;
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        let id = self.next_id;
        self.next_id += 1;

        let mut client = match ClientConnection::new(id, stream, self.write_timeout) {
            Ok(client) => client,
            Err(e) => {
                warn!("⚠️ Could not set up connection from {}: {}", peer, e);
                self.stats.envelope_failures.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if let Err(e) = client.send_envelope(&self.envelope) {
            warn!("⚠️ Failed to send stream header to {}: {}", peer, e);
            self.stats.envelope_failures.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if let Err(e) = client.start(self.client_queue_depth, self.events.clone()) {
            warn!("⚠️ Could not start client {} ({}): {}", id, peer, e);
            self.stats.envelope_failures.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.clients.insert(client);
        self.stats
            .connected
            .store(self.clients.len(), Ordering::Relaxed);
        info!(
            "🔌 Client {} connected from {} ({} connected)",
            id,
            peer,
            self.clients.len()
        );
    }

    fn fan_out(&mut self, chunk: &AudioChunk) {
        let report = self.clients.broadcast(chunk);

        for failed in &report.failed {
            match failed.error {
                DeliveryError::Lagging => warn!(
                    "🐌 Dropping client {} ({}): {}",
                    failed.id, failed.peer, failed.error
                ),
                DeliveryError::WriterStopped => {
                    info!("👋 Client {} ({}) disconnected", failed.id, failed.peer)
                }
            }
        }

        self.stats
            .removed
            .fetch_add(report.failed.len() as u64, Ordering::Relaxed);
        self.stats.chunks_broadcast.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_broadcast.fetch_add(
            (chunk.len() * report.delivered) as u64,
            Ordering::Relaxed,
        );
        self.stats
            .connected
            .store(self.clients.len(), Ordering::Relaxed);

        trace!(
            "📡 Queued {} bytes for {} client(s)",
            chunk.len(),
            report.delivered
        );
    }

    fn handle_event(&mut self, event: ClientEvent) {
        let id = event.client_id();

        // Several threads may report the same client; only the first counts
        let Some(client) = self.clients.remove(id) else {
            trace!("Client {} already removed", id);
            return;
        };

        match event {
            ClientEvent::Closed(_) => {
                info!("👋 Client {} ({}) disconnected", id, client.peer())
            }
            ClientEvent::ReadFailed(_, e) => {
                warn!("❌ Client {} ({}) read error: {}", id, client.peer(), e)
            }
            ClientEvent::WriteFailed(_, e) => {
                warn!("❌ Dropping client {} ({}): {}", id, client.peer(), e)
            }
        }
        drop(client);

        self.stats.removed.fetch_add(1, Ordering::Relaxed);
        self.stats
            .connected
            .store(self.clients.len(), Ordering::Relaxed);
    }
}

fn spawn_acceptor(
    listener: TcpListener,
    sockets: Sender<(TcpStream, SocketAddr)>,
    accepting: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("accept".into())
        .spawn(move || {
            while accepting.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        debug!("New connection from {}", peer);
                        if sockets.send((stream, peer)).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        thread::sleep(ACCEPT_POLL_INTERVAL);
                    }
                    Err(e) => {
                        warn!("⚠️ Failed to accept connection: {}", e);
                        thread::sleep(ACCEPT_RETRY_DELAY);
                    }
                }
            }
            debug!("Acceptor stopped, releasing listener");
        })?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::chunk_channel;
    use crate::types::StreamFormat;

    fn loopback_config() -> ServerConfig {
        ServerConfig {
            listen_address: "127.0.0.1:0".parse().unwrap(),
            format: StreamFormat::new(8_000, 1),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_bind_reports_address_in_use() {
        let first = BroadcastServer::bind(loopback_config()).unwrap();
        let config = ServerConfig {
            listen_address: first.local_addr(),
            ..loopback_config()
        };

        match BroadcastServer::bind(config) {
            Err(StreamerError::Bind { address, .. }) => assert_eq!(address, first.local_addr()),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("second bind should fail"),
        }
    }

    #[test]
    fn test_returns_when_producer_ends() {
        let server = BroadcastServer::bind(loopback_config()).unwrap();
        let (tx, rx) = chunk_channel(4);
        tx.send(AudioChunk::from(vec![1u8; 4])).unwrap();
        drop(tx);

        let summary = server.run(rx).unwrap();
        assert_eq!(summary.chunks_broadcast, 1);
        assert_eq!(summary.bytes_broadcast, 0);
        assert_eq!(summary.accepted, 0);
    }

    #[test]
    fn test_returns_on_shutdown() {
        let server = BroadcastServer::bind(loopback_config()).unwrap();
        let shutdown = server.shutdown_handle();
        let (_tx, rx) = chunk_channel(4);

        let handle = thread::spawn(move || server.run(rx));
        thread::sleep(Duration::from_millis(50));
        shutdown.trigger();

        let summary = handle.join().unwrap().unwrap();
        assert_eq!(summary.chunks_broadcast, 0);
        assert_eq!(summary.closed_at_shutdown, 0);
    }

    #[test]
    fn test_listener_released_after_run() {
        let server = BroadcastServer::bind(loopback_config()).unwrap();
        let addr = server.local_addr();
        let (tx, rx) = chunk_channel(1);
        drop(tx);
        server.run(rx).unwrap();

        let rebound = TcpListener::bind(addr);
        assert!(rebound.is_ok());
    }
}
