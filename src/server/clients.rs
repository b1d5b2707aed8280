use crate::envelope;
use crate::types::AudioChunk;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

pub type ClientId = u64;

const WATCH_BUFFER_SIZE: usize = 1024;

/// Notifications from a client's writer and read-watcher threads.
#[derive(Debug)]
pub enum ClientEvent {
    /// Peer closed its side
    Closed(ClientId),
    ReadFailed(ClientId, io::Error),
    /// A chunk could not be written within the write timeout
    WriteFailed(ClientId, io::Error),
}

impl ClientEvent {
    pub fn client_id(&self) -> ClientId {
        match self {
            ClientEvent::Closed(id)
            | ClientEvent::ReadFailed(id, _)
            | ClientEvent::WriteFailed(id, _) => *id,
        }
    }
}

/// Why a chunk could not be handed to a client.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("client is too slow, its queue is full")]
    Lagging,

    #[error("client writer has stopped")]
    WriterStopped,
}

/// One connected consumer.
///
/// Chunks are queued to a dedicated writer thread, so a slow peer only ever
/// holds up itself. The socket is shut down when this value is dropped, which
/// also stops both helper threads; a connection can only be closed once.
#[derive(Debug)]
pub struct ClientConnection {
    id: ClientId,
    peer: SocketAddr,
    stream: TcpStream,
    write_timeout: Duration,
    queue: Option<Sender<AudioChunk>>,
    writer_done: Option<Receiver<()>>,
}

impl ClientConnection {
    /// Wrap an accepted socket. Writes are bounded by `write_timeout`.
    pub fn new(id: ClientId, stream: TcpStream, write_timeout: Duration) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(write_timeout))?;
        let peer = stream.peer_addr()?;
        Ok(Self {
            id,
            peer,
            stream,
            write_timeout,
            queue: None,
            writer_done: None,
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Write the stream envelope. Sent once, before `start`.
    pub fn send_envelope(&mut self, envelope: &[u8]) -> io::Result<()> {
        envelope::write_envelope(&mut self.stream, envelope)
    }

    /// Spawn the writer (fed by a queue of `queue_depth` chunks) and the
    /// read watcher. Both report failures on `events`.
    pub fn start(&mut self, queue_depth: usize, events: Sender<ClientEvent>) -> io::Result<()> {
        let id = self.id;
        let writer = self.stream.try_clone()?;
        let reader = self.stream.try_clone()?;
        let (queue_tx, queue_rx) = channel::bounded(queue_depth.max(1));
        let (done_tx, done_rx) = channel::bounded::<()>(0);

        let write_events = events.clone();
        let write_timeout = self.write_timeout;
        thread::Builder::new()
            .name(format!("client-{}-tx", id))
            .spawn(move || {
                let _done = done_tx;
                write_chunks(id, writer, queue_rx, write_timeout, write_events)
            })?;
        self.queue = Some(queue_tx);
        self.writer_done = Some(done_rx);

        thread::Builder::new()
            .name(format!("client-{}-rx", id))
            .spawn(move || watch_reads(id, reader, events))?;
        Ok(())
    }

    /// Queue a chunk without blocking.
    pub fn offer(&self, chunk: &AudioChunk) -> Result<(), DeliveryError> {
        let queue = self.queue.as_ref().ok_or(DeliveryError::WriterStopped)?;
        match queue.try_send(chunk.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DeliveryError::Lagging),
            Err(TrySendError::Disconnected(_)) => Err(DeliveryError::WriterStopped),
        }
    }

    /// Stop queueing and wait until the writer has written what it holds, or
    /// `deadline` passes. Returns false on timeout.
    fn flush_until(&mut self, deadline: Instant) -> bool {
        self.queue = None;
        match &self.writer_done {
            Some(done) => matches!(
                done.recv_deadline(deadline),
                Err(RecvTimeoutError::Disconnected)
            ),
            None => true,
        }
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        // Wakes the writer and the read watcher blocked on cloned handles
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// A client dropped during a fan-out pass.
#[derive(Debug)]
pub struct FailedClient {
    pub id: ClientId,
    pub peer: SocketAddr,
    pub error: DeliveryError,
}

#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: Vec<FailedClient>,
}

/// Live connections, owned and mutated by the broadcast loop only.
#[derive(Debug, Default)]
pub struct ClientSet {
    clients: HashMap<ClientId, ClientConnection>,
}

impl ClientSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, client: ClientConnection) {
        self.clients.insert(client.id(), client);
    }

    /// Remove a client, returning it (and closing it when dropped). `None` if
    /// it was already gone.
    pub fn remove(&mut self, id: ClientId) -> Option<ClientConnection> {
        self.clients.remove(&id)
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Queue `chunk` for every client. Never blocks: clients whose queue is
    /// full or whose writer has stopped are removed and closed, the others
    /// are unaffected.
    pub fn broadcast(&mut self, chunk: &AudioChunk) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        self.clients.retain(|&id, client| match client.offer(chunk) {
            Ok(()) => {
                report.delivered += 1;
                true
            }
            Err(error) => {
                report.failed.push(FailedClient {
                    id,
                    peer: client.peer(),
                    error,
                });
                false
            }
        });

        report
    }

    /// Close every client immediately, returning how many were open.
    pub fn close_all(&mut self) -> usize {
        let count = self.clients.len();
        self.clients.clear();
        count
    }

    /// Let every writer finish its queued chunks (all in parallel, bounded by
    /// `timeout` overall), then close every client.
    pub fn flush_and_close_all(&mut self, timeout: Duration) -> usize {
        for client in self.clients.values_mut() {
            client.queue = None;
        }
        let deadline = Instant::now() + timeout;
        for client in self.clients.values_mut() {
            if !client.flush_until(deadline) {
                log::debug!("Client {} did not drain before close", client.id());
            }
        }
        self.close_all()
    }
}

/// Write `bytes` in full before `timeout` runs out, however the kernel splits
/// the writes.
pub fn write_within(stream: &mut TcpStream, mut bytes: &[u8], timeout: Duration) -> io::Result<()> {
    let deadline = Instant::now() + timeout;
    while !bytes.is_empty() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(
                ErrorKind::TimedOut,
                format!("chunk not written within {:?}", timeout),
            ));
        }
        stream.set_write_timeout(Some(remaining))?;
        match stream.write(bytes) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => bytes = &bytes[n..],
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(io::Error::new(
                    ErrorKind::TimedOut,
                    format!("chunk not written within {:?}", timeout),
                ));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn write_chunks(
    id: ClientId,
    mut stream: TcpStream,
    queue: Receiver<AudioChunk>,
    write_timeout: Duration,
    events: Sender<ClientEvent>,
) {
    let mut failure = None;
    for chunk in queue.iter() {
        if let Err(e) = write_within(&mut stream, chunk.as_bytes(), write_timeout) {
            failure = Some(e);
            break;
        }
        log::trace!("📡 Wrote {} bytes to client {}", chunk.len(), id);
    }

    // Close the queue first so later offers see the writer as stopped
    drop(queue);
    if let Some(e) = failure {
        let _ = events.send(ClientEvent::WriteFailed(id, e));
    }
}

/// Block on the client's read side until it closes. Anything the client
/// sends (typically an HTTP request) is discarded.
fn watch_reads(id: ClientId, mut reader: TcpStream, events: Sender<ClientEvent>) {
    let mut buf = [0u8; WATCH_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                let _ = events.send(ClientEvent::Closed(id));
                return;
            }
            Ok(n) => log::trace!("Ignoring {} bytes from client {}", n, id),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = events.send(ClientEvent::ReadFailed(id, e));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    const TIMEOUT: Duration = Duration::from_secs(2);

    /// Connected (server side, client side) socket pair on loopback.
    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    fn connection(id: ClientId) -> (ClientConnection, TcpStream) {
        let (server, client) = socket_pair();
        let conn = ClientConnection::new(id, server, TIMEOUT).unwrap();
        client.set_read_timeout(Some(TIMEOUT)).unwrap();
        (conn, client)
    }

    fn started(id: ClientId, events: &Sender<ClientEvent>) -> (ClientConnection, TcpStream) {
        let (mut conn, peer) = connection(id);
        conn.start(4, events.clone()).unwrap();
        (conn, peer)
    }

    fn chunk(bytes: &[u8]) -> AudioChunk {
        AudioChunk::from(bytes)
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut set = ClientSet::new();
        let (conn, _peer) = connection(1);
        set.insert(conn);

        assert!(set.contains(1));
        assert!(set.remove(1).is_some());
        assert!(set.remove(1).is_none());
        assert!(set.is_empty());
    }

    #[test]
    fn test_dropping_connection_closes_peer() {
        let (conn, mut peer) = connection(1);
        drop(conn);

        let mut buf = [0u8; 8];
        assert_eq!(peer.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_broadcast_reaches_every_client() {
        let (events, _event_rx) = channel::unbounded();
        let mut set = ClientSet::new();
        let mut peers = Vec::new();
        for id in 1..=3 {
            let (conn, peer) = started(id, &events);
            set.insert(conn);
            peers.push(peer);
        }

        let report = set.broadcast(&chunk(b"pcm!"));
        assert_eq!(report.delivered, 3);
        assert!(report.failed.is_empty());

        for mut peer in peers {
            let mut buf = [0u8; 4];
            peer.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"pcm!");
        }
    }

    #[test]
    fn test_failed_writer_is_removed_and_others_keep_receiving() {
        let (events, event_rx) = channel::unbounded();
        let mut set = ClientSet::new();
        let (broken, _broken_peer) = started(1, &events);
        let (healthy, mut healthy_peer) = started(2, &events);

        // Writes on the broken client now fail with a pipe error
        broken.stream.shutdown(Shutdown::Write).unwrap();
        set.insert(broken);
        set.insert(healthy);

        let first = set.broadcast(&chunk(b"one!"));
        assert_eq!(first.delivered, 2);

        match event_rx.recv_timeout(TIMEOUT).unwrap() {
            ClientEvent::WriteFailed(id, _) => assert_eq!(id, 1),
            other => panic!("unexpected event: {:?}", other),
        }

        let second = set.broadcast(&chunk(b"two!"));
        assert_eq!(second.delivered, 1);
        assert_eq!(second.failed.len(), 1);
        assert_eq!(second.failed[0].id, 1);
        assert_eq!(second.failed[0].error, DeliveryError::WriterStopped);
        assert!(!set.contains(1));
        assert!(set.contains(2));

        let mut buf = [0u8; 8];
        healthy_peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"one!two!");
    }

    #[test]
    fn test_full_queue_drops_only_that_client() {
        let mut set = ClientSet::new();

        // Queue with nobody draining it stands in for a stuck writer
        let (mut lagging, _lagging_peer) = connection(1);
        let (queue_tx, _queue_rx) = channel::bounded(1);
        lagging.queue = Some(queue_tx);
        set.insert(lagging);

        let (events, _event_rx) = channel::unbounded();
        let (healthy, mut healthy_peer) = started(2, &events);
        set.insert(healthy);

        assert_eq!(set.broadcast(&chunk(b"aa")).delivered, 2);

        let report = set.broadcast(&chunk(b"bb"));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].id, 1);
        assert_eq!(report.failed[0].error, DeliveryError::Lagging);
        assert_eq!(set.len(), 1);

        let mut buf = [0u8; 4];
        healthy_peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"aabb");
    }

    #[test]
    fn test_write_within_bounds_the_whole_chunk() {
        let (mut server, _idle_peer) = socket_pair();

        // Far more than any socket buffer holds, to a peer that never reads
        let bytes = vec![0u8; 64 * 1024 * 1024];
        let started = Instant::now();
        let err = write_within(&mut server, &bytes, Duration::from_millis(200)).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_flush_writes_queued_chunks_before_closing() {
        let (events, _event_rx) = channel::unbounded();
        let mut set = ClientSet::new();
        let (conn, mut peer) = started(1, &events);
        set.insert(conn);

        set.broadcast(&chunk(b"last"));
        assert_eq!(set.flush_and_close_all(TIMEOUT), 1);

        let mut received = Vec::new();
        peer.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"last");
    }

    #[test]
    fn test_close_all_reports_count() {
        let mut set = ClientSet::new();
        let (a, _pa) = connection(1);
        let (b, _pb) = connection(2);
        set.insert(a);
        set.insert(b);

        assert_eq!(set.close_all(), 2);
        assert_eq!(set.len(), 0);
        assert_eq!(set.close_all(), 0);
    }
}
