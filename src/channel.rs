//! Bounded producer → server chunk queue with drop-oldest overflow.
//!
//! The capture thread must never block on a stalled consumer, so a full
//! queue evicts its oldest chunk to make room for the newest one. Delivery
//! order of the chunks that survive is unchanged.

use crate::types::AudioChunk;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SendError {
    #[error("Chunk receiver has gone away")]
    Closed,
}

/// What happened to a successfully queued chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// Queued after evicting this many older chunks
    EvictedOldest(usize),
}

/// Create a chunk queue holding at most `capacity` chunks.
pub fn chunk_channel(capacity: usize) -> (ChunkSender, ChunkReceiver) {
    let (tx, rx) = channel::bounded(capacity.max(1));
    let closed = Arc::new(AtomicBool::new(false));
    let evicted = Arc::new(AtomicU64::new(0));

    let sender = ChunkSender {
        tx,
        evictor: rx.clone(),
        closed: Arc::clone(&closed),
        evicted: Arc::clone(&evicted),
    };
    let receiver = ChunkReceiver { rx, closed, evicted };
    (sender, receiver)
}

/// Producer side. Dropping it signals end-of-stream to the receiver once the
/// queue drains.
pub struct ChunkSender {
    tx: Sender<AudioChunk>,
    evictor: Receiver<AudioChunk>,
    closed: Arc<AtomicBool>,
    evicted: Arc<AtomicU64>,
}

impl ChunkSender {
    pub fn send(&self, chunk: AudioChunk) -> Result<SendOutcome, SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }

        let mut pending = chunk;
        let mut evicted = 0;
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => break,
                Err(TrySendError::Full(chunk)) => {
                    pending = chunk;
                    // The consumer may have drained the queue in the meantime,
                    // in which case there is nothing to evict and we just retry.
                    if self.evictor.try_recv().is_ok() {
                        evicted += 1;
                    }
                }
                Err(TrySendError::Disconnected(_)) => return Err(SendError::Closed),
            }
        }

        if evicted == 0 {
            Ok(SendOutcome::Queued)
        } else {
            self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
            Ok(SendOutcome::EvictedOldest(evicted))
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Total chunks discarded because the queue was full.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

/// Consumer side, read by the broadcast loop.
pub struct ChunkReceiver {
    rx: Receiver<AudioChunk>,
    closed: Arc<AtomicBool>,
    evicted: Arc<AtomicU64>,
}

impl ChunkReceiver {
    /// Underlying channel, for use in `select!`. Reports disconnection once the
    /// sender is gone and every queued chunk has been taken.
    pub fn channel(&self) -> &Receiver<AudioChunk> {
        &self.rx
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Drop for ChunkReceiver {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::TryRecvError;

    fn chunk(tag: u8) -> AudioChunk {
        AudioChunk::from(vec![tag; 4])
    }

    #[test]
    fn test_delivers_in_order() {
        let (tx, rx) = chunk_channel(8);
        for tag in 0..5 {
            assert_eq!(tx.send(chunk(tag)), Ok(SendOutcome::Queued));
        }
        for tag in 0..5 {
            assert_eq!(rx.channel().try_recv().unwrap(), chunk(tag));
        }
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let (tx, rx) = chunk_channel(3);
        for tag in 0..3 {
            tx.send(chunk(tag)).unwrap();
        }
        assert_eq!(tx.send(chunk(3)), Ok(SendOutcome::EvictedOldest(1)));
        assert_eq!(tx.send(chunk(4)), Ok(SendOutcome::EvictedOldest(1)));
        assert_eq!(tx.evicted(), 2);
        assert_eq!(rx.evicted(), 2);

        let received: Vec<_> = rx.channel().try_iter().collect();
        assert_eq!(received, vec![chunk(2), chunk(3), chunk(4)]);
    }

    #[test]
    fn test_dropping_sender_ends_stream_after_drain() {
        let (tx, rx) = chunk_channel(4);
        tx.send(chunk(7)).unwrap();
        drop(tx);

        assert_eq!(rx.channel().try_recv().unwrap(), chunk(7));
        assert_eq!(rx.channel().try_recv(), Err(TryRecvError::Disconnected));
    }

    #[test]
    fn test_dropping_receiver_closes_sender() {
        let (tx, rx) = chunk_channel(4);
        drop(rx);
        assert!(tx.is_closed());
        assert_eq!(tx.send(chunk(1)), Err(SendError::Closed));
    }
}
