//! Capture producer: pulls fixed-size PCM chunks from a [`FrameSource`] and
//! feeds them to the broadcast loop through the chunk channel.

mod cpal_source;
mod wav_source;

pub use cpal_source::{list_input_devices, AudioDeviceInfo, CpalSource};
pub use wav_source::WavFileSource;

use crate::channel::{ChunkSender, SendError, SendOutcome};
use crate::config::{CaptureConfig, SourceKind};
use crate::shutdown::Shutdown;
use crate::types::{AudioChunk, StreamFormat};
use crossbeam::channel::{self, Receiver};
use std::io;
use std::thread::{self, JoinHandle};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Audio stream error: {0}")]
    Stream(String),

    /// Device buffer overrun. The only error the producer recovers from.
    #[error("Capture overrun")]
    Overrun,

    #[error("Audio source exhausted")]
    EndOfStream,

    #[error("Capture source failed to start")]
    StartupFailed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Capture thread error: {0}")]
    Thread(String),
}

impl CaptureError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CaptureError::Overrun)
    }
}

/// A capture device as seen by the producer.
///
/// Implementations need not be `Send`: the producer thread builds its source
/// itself (see [`spawn_producer`]).
pub trait FrameSource {
    /// Acquire the device.
    fn open(&mut self) -> Result<(), CaptureError>;

    /// Apply the requested format, returning the format actually in effect
    /// (the sample rate may be negotiated to the nearest supported value).
    fn configure(&mut self, format: &StreamFormat) -> Result<StreamFormat, CaptureError>;

    /// Block until up to `buf.len()` bytes of whole frames are available and
    /// copy them into `buf`, returning the byte count.
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, CaptureError>;

    /// Reset stream state after [`CaptureError::Overrun`].
    fn recover(&mut self) -> Result<(), CaptureError>;

    /// Release the device. Called exactly once on every exit path after `open`.
    fn close(&mut self);
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn open(&mut self) -> Result<(), CaptureError> {
        (**self).open()
    }

    fn configure(&mut self, format: &StreamFormat) -> Result<StreamFormat, CaptureError> {
        (**self).configure(format)
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, CaptureError> {
        (**self).read_chunk(buf)
    }

    fn recover(&mut self) -> Result<(), CaptureError> {
        (**self).recover()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    Opening,
    Configuring,
    Streaming,
    RecoveringOverrun,
    Stopped,
}

/// Counters reported when the producer stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerSummary {
    pub chunks_emitted: u64,
    pub bytes_emitted: u64,
    pub overruns: u64,
    pub chunks_evicted: u64,
}

pub struct CaptureProducer<S: FrameSource> {
    source: S,
    config: CaptureConfig,
    state: ProducerState,
    opened: bool,
    summary: ProducerSummary,
}

impl<S: FrameSource> CaptureProducer<S> {
    pub fn new(source: S, config: CaptureConfig) -> Self {
        Self {
            source,
            config,
            state: ProducerState::Opening,
            opened: false,
            summary: ProducerSummary::default(),
        }
    }

    pub fn state(&self) -> ProducerState {
        self.state
    }

    /// Open and configure the device. Failure leaves the producer `Stopped`.
    pub fn start(&mut self) -> Result<StreamFormat, CaptureError> {
        self.transition(ProducerState::Opening);
        if let Err(e) = self.source.open() {
            log::error!("🎤 Failed to open capture source: {}", e);
            self.transition(ProducerState::Stopped);
            return Err(e);
        }
        self.opened = true;

        self.transition(ProducerState::Configuring);
        match self.source.configure(&self.config.format) {
            Ok(format) => {
                if format != self.config.format {
                    log::warn!(
                        "🎤 Device negotiated {} Hz / {} ch (requested {} Hz / {} ch)",
                        format.sample_rate,
                        format.channels,
                        self.config.format.sample_rate,
                        self.config.format.channels
                    );
                }
                log::info!(
                    "🎤 Capture configured: {} Hz, {} channel(s), S16LE, {} bytes per chunk",
                    format.sample_rate,
                    format.channels,
                    self.config.chunk_bytes
                );
                self.config.format = format;
                Ok(format)
            }
            Err(e) => {
                log::error!("🎤 Failed to configure capture source: {}", e);
                self.stop();
                Err(e)
            }
        }
    }

    /// Emit chunks until the consumer goes away, shutdown is requested, the
    /// source is exhausted or a fatal device error occurs. Always releases the
    /// device before returning.
    pub fn stream(
        &mut self,
        sender: &ChunkSender,
        shutdown: &Shutdown,
    ) -> Result<ProducerSummary, CaptureError> {
        let result = self.stream_chunks(sender, shutdown);
        self.summary.chunks_evicted = sender.evicted();
        self.stop();

        match &result {
            Ok(()) => log::info!(
                "🎤 Capture stopped ({} chunks, {} overruns, {} dropped)",
                self.summary.chunks_emitted,
                self.summary.overruns,
                self.summary.chunks_evicted
            ),
            Err(e) => log::error!("🎤 Capture failed: {}", e),
        }
        result.map(|()| self.summary.clone())
    }

    /// `start` followed by `stream`.
    pub fn run(
        mut self,
        sender: ChunkSender,
        shutdown: &Shutdown,
    ) -> Result<ProducerSummary, CaptureError> {
        self.start()?;
        self.stream(&sender, shutdown)
    }

    fn stream_chunks(
        &mut self,
        sender: &ChunkSender,
        shutdown: &Shutdown,
    ) -> Result<(), CaptureError> {
        self.transition(ProducerState::Streaming);
        let mut buffer = vec![0u8; self.config.chunk_bytes];

        while !shutdown.is_triggered() {
            match self.source.read_chunk(&mut buffer) {
                Ok(0) => continue,
                Ok(n) => {
                    let chunk = AudioChunk::from(&buffer[..n]);
                    match sender.send(chunk) {
                        Ok(SendOutcome::Queued) => {}
                        Ok(SendOutcome::EvictedOldest(count)) => {
                            log::warn!(
                                "🐌 Broadcast loop is behind, dropped {} oldest chunk(s)",
                                count
                            );
                        }
                        Err(SendError::Closed) => {
                            log::info!("🎤 Chunk consumer closed, stopping capture");
                            return Ok(());
                        }
                    }
                    self.summary.chunks_emitted += 1;
                    self.summary.bytes_emitted += n as u64;
                    log::trace!("🎤 Emitted chunk of {} bytes", n);
                }
                Err(e) if e.is_recoverable() => {
                    self.transition(ProducerState::RecoveringOverrun);
                    self.summary.overruns += 1;
                    log::warn!("⚠️  Capture overrun, resetting device stream");
                    self.source.recover()?;
                    self.transition(ProducerState::Streaming);
                }
                Err(CaptureError::EndOfStream) => {
                    log::info!("🎤 Capture source reached end of stream");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }

        log::info!("🎤 Shutdown requested, stopping capture");
        Ok(())
    }

    fn stop(&mut self) {
        if self.opened {
            self.source.close();
            self.opened = false;
        }
        self.transition(ProducerState::Stopped);
    }

    fn transition(&mut self, next: ProducerState) {
        if self.state != next {
            log::debug!("🎤 Producer {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

/// Running producer thread.
pub struct ProducerHandle {
    ready: Receiver<Result<StreamFormat, CaptureError>>,
    join: JoinHandle<Result<ProducerSummary, CaptureError>>,
}

impl ProducerHandle {
    /// Wait until the device is open and configured, returning the effective
    /// format, or the error that stopped it.
    pub fn wait_ready(&self) -> Result<StreamFormat, CaptureError> {
        self.ready.recv().map_err(|_| {
            CaptureError::Thread("capture thread exited before reporting readiness".to_string())
        })?
    }

    pub fn join(self) -> Result<ProducerSummary, CaptureError> {
        self.join
            .join()
            .map_err(|_| CaptureError::Thread("capture thread panicked".to_string()))?
    }
}

/// Run a producer on its own thread. `factory` builds the source on that
/// thread, so device handles never cross threads.
pub fn spawn_producer<F, S>(
    factory: F,
    config: CaptureConfig,
    sender: ChunkSender,
    shutdown: Shutdown,
) -> Result<ProducerHandle, CaptureError>
where
    F: FnOnce() -> Result<S, CaptureError> + Send + 'static,
    S: FrameSource,
{
    let (ready_tx, ready_rx) = channel::bounded(1);

    let join = thread::Builder::new()
        .name("audio-capture".to_string())
        .spawn(move || {
            let source = match factory() {
                Ok(source) => source,
                Err(e) => {
                    log::error!("🎤 Failed to create capture source: {}", e);
                    let _ = ready_tx.send(Err(e));
                    return Err(CaptureError::StartupFailed);
                }
            };

            let mut producer = CaptureProducer::new(source, config);
            match producer.start() {
                Ok(format) => {
                    let _ = ready_tx.send(Ok(format));
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return Err(CaptureError::StartupFailed);
                }
            }

            // `sender` is dropped when this closure returns, which the
            // broadcast loop observes as end-of-stream.
            producer.stream(&sender, &shutdown)
        })?;

    Ok(ProducerHandle {
        ready: ready_rx,
        join,
    })
}

/// Build the source selected by `config`.
pub fn open_source(config: &CaptureConfig) -> Box<dyn FrameSource> {
    match &config.source {
        SourceKind::Device(name) => Box::new(CpalSource::new(name.clone(), config.chunk_bytes)),
        SourceKind::WavFile { path, loop_audio } => {
            Box::new(WavFileSource::new(path.clone(), *loop_audio))
        }
    }
}
