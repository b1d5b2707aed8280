use super::{CaptureError, FrameSource};
use crate::types::StreamFormat;
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    BuildStreamError, DefaultStreamConfigError, Device, DeviceNameError, DevicesError,
    FromSample, Host, PlayStreamError, Sample, SampleFormat, SampleRate, SizedSample,
    Stream as CpalStream, StreamError, SupportedStreamConfig, SupportedStreamConfigsError,
};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Chunks buffered between the device callback and the producer loop.
const DEVICE_QUEUE_CHUNKS: usize = 8;
const READ_POLL: Duration = Duration::from_millis(100);
/// A device that delivers nothing for this long is treated as failed.
const STALL_TIMEOUT: Duration = Duration::from_secs(5);

impl From<DevicesError> for CaptureError {
    fn from(err: DevicesError) -> Self {
        CaptureError::Device(err.to_string())
    }
}

impl From<DeviceNameError> for CaptureError {
    fn from(err: DeviceNameError) -> Self {
        CaptureError::Device(err.to_string())
    }
}

impl From<SupportedStreamConfigsError> for CaptureError {
    fn from(err: SupportedStreamConfigsError) -> Self {
        CaptureError::Config(err.to_string())
    }
}

impl From<DefaultStreamConfigError> for CaptureError {
    fn from(err: DefaultStreamConfigError) -> Self {
        CaptureError::Config(err.to_string())
    }
}

impl From<BuildStreamError> for CaptureError {
    fn from(err: BuildStreamError) -> Self {
        CaptureError::Stream(err.to_string())
    }
}

impl From<PlayStreamError> for CaptureError {
    fn from(err: PlayStreamError) -> Self {
        CaptureError::Stream(err.to_string())
    }
}

/// Packs device samples into S16LE chunks of `chunk_bytes` inside the data
/// callback. A raised `reset` flag discards the partially filled chunk, so no
/// chunk spans a gap in the device stream.
struct ChunkAssembler {
    chunk_bytes: usize,
    pending: Vec<u8>,
    reset: Arc<AtomicBool>,
}

impl ChunkAssembler {
    fn new(chunk_bytes: usize, reset: Arc<AtomicBool>) -> Self {
        Self {
            chunk_bytes,
            pending: Vec::with_capacity(chunk_bytes),
            reset,
        }
    }

    fn push<T>(&mut self, data: &[T], mut emit: impl FnMut(Vec<u8>))
    where
        T: Sample,
        i16: FromSample<T>,
    {
        if self.reset.swap(false, Ordering::SeqCst) {
            self.pending.clear();
        }

        for &sample in data {
            let value = i16::from_sample(sample);
            self.pending.extend_from_slice(&value.to_le_bytes());

            if self.pending.len() >= self.chunk_bytes {
                emit(std::mem::replace(
                    &mut self.pending,
                    Vec::with_capacity(self.chunk_bytes),
                ));
            }
        }
    }
}

/// Audio device information
#[derive(Debug, Clone)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub channel_count: u16,
    pub default_sample_rate: u32,
    pub sample_format: String,
}

/// Live capture from a cpal input device.
///
/// The device callback packs samples into S16LE chunk buffers and hands them
/// over a small bounded queue; if the producer falls behind and the queue
/// fills, the overrun is reported on the next read.
pub struct CpalSource {
    device_name: Option<String>,
    chunk_bytes: usize,
    device: Option<Device>,
    stream: Option<CpalStream>,
    data_rx: Option<Receiver<Vec<u8>>>,
    overrun: Arc<AtomicBool>,
    reset: Arc<AtomicBool>,
    fatal: Arc<Mutex<Option<String>>>,
}

impl CpalSource {
    /// `device_name` of `None` selects the default input device.
    pub fn new(device_name: Option<String>, chunk_bytes: usize) -> Self {
        Self {
            device_name,
            chunk_bytes,
            device: None,
            stream: None,
            data_rx: None,
            overrun: Arc::new(AtomicBool::new(false)),
            reset: Arc::new(AtomicBool::new(false)),
            fatal: Arc::new(Mutex::new(None)),
        }
    }

    fn find_device(host: &Host, name: Option<&str>) -> Result<Device, CaptureError> {
        match name {
            Some(name) => host
                .input_devices()?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| CaptureError::Device(format!("Device not found: {}", name))),
            None => host
                .default_input_device()
                .ok_or_else(|| CaptureError::Device("No default input device found".into())),
        }
    }

    /// Pick the supported configuration with the requested channel count whose
    /// rate range is closest to the requested rate, preferring native i16.
    fn pick_config(
        device: &Device,
        format: &StreamFormat,
    ) -> Result<SupportedStreamConfig, CaptureError> {
        let wanted = format.sample_rate;
        let best = device
            .supported_input_configs()?
            .filter(|range| range.channels() == format.channels)
            .min_by_key(|range| {
                let nearest = wanted.clamp(range.min_sample_rate().0, range.max_sample_rate().0);
                let format_rank = match range.sample_format() {
                    SampleFormat::I16 => 0,
                    _ => 1,
                };
                (nearest.abs_diff(wanted), format_rank)
            })
            .ok_or_else(|| {
                CaptureError::Config(format!(
                    "Device does not support {} channel(s)",
                    format.channels
                ))
            })?;

        let rate = wanted.clamp(best.min_sample_rate().0, best.max_sample_rate().0);
        Ok(best.with_sample_rate(SampleRate(rate)))
    }

    fn build_stream<T>(
        &self,
        device: &Device,
        config: &cpal::StreamConfig,
        data_tx: Sender<Vec<u8>>,
    ) -> Result<CpalStream, CaptureError>
    where
        T: Sample + SizedSample + Send + Sync + 'static,
        i16: FromSample<T>,
    {
        let mut assembler = ChunkAssembler::new(self.chunk_bytes, Arc::clone(&self.reset));

        let overrun = Arc::clone(&self.overrun);
        let data_fn = move |data: &[T], _: &cpal::InputCallbackInfo| {
            assembler.push(data, |chunk| match data_tx.try_send(chunk) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(_)) => overrun.store(true, Ordering::SeqCst),
            });
        };

        let overrun = Arc::clone(&self.overrun);
        let fatal = Arc::clone(&self.fatal);
        let err_fn = move |err: StreamError| match err {
            StreamError::DeviceNotAvailable => {
                log::error!("🎤 Capture device is no longer available");
                if let Ok(mut fatal) = fatal.lock() {
                    if fatal.is_none() {
                        *fatal = Some("Capture device is no longer available".to_string());
                    }
                }
            }
            other => {
                log::warn!("⚠️  Audio stream error: {}", other);
                overrun.store(true, Ordering::SeqCst);
            }
        };

        Ok(device.build_input_stream(config, data_fn, err_fn, None)?)
    }

    fn start_stream(
        &mut self,
        device: &Device,
        format: &StreamFormat,
    ) -> Result<StreamFormat, CaptureError> {
        let supported = Self::pick_config(device, format)?;
        let stream_config = supported.config();
        let (data_tx, data_rx) = channel::bounded(DEVICE_QUEUE_CHUNKS);

        log::debug!(
            "🎤 Device config: {} channels @ {}Hz (native format: {:?})",
            stream_config.channels,
            stream_config.sample_rate.0,
            supported.sample_format()
        );

        let stream = match supported.sample_format() {
            SampleFormat::I16 => self.build_stream::<i16>(device, &stream_config, data_tx)?,
            SampleFormat::U16 => self.build_stream::<u16>(device, &stream_config, data_tx)?,
            SampleFormat::I32 => self.build_stream::<i32>(device, &stream_config, data_tx)?,
            SampleFormat::F32 => self.build_stream::<f32>(device, &stream_config, data_tx)?,
            other => {
                return Err(CaptureError::Config(format!(
                    "Unsupported sample format: {:?}",
                    other
                )))
            }
        };
        stream.play()?;

        self.stream = Some(stream);
        self.data_rx = Some(data_rx);
        Ok(StreamFormat::new(
            stream_config.sample_rate.0,
            stream_config.channels,
        ))
    }
}

impl FrameSource for CpalSource {
    fn open(&mut self) -> Result<(), CaptureError> {
        let host = cpal::default_host();
        log::info!("🎤 Initializing audio capture with host: {:?}", host.id());

        let device = Self::find_device(&host, self.device_name.as_deref())?;
        log::info!(
            "🎤 Using input device: {}",
            device.name().unwrap_or_else(|_| "<unnamed>".to_string())
        );

        self.device = Some(device);
        Ok(())
    }

    fn configure(&mut self, format: &StreamFormat) -> Result<StreamFormat, CaptureError> {
        let device = self
            .device
            .take()
            .ok_or_else(|| CaptureError::Device("Capture device is not open".into()))?;
        let result = self.start_stream(&device, format);
        self.device = Some(device);
        result
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, CaptureError> {
        let data_rx = self
            .data_rx
            .as_ref()
            .ok_or_else(|| CaptureError::Stream("Capture stream is not running".into()))?;

        let started = Instant::now();
        loop {
            if let Some(reason) = self.fatal.lock().ok().and_then(|mut f| f.take()) {
                return Err(CaptureError::Stream(reason));
            }
            if self.overrun.swap(false, Ordering::SeqCst) {
                return Err(CaptureError::Overrun);
            }

            match data_rx.recv_timeout(READ_POLL) {
                Ok(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    return Ok(n);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if started.elapsed() >= STALL_TIMEOUT {
                        return Err(CaptureError::Stream(format!(
                            "No audio from device for {:?}",
                            STALL_TIMEOUT
                        )));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(CaptureError::Stream("Capture stream closed".into()));
                }
            }
        }
    }

    fn recover(&mut self) -> Result<(), CaptureError> {
        // Drop the callback's partial chunk as well as the queued ones
        self.reset.store(true, Ordering::SeqCst);
        let discarded = self
            .data_rx
            .as_ref()
            .map(|rx| rx.try_iter().count())
            .unwrap_or(0);
        self.overrun.store(false, Ordering::SeqCst);
        log::debug!("🎤 Discarded {} stale chunk(s) after overrun", discarded);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                log::debug!("🎤 Failed to pause capture stream: {}", e);
            }
        }
        self.data_rx = None;
        self.device = None;
        log::info!("🎤 Released capture device");
    }
}

/// Enumerate capture devices with their default configuration.
pub fn list_input_devices() -> Result<Vec<AudioDeviceInfo>, CaptureError> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let mut result = Vec::new();
    for device in host.input_devices()? {
        let Ok(name) = device.name() else {
            continue;
        };
        // Skip devices that advertise no usable input configuration
        let Ok(config) = device.default_input_config() else {
            continue;
        };

        result.push(AudioDeviceInfo {
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
            channel_count: config.channels(),
            default_sample_rate: config.sample_rate().0,
            sample_format: format!("{:?}", config.sample_format()),
        });
    }

    Ok(result)
}
