use super::{CaptureError, FrameSource};
use crate::types::{StreamFormat, BITS_PER_SAMPLE};
use hound::{SampleFormat, WavReader};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::thread;
use std::time::Instant;

impl From<hound::Error> for CaptureError {
    fn from(err: hound::Error) -> Self {
        match err {
            hound::Error::IoError(e) => CaptureError::Io(e),
            other => CaptureError::Config(other.to_string()),
        }
    }
}

/// Replays a 16-bit PCM WAV file as if it were a capture device, paced at
/// real time. Handy for running the streamer without audio hardware.
pub struct WavFileSource {
    path: PathBuf,
    loop_audio: bool,
    paced: bool,
    reader: Option<WavReader<BufReader<File>>>,
    format: Option<StreamFormat>,
    next_deadline: Option<Instant>,
}

impl WavFileSource {
    pub fn new(path: PathBuf, loop_audio: bool) -> Self {
        Self {
            path,
            loop_audio,
            paced: true,
            reader: None,
            format: None,
            next_deadline: None,
        }
    }

    /// Disable real-time pacing and deliver chunks as fast as they are read.
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    fn wait_for_deadline(&mut self, format: &StreamFormat, bytes: usize) {
        if !self.paced {
            return;
        }
        let deadline = self.next_deadline.unwrap_or_else(Instant::now) + format.duration_of(bytes);
        let now = Instant::now();
        if deadline > now {
            thread::sleep(deadline - now);
        }
        self.next_deadline = Some(deadline);
    }
}

impl FrameSource for WavFileSource {
    fn open(&mut self) -> Result<(), CaptureError> {
        let reader = WavReader::open(&self.path)?;
        let spec = reader.spec();
        log::info!(
            "📁 Replaying {}: {}Hz, {} channel(s), {} bits{}",
            self.path.display(),
            spec.sample_rate,
            spec.channels,
            spec.bits_per_sample,
            if self.loop_audio { ", looping" } else { "" }
        );
        self.reader = Some(reader);
        Ok(())
    }

    fn configure(&mut self, format: &StreamFormat) -> Result<StreamFormat, CaptureError> {
        let reader = self
            .reader
            .as_ref()
            .ok_or_else(|| CaptureError::Device("WAV file is not open".into()))?;
        let spec = reader.spec();

        if spec.sample_format != SampleFormat::Int || spec.bits_per_sample != BITS_PER_SAMPLE {
            return Err(CaptureError::Config(format!(
                "Expected 16-bit integer PCM, got {} bits {:?}",
                spec.bits_per_sample, spec.sample_format
            )));
        }

        // The file dictates the format; the requested one is only a preference.
        let effective = StreamFormat::new(spec.sample_rate, spec.channels);
        if effective != *format {
            log::debug!(
                "📁 File format {:?} overrides requested {:?}",
                effective,
                format
            );
        }
        self.format = Some(effective);
        Ok(effective)
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, CaptureError> {
        let format = self
            .format
            .ok_or_else(|| CaptureError::Stream("WAV source is not configured".into()))?;
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| CaptureError::Stream("WAV file is not open".into()))?;

        let frame_bytes = format.bytes_per_frame();
        let wanted = (buf.len() / frame_bytes) * frame_bytes;
        let mut filled = 0;
        let mut rewound = false;

        while filled < wanted {
            let next = reader.samples::<i16>().next();
            match next {
                Some(sample) => {
                    buf[filled..filled + 2].copy_from_slice(&sample?.to_le_bytes());
                    filled += 2;
                    rewound = false;
                }
                None if self.loop_audio && !rewound => {
                    log::debug!("📁 End of file, looping");
                    reader.seek(0)?;
                    rewound = true;
                }
                None => break,
            }
        }

        // Drop a trailing partial frame from a truncated file
        filled -= filled % frame_bytes;
        if filled == 0 {
            return Err(CaptureError::EndOfStream);
        }

        self.wait_for_deadline(&format, filled);
        Ok(filled)
    }

    fn recover(&mut self) -> Result<(), CaptureError> {
        self.next_deadline = None;
        Ok(())
    }

    fn close(&mut self) {
        self.reader = None;
        self.next_deadline = None;
    }
}
