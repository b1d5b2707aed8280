use std::sync::Arc;
use std::time::Duration;

/// Bytes per 16-bit signed little-endian sample, the only wire format we serve.
pub const BYTES_PER_SAMPLE: usize = 2;
pub const BITS_PER_SAMPLE: u16 = 16;

pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
pub const DEFAULT_CHANNELS: u16 = 1;
pub const DEFAULT_CHUNK_BYTES: usize = 4096;

/// PCM layout of the captured stream. Fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
        }
    }
}

impl StreamFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Size of one interleaved frame (one sample per channel).
    pub fn bytes_per_frame(&self) -> usize {
        BYTES_PER_SAMPLE * self.channels as usize
    }

    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * self.bytes_per_frame() as u32
    }

    /// Wall-clock duration covered by `bytes` of audio in this format.
    pub fn duration_of(&self, bytes: usize) -> Duration {
        let rate = self.byte_rate();
        if rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(bytes as f64 / rate as f64)
    }
}

/// One read burst from the capture device.
///
/// The payload is shared, so handing the same chunk to many clients never
/// copies the audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    data: Arc<[u8]>,
}

impl AudioChunk {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self { data: data.into() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<Vec<u8>> for AudioChunk {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl From<&[u8]> for AudioChunk {
    fn from(data: &[u8]) -> Self {
        Self::new(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_format_matches_capture_defaults() {
        let format = StreamFormat::default();
        assert_eq!(format.sample_rate, 48_000);
        assert_eq!(format.channels, 1);
        assert_eq!(format.bytes_per_frame(), 2);
        assert_eq!(format.byte_rate(), 96_000);
    }

    #[test]
    fn test_duration_of_chunk() {
        let format = StreamFormat::new(16_000, 2);
        // 16k frames * 4 bytes = one second
        assert_eq!(format.duration_of(64_000), Duration::from_secs(1));
        assert_eq!(format.duration_of(0), Duration::ZERO);
    }

    #[test]
    fn test_chunk_clone_shares_payload() {
        let chunk = AudioChunk::from(vec![1u8, 2, 3, 4]);
        let copy = chunk.clone();
        assert_eq!(chunk.as_bytes().as_ptr(), copy.as_bytes().as_ptr());
        assert_eq!(copy.len(), 4);
        assert!(!copy.is_empty());
    }
}
