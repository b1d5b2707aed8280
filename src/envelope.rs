//! One-time framing written to every client before raw PCM starts flowing.
//!
//! A minimal HTTP/1.1 response (so browsers, curl and media players accept the
//! feed) followed by a canonical 44-byte RIFF/WAVE header whose size fields
//! carry the streaming sentinel, since the total length is never known.

use crate::types::{StreamFormat, BITS_PER_SAMPLE};
use std::io::{self, Write};

pub const HTTP_PREAMBLE: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Type: audio/wav\r\nConnection: close\r\n\r\n";

pub const WAV_HEADER_LEN: usize = 44;

/// Size value meaning "unknown, streaming"
pub const STREAMING_SIZE: u32 = 0xFFFF_FFFF;

const WAVE_FORMAT_PCM: u16 = 1;
const FMT_CHUNK_LEN: u32 = 16;

/// Build the RIFF/WAVE header for an endless PCM stream.
pub fn wav_header(format: &StreamFormat) -> [u8; WAV_HEADER_LEN] {
    let block_align = format.bytes_per_frame() as u16;

    let mut header = [0u8; WAV_HEADER_LEN];
    header[0..4].copy_from_slice(b"RIFF");
    header[4..8].copy_from_slice(&STREAMING_SIZE.to_le_bytes());
    header[8..12].copy_from_slice(b"WAVE");

    header[12..16].copy_from_slice(b"fmt ");
    header[16..20].copy_from_slice(&FMT_CHUNK_LEN.to_le_bytes());
    header[20..22].copy_from_slice(&WAVE_FORMAT_PCM.to_le_bytes());
    header[22..24].copy_from_slice(&format.channels.to_le_bytes());
    header[24..28].copy_from_slice(&format.sample_rate.to_le_bytes());
    header[28..32].copy_from_slice(&format.byte_rate().to_le_bytes());
    header[32..34].copy_from_slice(&block_align.to_le_bytes());
    header[34..36].copy_from_slice(&BITS_PER_SAMPLE.to_le_bytes());

    header[36..40].copy_from_slice(b"data");
    header[40..44].copy_from_slice(&STREAMING_SIZE.to_le_bytes());
    header
}

/// Full envelope (HTTP preamble + WAV header) as one buffer.
pub fn envelope(format: &StreamFormat) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HTTP_PREAMBLE.len() + WAV_HEADER_LEN);
    bytes.extend_from_slice(HTTP_PREAMBLE);
    bytes.extend_from_slice(&wav_header(format));
    bytes
}

/// Write the envelope in full, flushing before returning.
pub fn write_envelope<W: Write>(writer: &mut W, envelope: &[u8]) -> io::Result<()> {
    writer.write_all(envelope)?;
    writer.flush()
}
