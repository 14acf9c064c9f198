//! WAV container parsing and encoding.
//!
//! Two entry points with different failure contracts:
//! - `parse_metadata` is total. The worker is an external process that can
//!   emit corrupt or truncated output, so any structural anomaly degrades to
//!   a conservative byte-length estimate instead of failing the caller.
//! - `decode` is strict and returns an error; the concatenator must not join
//!   segments it cannot fully interpret.

use crate::{Result, SynthError};

/// Per the fallback assumption: 16 kHz, mono, 16-bit.
const FALLBACK_SAMPLE_RATE: u32 = 16_000;
const FALLBACK_BYTES_PER_SEC: f64 = 32_000.0;
const RIFF_HEADER_LEN: usize = 12;
const STANDARD_HEADER_LEN: usize = 44;

/// Sub-blocks larger than this are rejected; this format carries short
/// synthesized clips, not long recordings.
const MAX_CHUNK_BYTES: u32 = 10 * 1024 * 1024;
const MAX_DURATION_SECS: f64 = 3600.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioMetadata {
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

/// Decoded PCM payload of a WAV file, still in its on-disk sample format.
#[derive(Debug, Clone)]
pub struct PcmAudio {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub data: Vec<u8>,
}

/// Extract duration/rate/channel metadata from WAV bytes. Never fails: on any
/// structural anomaly the result is an estimate from raw byte length at the
/// fallback rate.
pub fn parse_metadata(bytes: &[u8]) -> AudioMetadata {
    try_parse(bytes).unwrap_or_else(|| fallback_estimate(bytes.len()))
}

fn fallback_estimate(byte_len: usize) -> AudioMetadata {
    let payload = byte_len.saturating_sub(STANDARD_HEADER_LEN);
    AudioMetadata {
        duration_seconds: payload as f64 / FALLBACK_BYTES_PER_SEC,
        sample_rate: FALLBACK_SAMPLE_RATE,
        channels: 1,
        bits_per_sample: 16,
    }
}

struct FormatBlock {
    audio_format: u16,
    channels: u16,
    sample_rate: u32,
    bits_per_sample: u16,
}

fn read_u16(bytes: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes(bytes.get(at..at + 2)?.try_into().ok()?))
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(bytes.get(at..at + 4)?.try_into().ok()?))
}

/// Walk the RIFF chunk list, bounds-checking every step.
fn walk_chunks(bytes: &[u8]) -> Option<(FormatBlock, usize)> {
    if bytes.len() < RIFF_HEADER_LEN || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return None;
    }

    let mut offset = RIFF_HEADER_LEN;
    let mut format: Option<FormatBlock> = None;
    let mut data_len: Option<usize> = None;

    while offset + 8 <= bytes.len() {
        let tag = &bytes[offset..offset + 4];
        let size = read_u32(bytes, offset + 4)?;
        if size > MAX_CHUNK_BYTES {
            return None;
        }
        let body = offset + 8;

        match tag {
            b"fmt " => {
                if size < 16 || body + 16 > bytes.len() {
                    return None;
                }
                format = Some(FormatBlock {
                    audio_format: read_u16(bytes, body)?,
                    channels: read_u16(bytes, body + 2)?,
                    sample_rate: read_u32(bytes, body + 4)?,
                    bits_per_sample: read_u16(bytes, body + 14)?,
                });
            }
            b"data" => {
                // Declared length must not exceed what is actually present.
                if body + size as usize > bytes.len() {
                    return None;
                }
                data_len = Some(size as usize);
            }
            _ => {}
        }

        // Chunk bodies are padded to an even boundary.
        let advance = 8 + size as usize + (size as usize & 1);
        offset = offset.checked_add(advance)?;
        if format.is_some() && data_len.is_some() {
            break;
        }
    }

    Some((format?, data_len?))
}

fn try_parse(bytes: &[u8]) -> Option<AudioMetadata> {
    let (fmt, data_len) = walk_chunks(bytes)?;

    // Only uncompressed linear PCM is parseable here.
    if fmt.audio_format != 1 {
        return None;
    }
    if !(8_000..=48_000).contains(&fmt.sample_rate) {
        return None;
    }
    if !(1..=8).contains(&fmt.channels) {
        return None;
    }
    if !matches!(fmt.bits_per_sample, 8 | 16 | 24 | 32) {
        return None;
    }

    let bytes_per_frame = fmt.channels as usize * (fmt.bits_per_sample as usize / 8);
    let frames = data_len / bytes_per_frame;
    let duration = frames as f64 / fmt.sample_rate as f64;
    if !duration.is_finite() || duration <= 0.0 || duration > MAX_DURATION_SECS {
        return None;
    }

    Some(AudioMetadata {
        duration_seconds: duration,
        sample_rate: fmt.sample_rate,
        channels: fmt.channels,
        bits_per_sample: fmt.bits_per_sample,
    })
}

/// Strict decode for concatenation. Same structural rules as `try_parse`, but
/// anomalies are errors rather than estimates.
pub fn decode(bytes: &[u8]) -> Result<PcmAudio> {
    let (fmt, data_len) =
        walk_chunks(bytes).ok_or_else(|| SynthError::Audio("malformed WAV container".into()))?;
    if fmt.audio_format != 1 {
        return Err(SynthError::Audio(format!(
            "unsupported WAV encoding {} (PCM required)",
            fmt.audio_format
        )));
    }
    if !matches!(fmt.bits_per_sample, 8 | 16 | 24 | 32) {
        return Err(SynthError::Audio(format!(
            "unsupported bit depth {}",
            fmt.bits_per_sample
        )));
    }
    if fmt.channels == 0 || fmt.sample_rate == 0 {
        return Err(SynthError::Audio("zero channels or sample rate".into()));
    }

    // data chunk body position: re-walk to find it (container is tiny).
    let mut offset = RIFF_HEADER_LEN;
    while offset + 8 <= bytes.len() {
        let tag = &bytes[offset..offset + 4];
        let size = u32::from_le_bytes(bytes[offset + 4..offset + 8].try_into().unwrap_or([0; 4]))
            as usize;
        if tag == b"data" {
            let body = offset + 8;
            return Ok(PcmAudio {
                sample_rate: fmt.sample_rate,
                channels: fmt.channels,
                bits_per_sample: fmt.bits_per_sample,
                data: bytes[body..body + data_len].to_vec(),
            });
        }
        offset += 8 + size + (size & 1);
    }
    Err(SynthError::Audio("missing data chunk".into()))
}

/// Encode 16-bit mono PCM samples as a standard 44-byte-header WAV file.
pub fn encode_pcm16(sample_rate: u32, samples: &[i16]) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let mut out = Vec::with_capacity(STANDARD_HEADER_LEN + data_len as usize);

    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");

    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&1u16.to_le_bytes()); // mono
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * 2).to_le_bytes()); // byte rate
    out.extend_from_slice(&2u16.to_le_bytes()); // block align
    out.extend_from_slice(&16u16.to_le_bytes()); // bits per sample

    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}
