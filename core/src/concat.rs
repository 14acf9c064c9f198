//! Joining independently generated audio segments into one stream.
//!
//! Segments from separate worker calls can disagree on sample rate, channel
//! count, or bit depth, so everything is normalized to the first segment's
//! sample rate as 16-bit mono before joining. A single segment passes through
//! untouched. Join failures are fatal to the whole chunked call.

use crate::wav::{self, PcmAudio};
use crate::{Result, SynthError};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Merge WAV segments in the given order into one normalized WAV stream.
pub fn concatenate(segments: &[Vec<u8>]) -> Result<Vec<u8>> {
    match segments {
        [] => Err(SynthError::Audio("no segments to concatenate".into())),
        [single] => Ok(single.clone()),
        _ => {
            let first = wav::decode(&segments[0])?;
            let target_rate = first.sample_rate;

            let mut samples: Vec<i16> = Vec::new();
            for (i, segment) in segments.iter().enumerate() {
                let pcm = wav::decode(segment).map_err(|e| {
                    SynthError::Audio(format!("segment {i} undecodable: {e}"))
                })?;
                let mono = to_mono_i16(&pcm)?;
                if pcm.sample_rate != target_rate {
                    debug!(
                        segment = i,
                        from = pcm.sample_rate,
                        to = target_rate,
                        "resampling segment before join"
                    );
                    samples.extend(resample(&mono, pcm.sample_rate, target_rate));
                } else {
                    samples.extend(mono);
                }
            }
            Ok(wav::encode_pcm16(target_rate, &samples))
        }
    }
}

/// Read per-chunk intermediate files, join them, and delete the intermediates
/// on success. The files are not part of the observable contract; only the
/// merged output is.
pub fn merge_files(paths: &[PathBuf]) -> Result<Vec<u8>> {
    let mut segments = Vec::with_capacity(paths.len());
    for path in paths {
        segments.push(std::fs::read(path)?);
    }
    let merged = concatenate(&segments)?;
    for path in paths {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), "failed to remove intermediate chunk file: {e}");
        }
    }
    Ok(merged)
}

/// Collapse interleaved channels by averaging, converting samples to i16.
fn to_mono_i16(pcm: &PcmAudio) -> Result<Vec<i16>> {
    let bytes_per_sample = pcm.bits_per_sample as usize / 8;
    let channels = pcm.channels as usize;
    let frame_len = bytes_per_sample * channels;
    if frame_len == 0 {
        return Err(SynthError::Audio("degenerate frame layout".into()));
    }

    let frames = pcm.data.len() / frame_len;
    let mut out = Vec::with_capacity(frames);
    for frame in 0..frames {
        let mut acc: i64 = 0;
        for ch in 0..channels {
            let at = frame * frame_len + ch * bytes_per_sample;
            acc += sample_i16(&pcm.data[at..at + bytes_per_sample], pcm.bits_per_sample)? as i64;
        }
        out.push((acc / channels as i64) as i16);
    }
    Ok(out)
}

fn sample_i16(raw: &[u8], bits: u16) -> Result<i16> {
    match bits {
        // 8-bit WAV is unsigned, centered at 128.
        8 => Ok(((raw[0] as i16) - 128) << 8),
        16 => Ok(i16::from_le_bytes([raw[0], raw[1]])),
        24 => {
            let v = i32::from_le_bytes([0, raw[0], raw[1], raw[2]]) >> 8;
            Ok((v >> 8) as i16)
        }
        32 => {
            let v = i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            Ok((v >> 16) as i16)
        }
        other => Err(SynthError::Audio(format!("unsupported bit depth {other}"))),
    }
}

/// Linear-interpolation resampling. Adequate for joining speech segments at
/// matching-or-near rates; not a general-purpose resampler.
fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let out_len = ((samples.len() as u64 * to_rate as u64) / from_rate as u64) as usize;
    let mut out = Vec::with_capacity(out_len);
    let step = from_rate as f64 / to_rate as f64;
    for i in 0..out_len {
        let pos = i as f64 * step;
        let base = pos as usize;
        let frac = pos - base as f64;
        let a = samples[base.min(samples.len() - 1)] as f64;
        let b = samples[(base + 1).min(samples.len() - 1)] as f64;
        out.push((a + (b - a) * frac).round() as i16);
    }
    out
}
