use std::path::PathBuf;
use verse_core::concat::{concatenate, merge_files};
use verse_core::wav::{decode, encode_pcm16, parse_metadata};

fn tone(rate: u32, seconds: f64, amplitude: i16) -> Vec<u8> {
    let n = (rate as f64 * seconds) as usize;
    encode_pcm16(rate, &vec![amplitude; n])
}

fn unique_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "verse-concat-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0)
    ));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

#[test]
fn single_segment_passes_through_unchanged() {
    let seg = tone(24_000, 0.5, 300);
    let merged = concatenate(std::slice::from_ref(&seg)).expect("merge");
    assert_eq!(merged, seg);
}

#[test]
fn same_rate_segments_join_in_order() {
    let a = tone(24_000, 0.25, 100);
    let b = tone(24_000, 0.25, 200);
    let c = tone(24_000, 0.25, 300);
    let merged = concatenate(&[a, b, c]).expect("merge");

    let meta = parse_metadata(&merged);
    assert_eq!(meta.sample_rate, 24_000);
    assert!((meta.duration_seconds - 0.75).abs() < 0.01);

    // Sample values must appear in segment order, not completion order.
    let pcm = decode(&merged).expect("decode merged");
    let samples: Vec<i16> = pcm
        .data
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect();
    let third = samples.len() / 3;
    assert_eq!(samples[third / 2], 100);
    assert_eq!(samples[third + third / 2], 200);
    assert_eq!(samples[2 * third + third / 2], 300);
}

#[test]
fn mixed_rates_normalize_to_first_segment() {
    let a = tone(24_000, 0.5, 100);
    let b = tone(16_000, 0.5, 200);
    let merged = concatenate(&[a, b]).expect("merge");

    let meta = parse_metadata(&merged);
    assert_eq!(meta.sample_rate, 24_000);
    // Both halves are half a second after resampling.
    assert!((meta.duration_seconds - 1.0).abs() < 0.02);
}

#[test]
fn undecodable_segment_fails_the_join() {
    let good = tone(24_000, 0.25, 100);
    let bad = b"corrupt".to_vec();
    assert!(concatenate(&[good, bad]).is_err());
}

#[test]
fn empty_input_is_an_error() {
    assert!(concatenate(&[]).is_err());
}

#[test]
fn merge_files_removes_intermediates_on_success() {
    let dir = unique_dir("ok");
    let p1 = dir.join("chunk-0.wav");
    let p2 = dir.join("chunk-1.wav");
    std::fs::write(&p1, tone(24_000, 0.25, 100)).expect("write chunk 0");
    std::fs::write(&p2, tone(24_000, 0.25, 200)).expect("write chunk 1");

    let merged = merge_files(&[p1.clone(), p2.clone()]).expect("merge files");
    assert!(parse_metadata(&merged).duration_seconds > 0.4);
    assert!(!p1.exists(), "intermediate chunk files must be cleaned up");
    assert!(!p2.exists());
}

#[test]
fn merge_files_keeps_intermediates_on_failure() {
    let dir = unique_dir("fail");
    let p1 = dir.join("chunk-0.wav");
    let p2 = dir.join("chunk-1.wav");
    std::fs::write(&p1, tone(24_000, 0.25, 100)).expect("write chunk 0");
    std::fs::write(&p2, b"corrupt").expect("write chunk 1");

    assert!(merge_files(&[p1.clone(), p2.clone()]).is_err());
    assert!(p1.exists(), "failed joins must not delete inputs");
}
