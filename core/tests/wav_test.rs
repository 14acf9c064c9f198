use verse_core::wav::{decode, encode_pcm16, parse_metadata};

fn one_second_mono(rate: u32) -> Vec<u8> {
    encode_pcm16(rate, &vec![100i16; rate as usize])
}

#[test]
fn parses_valid_pcm_wav() {
    let bytes = one_second_mono(24_000);
    let meta = parse_metadata(&bytes);
    assert_eq!(meta.sample_rate, 24_000);
    assert_eq!(meta.channels, 1);
    assert_eq!(meta.bits_per_sample, 16);
    assert!((meta.duration_seconds - 1.0).abs() < 1e-6);
}

#[test]
fn never_panics_on_arbitrary_bytes() {
    let cases: Vec<Vec<u8>> = vec![
        Vec::new(),
        vec![0u8; 3],
        vec![0xFF; 64],
        b"RIFF".to_vec(),
        b"RIFFxxxxWAVE".to_vec(),
        b"not audio at all, just text pretending".to_vec(),
        (0..=255u8).cycle().take(10_000).collect(),
    ];
    for bytes in cases {
        let meta = parse_metadata(&bytes);
        // Fallback estimates always use the assumed 16 kHz/mono/16-bit shape.
        assert_eq!(meta.sample_rate, 16_000);
        assert_eq!(meta.channels, 1);
        assert!(meta.duration_seconds.is_finite());
    }
}

#[test]
fn fallback_estimates_duration_from_byte_length() {
    // 32000 payload bytes at 16 kHz mono 16-bit is one second.
    let bytes = vec![0u8; 44 + 32_000];
    let meta = parse_metadata(&bytes);
    assert!((meta.duration_seconds - 1.0).abs() < 1e-6);
}

#[test]
fn truncated_header_falls_back() {
    let mut bytes = one_second_mono(16_000);
    bytes.truncate(20);
    let meta = parse_metadata(&bytes);
    assert_eq!(meta.sample_rate, 16_000);
}

#[test]
fn declared_data_beyond_buffer_falls_back() {
    let mut bytes = one_second_mono(24_000);
    // Patch the data chunk length (offset 40 in the standard 44-byte header)
    // to claim more bytes than are present.
    bytes[40..44].copy_from_slice(&u32::MAX.to_le_bytes());
    let meta = parse_metadata(&bytes);
    assert_eq!(meta.sample_rate, 16_000);
}

#[test]
fn compressed_encoding_falls_back() {
    let mut bytes = one_second_mono(24_000);
    // Patch the fmt audio-format field (offset 20) to IEEE float.
    bytes[20..22].copy_from_slice(&3u16.to_le_bytes());
    let meta = parse_metadata(&bytes);
    assert_eq!(meta.sample_rate, 16_000);
}

#[test]
fn out_of_range_sample_rate_falls_back() {
    let mut bytes = one_second_mono(24_000);
    // Patch sample rate (offset 24) to 96 kHz, outside the sane range.
    bytes[24..28].copy_from_slice(&96_000u32.to_le_bytes());
    let meta = parse_metadata(&bytes);
    assert_eq!(meta.sample_rate, 16_000);
}

#[test]
fn strict_decode_rejects_garbage_but_accepts_valid() {
    assert!(decode(b"definitely not wav").is_err());
    assert!(decode(&[]).is_err());

    let bytes = one_second_mono(16_000);
    let pcm = decode(&bytes).expect("valid wav must decode");
    assert_eq!(pcm.sample_rate, 16_000);
    assert_eq!(pcm.channels, 1);
    assert_eq!(pcm.data.len(), 32_000);
}

#[test]
fn encode_roundtrips_samples() {
    let samples: Vec<i16> = (0..1000).map(|i| (i * 7 % 3000) as i16 - 1500).collect();
    let bytes = encode_pcm16(24_000, &samples);
    let pcm = decode(&bytes).expect("roundtrip decode");
    let restored: Vec<i16> = pcm
        .data
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect();
    assert_eq!(restored, samples);
}
