//! Chunked synthesis coordinator.
//!
//! Makes synthesis of arbitrarily long text look like one atomic call:
//! splits the input at sentence boundaries, fans chunks out to a small
//! bounded pool against the supervisor, reassembles the audio strictly in
//! original chunk order, and writes one collision-free artifact file.
//!
//! The pool size is a small explicit cap, not derived from CPU count: the
//! bottleneck is one external process's throughput, not local compute.

use crate::chunk;
use crate::concat;
use crate::protocol::{DEFAULT_LANG_CODE, DEFAULT_VOICE};
use crate::wav;
use crate::{Result, SynthError};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Per-request synthesis parameters forwarded to the worker.
#[derive(Clone, Debug)]
pub struct SpeechOptions {
    pub speed: f32,
    pub lang_code: String,
    pub voice: String,
}

impl Default for SpeechOptions {
    fn default() -> Self {
        Self {
            speed: 1.0,
            lang_code: DEFAULT_LANG_CODE.to_string(),
            voice: DEFAULT_VOICE.to_string(),
        }
    }
}

/// One synthesized segment: WAV bytes plus the device the worker used.
#[derive(Clone, Debug)]
pub struct SpokenAudio {
    pub wav: Vec<u8>,
    pub device: Option<String>,
}

/// Seam between the coordinator and the worker supervisor; tests drive the
/// coordinator with in-process fakes through this trait.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, opts: &SpeechOptions) -> Result<SpokenAudio>;
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Texts longer than this are chunked.
    pub max_chunk_len: usize,
    /// Bounded chunk fan-out concurrency.
    pub pool_size: usize,
    /// Final and intermediate artifacts land here.
    pub output_dir: PathBuf,
    pub lang_code: String,
    pub voice: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let max_chunk_len = std::env::var("VERSE_MAX_CHUNK_LEN")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(400);
        let pool_size = std::env::var("VERSE_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(2);
        let output_dir = std::env::var("VERSE_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("verse-audio"));
        Self {
            max_chunk_len,
            pool_size,
            output_dir,
            lang_code: std::env::var("VERSE_LANG_CODE")
                .unwrap_or_else(|_| DEFAULT_LANG_CODE.to_string()),
            voice: std::env::var("VERSE_VOICE").unwrap_or_else(|_| DEFAULT_VOICE.to_string()),
        }
    }
}

/// What a completed synthesis call hands back to the HTTP layer.
#[derive(Clone, Debug)]
pub struct SynthesisResult {
    pub path: PathBuf,
    pub duration_seconds: f64,
    pub byte_length: u64,
    pub device: Option<String>,
}

pub struct SynthesisEngine {
    synth: Arc<dyn Synthesizer>,
    cfg: EngineConfig,
    /// Monotonic counter combined with a timestamp for collision-free names.
    artifact_seq: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SynthesisEngine {
    pub fn new(synth: Arc<dyn Synthesizer>, cfg: EngineConfig) -> Self {
        Self {
            synth,
            cfg,
            artifact_seq: AtomicU64::new(0),
        }
    }

    /// Synthesize `text` to a WAV artifact on disk.
    ///
    /// Short text is one supervisor call; long text is split, fanned out, and
    /// reassembled in input order. Input validation fails fast here and never
    /// touches the worker or its breaker.
    pub async fn generate(&self, text: &str, speed: f32) -> Result<SynthesisResult> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SynthError::EmptyText);
        }
        if !(speed.is_finite() && speed > 0.0) {
            return Err(SynthError::InvalidSpeed(speed));
        }

        let opts = SpeechOptions {
            speed,
            lang_code: self.cfg.lang_code.clone(),
            voice: self.cfg.voice.clone(),
        };

        let chunks = chunk::split_text(text, self.cfg.max_chunk_len);
        let audio = if chunks.len() <= 1 {
            self.synth.synthesize(text, &opts).await?
        } else {
            self.generate_chunked(chunks, &opts).await?
        };

        std::fs::create_dir_all(&self.cfg.output_dir)?;
        let path = self.artifact_path("speech");
        tokio::fs::write(&path, &audio.wav).await?;

        let meta = wav::parse_metadata(&audio.wav);
        info!(
            path = %path.display(),
            duration_s = meta.duration_seconds,
            bytes = audio.wav.len(),
            "synthesis artifact written"
        );
        Ok(SynthesisResult {
            path,
            duration_seconds: meta.duration_seconds,
            byte_length: audio.wav.len() as u64,
            device: audio.device,
        })
    }

    /// Fan chunks out to the pool and reassemble strictly by chunk index.
    /// The first unrecoverable chunk failure stops further claiming; partial
    /// results are discarded, never served as truncated audio.
    async fn generate_chunked(
        &self,
        chunks: Vec<String>,
        opts: &SpeechOptions,
    ) -> Result<SpokenAudio> {
        let total = chunks.len();
        info!(chunks = total, pool = self.cfg.pool_size, "running chunked synthesis");

        let queue: Arc<Mutex<VecDeque<(usize, String)>>> =
            Arc::new(Mutex::new(chunks.into_iter().enumerate().collect()));
        let results: Arc<Mutex<Vec<Option<Vec<u8>>>>> = Arc::new(Mutex::new(vec![None; total]));
        let failure: Arc<Mutex<Option<(usize, SynthError)>>> = Arc::new(Mutex::new(None));
        let device: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let mut pool = JoinSet::new();
        for _ in 0..self.cfg.pool_size.max(1).min(total) {
            let queue = Arc::clone(&queue);
            let results = Arc::clone(&results);
            let failure = Arc::clone(&failure);
            let device = Arc::clone(&device);
            let synth = Arc::clone(&self.synth);
            let opts = opts.clone();
            pool.spawn(async move {
                loop {
                    if lock(&failure).is_some() {
                        break;
                    }
                    let next = lock(&queue).pop_front();
                    let Some((index, text)) = next else { break };
                    match synth.synthesize(&text, &opts).await {
                        Ok(audio) => {
                            if audio.device.is_some() {
                                let mut d = lock(&device);
                                if d.is_none() {
                                    *d = audio.device;
                                }
                            }
                            lock(&results)[index] = Some(audio.wav);
                        }
                        Err(e) => {
                            let mut f = lock(&failure);
                            if f.is_none() {
                                *f = Some((index, e));
                            }
                            break;
                        }
                    }
                }
            });
        }
        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                return Err(SynthError::Audio(format!("chunk worker panicked: {e}")));
            }
        }

        if let Some((index, source)) = lock(&failure).take() {
            warn!(chunk = index, total, "chunked synthesis aborted");
            return Err(SynthError::ChunkFailed {
                index,
                source: Box::new(source),
            });
        }

        // Write per-chunk intermediates, merge in index order, clean up.
        std::fs::create_dir_all(&self.cfg.output_dir)?;
        let collected = std::mem::take(&mut *lock(&results));
        let mut paths = Vec::with_capacity(total);
        for (i, slot) in collected.into_iter().enumerate() {
            let bytes =
                slot.ok_or_else(|| SynthError::Audio(format!("chunk {i} has no result")))?;
            let path = self.artifact_path(&format!("chunk-{i}"));
            std::fs::write(&path, &bytes)?;
            paths.push(path);
        }
        let merged = concat::merge_files(&paths)?;
        let device = lock(&device).take();
        Ok(SpokenAudio {
            wav: merged,
            device,
        })
    }

    fn artifact_path(&self, prefix: &str) -> PathBuf {
        let seq = self.artifact_seq.fetch_add(1, Ordering::SeqCst);
        let stamp = Utc::now().format("%Y%m%d%H%M%S%3f");
        self.cfg.output_dir.join(format!("{prefix}-{stamp}-{seq:04}.wav"))
    }
}
