// Verse Core Library
// Local speech-synthesis orchestration: worker supervision, chunked generation, audio assembly

pub mod breaker;
pub mod chunk;
pub mod concat;
pub mod engine;
pub mod protocol;
pub mod runtime;
pub mod wav;
pub mod worker;

// Export core types
pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use engine::{EngineConfig, SpeechOptions, SpokenAudio, SynthesisEngine, SynthesisResult, Synthesizer};
pub use runtime::{DevicePreference, WorkerRuntime};
pub use wav::AudioMetadata;
pub use worker::{WorkerConfig, WorkerSupervisor};

// Error types
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SynthError {
    #[error("text must not be empty")]
    EmptyText,

    #[error("speed must be a positive finite number, got {0}")]
    InvalidSpeed(f32),

    #[error("synthesis worker unavailable, retry in {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    #[error("synthesis service degraded: exhausted {attempts} worker restart attempts")]
    RecoveryExhausted { attempts: u32 },

    #[error("request {request_id} timed out after {waited:?}")]
    Timeout { request_id: u64, waited: Duration },

    #[error("worker reported failure: {0}")]
    Worker(String),

    #[error("worker process exited: {0}")]
    WorkerExited(String),

    #[error("worker startup failed: {0}")]
    Startup(String),

    #[error("chunk {index} failed: {source}")]
    ChunkFailed {
        index: usize,
        #[source]
        source: Box<SynthError>,
    },

    #[error("audio error: {0}")]
    Audio(String),

    #[error("worker runtime error: {0}")]
    Runtime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SynthError {
    /// Whether a caller may reasonably retry the call later.
    ///
    /// Worker-health failures (crashes, timeouts, open breaker) are retryable;
    /// caller errors (empty text, bad speed) and terminal degradation are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            SynthError::CircuitOpen { .. }
            | SynthError::Timeout { .. }
            | SynthError::Worker(_)
            | SynthError::WorkerExited(_)
            | SynthError::Startup(_) => true,
            SynthError::ChunkFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SynthError>;
