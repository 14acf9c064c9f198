//! Line-delimited JSON wire protocol spoken with the worker process.
//!
//! One JSON object per line in each direction:
//! - outbound: `{"request_id": 7, "text": "...", "speed": 1.0, "lang_code": "a", "voice": "af_heart"}`
//! - inbound:  `{"request_id": 7, "success": true, "audio_data": "<hex>", "device": "mps"}`
//!
//! `request_id` is always sent, but the worker is not required to echo it:
//! older wrappers answer strictly in FIFO order with no id field, so the
//! supervisor keeps a FIFO fallback for correlation.
//!
//! The audio payload is hex-encoded WAV bytes (the worker returns
//! `bytes.hex()`).

use crate::{Result, SynthError};
use serde::{Deserialize, Serialize};

pub const DEFAULT_LANG_CODE: &str = "a";
pub const DEFAULT_VOICE: &str = "af_heart";

#[derive(Debug, Clone, Serialize)]
pub struct WireRequest {
    pub request_id: u64,
    pub text: String,
    pub speed: f32,
    pub lang_code: String,
    pub voice: String,
}

impl WireRequest {
    /// Serialize as a single newline-terminated line.
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireResponse {
    #[serde(default)]
    pub request_id: Option<u64>,
    pub success: bool,
    #[serde(default)]
    pub audio_data: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
}

impl WireResponse {
    pub fn parse(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }

    /// Decode the hex audio payload. An absent or empty payload on a
    /// successful response is a worker failure, not a success.
    pub fn decode_audio(&self) -> Result<Vec<u8>> {
        let encoded = self
            .audio_data
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SynthError::Worker("empty audio payload".into()))?;
        let bytes = hex::decode(encoded)
            .map_err(|e| SynthError::Worker(format!("undecodable audio payload: {e}")))?;
        if bytes.is_empty() {
            return Err(SynthError::Worker("empty audio payload".into()));
        }
        Ok(bytes)
    }

    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "worker reported failure without detail".to_string())
    }
}
