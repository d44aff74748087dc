use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

mod http;

pub use http::HttpAsrClient;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct TranscriptionOption {
    pub endpoint: Option<String>,
    pub language: Option<String>,
    pub secret_key: Option<String>,
    pub timeout_ms: u64,
}

impl Default for TranscriptionOption {
    fn default() -> Self {
        Self {
            endpoint: None,
            language: None,
            secret_key: None,
            timeout_ms: 10_000,
        }
    }
}

impl TranscriptionOption {
    pub fn check_default(&mut self) -> &Self {
        if self.endpoint.is_none() {
            self.endpoint = std::env::var("VOICELOOP_ASR_ENDPOINT").ok();
        }
        if self.secret_key.is_none() {
            self.secret_key = std::env::var("ASR_API_KEY").ok();
        }
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Response shape of the transcription service: a failed or empty result is
/// data, not an error — the conversation just goes back to listening.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub success: bool,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub segments: Option<Vec<TranscriptSegment>>,
}

impl TranscriptionResult {
    pub fn is_empty(&self) -> bool {
        !self.success || self.text.trim().is_empty()
    }
}

/// Speech-to-text over a finalized audio blob (WAV container).
#[async_trait]
pub trait TranscriptionClient: Send + Sync {
    async fn transcribe(&self, audio: Vec<u8>) -> Result<TranscriptionResult>;
}
