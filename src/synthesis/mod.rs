use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

mod http;

pub use http::HttpTtsClient;

fn default_voice() -> String {
    "alex".to_string()
}
fn default_speed() -> f32 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct SynthesisOption {
    pub endpoint: Option<String>,
    pub voice: String,
    /// Cloned-voice id; takes precedence over `voice` on the server side.
    pub custom_voice_id: Option<String>,
    pub speed: f32,
    pub secret_key: Option<String>,
    /// Assumed rate when the service returns headerless PCM.
    pub output_sample_rate: u32,
    pub timeout_ms: u64,
}

impl Default for SynthesisOption {
    fn default() -> Self {
        Self {
            endpoint: None,
            voice: default_voice(),
            custom_voice_id: None,
            speed: default_speed(),
            secret_key: None,
            output_sample_rate: 16000,
            timeout_ms: 15_000,
        }
    }
}

impl SynthesisOption {
    pub fn check_default(&mut self) -> &Self {
        if self.endpoint.is_none() {
            self.endpoint = std::env::var("VOICELOOP_TTS_ENDPOINT").ok();
        }
        if self.secret_key.is_none() {
            self.secret_key = std::env::var("TTS_API_KEY").ok();
        }
        self
    }
}

/// One-shot speech synthesis: text in, raw audio bytes out, decoded by the
/// caller. Pipelining across sentences lives in the TTS player, not here.
#[async_trait]
pub trait SynthesisClient: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;
}
