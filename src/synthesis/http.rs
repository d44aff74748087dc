use super::{SynthesisClient, SynthesisOption};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use tracing::{debug, error};

/// REST synthesis client, one request per sentence fragment.
pub struct HttpTtsClient {
    option: SynthesisOption,
    client: reqwest::Client,
}

impl HttpTtsClient {
    pub fn new(mut option: SynthesisOption) -> Self {
        option.check_default();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(option.timeout_ms))
            .build()
            .unwrap_or_default();
        Self { option, client }
    }
}

#[async_trait]
impl SynthesisClient for HttpTtsClient {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let endpoint = self
            .option
            .endpoint
            .as_deref()
            .ok_or_else(|| anyhow!("no synthesis endpoint configured"))?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let mut body = serde_json::json!({
            "text": text,
            "voice": self.option.voice,
            "speed": self.option.speed,
        });
        if let Some(custom) = &self.option.custom_voice_id {
            body["custom_voice_id"] = serde_json::Value::String(custom.clone());
        }

        let mut request = self
            .client
            .post(endpoint)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string());
        if let Some(key) = &self.option.secret_key {
            request = request.bearer_auth(key);
        }
        let resp = request.send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let msg = format!("synthesis error ({}): {}", status, body);
            error!("{}", msg);
            return Err(anyhow!(msg));
        }

        let bytes = resp.bytes().await?;
        debug!(text, bytes = bytes.len(), "synthesis completed");
        Ok(bytes.to_vec())
    }
}
