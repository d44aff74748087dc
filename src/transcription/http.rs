use super::{TranscriptionClient, TranscriptionOption, TranscriptionResult};
use crate::get_timestamp;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use std::time::Duration;
use tracing::{debug, error};

/// REST transcription client: multipart POST of the audio blob.
pub struct HttpAsrClient {
    option: TranscriptionOption,
    client: reqwest::Client,
}

impl HttpAsrClient {
    pub fn new(mut option: TranscriptionOption) -> Self {
        option.check_default();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(option.timeout_ms))
            .build()
            .unwrap_or_default();
        Self { option, client }
    }
}

#[async_trait]
impl TranscriptionClient for HttpAsrClient {
    async fn transcribe(&self, audio: Vec<u8>) -> Result<TranscriptionResult> {
        let endpoint = self
            .option
            .endpoint
            .as_deref()
            .ok_or_else(|| anyhow!("no transcription endpoint configured"))?;
        let begin = get_timestamp();

        let part = Part::bytes(audio)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;
        let mut form = Form::new().part("file", part);
        if let Some(language) = &self.option.language {
            form = form.text("language", language.clone());
        }

        let mut request = self.client.post(endpoint).multipart(form);
        if let Some(key) = &self.option.secret_key {
            request = request.bearer_auth(key);
        }
        let resp = request.send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let msg = format!("transcription error ({}): {}", status, body);
            error!("{}", msg);
            return Err(anyhow!(msg));
        }

        let result = resp.json::<TranscriptionResult>().await?;
        debug!(
            text = %result.text,
            success = result.success,
            elapsed_ms = get_timestamp().saturating_sub(begin),
            "transcription completed"
        );
        Ok(result)
    }
}
