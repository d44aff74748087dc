use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct LlmOption {
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub assistant_name: Option<String>,
    pub secret_key: Option<String>,
}

impl Default for LlmOption {
    fn default() -> Self {
        Self {
            endpoint: None,
            model: None,
            temperature: None,
            max_tokens: None,
            assistant_name: None,
            secret_key: None,
        }
    }
}

impl LlmOption {
    pub fn check_default(&mut self) -> &Self {
        if self.endpoint.is_none() {
            self.endpoint = std::env::var("VOICELOOP_CHAT_ENDPOINT").ok();
        }
        if self.secret_key.is_none() {
            self.secret_key = std::env::var("CHAT_API_KEY").ok();
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub message: String,
    pub history: Vec<ChatMessage>,
}

/// Typed frames of the chat SSE stream. Unknown frame types are tolerated
/// so the protocol can grow without breaking older clients.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatFrame {
    Token {
        #[serde(default)]
        content: String,
    },
    SkillStart {
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: serde_json::Value,
        #[serde(default)]
        bgm: Option<String>,
    },
    SkillEnd {
        #[serde(default)]
        name: String,
        #[serde(default)]
        output: String,
    },
    Music {
        #[serde(default)]
        action: String,
        #[serde(default)]
        song: Option<serde_json::Value>,
    },
    Error {
        #[serde(default)]
        message: String,
    },
    Done,
    #[serde(other)]
    Other,
}

/// Streaming chat client. The stream ends on the server's `done` frame, on
/// transport EOF, or when the cancellation token fires (barge-in abort).
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn chat_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, Result<ChatFrame>>>;
}

/// Incremental server-sent-events splitter. Feed raw chunks, get back the
/// `data:` payloads of every completed event.
#[derive(Default)]
pub struct SseParser {
    buf: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buf.push_str(chunk);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buf.find("\n\n") {
            let event: String = self.buf.drain(..pos + 2).collect();
            for line in event.lines() {
                if let Some(data) = line.strip_prefix("data:") {
                    payloads.push(data.trim_start().to_string());
                }
            }
        }
        payloads
    }
}

pub struct HttpChatClient {
    option: LlmOption,
    client: reqwest::Client,
}

impl HttpChatClient {
    pub fn new(mut option: LlmOption) -> Self {
        option.check_default();
        Self {
            option,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn chat_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, Result<ChatFrame>>> {
        let endpoint = self
            .option
            .endpoint
            .clone()
            .ok_or_else(|| anyhow!("no chat endpoint configured"))?;

        let mut body = serde_json::json!({
            "message": request.message,
            "history": request.history,
        });
        if let Some(model) = &self.option.model {
            body["model"] = serde_json::Value::String(model.clone());
        }
        if let Some(temperature) = self.option.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(max_tokens) = self.option.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if let Some(name) = &self.option.assistant_name {
            body["assistant_name"] = serde_json::Value::String(name.clone());
        }

        let mut req = self.client.post(&endpoint).json(&body);
        if let Some(key) = &self.option.secret_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("chat error ({}): {}", status, body));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut parser = SseParser::new();
            let mut bytes = resp.bytes_stream();
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("chat stream aborted");
                        break;
                    }
                    chunk = bytes.next() => chunk,
                };
                let Some(chunk) = chunk else { break };
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(anyhow!("chat stream error: {}", e)));
                        break;
                    }
                };
                let text = String::from_utf8_lossy(&chunk);
                let mut finished = false;
                for payload in parser.push(&text) {
                    match serde_json::from_str::<ChatFrame>(&payload) {
                        Ok(ChatFrame::Done) => {
                            finished = true;
                            break;
                        }
                        Ok(frame) => {
                            if tx.send(Ok(frame)).is_err() {
                                finished = true;
                                break;
                            }
                        }
                        Err(e) => {
                            // Malformed frame: drop it, keep the stream.
                            warn!("malformed chat frame: {} ({})", payload, e);
                        }
                    }
                }
                if finished {
                    break;
                }
            }
        });
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_parser_handles_split_events() {
        let mut parser = SseParser::new();
        assert!(parser.push("data: {\"type\":\"tok").is_empty());
        let payloads = parser.push("en\",\"content\":\"hi\"}\n\ndata: {\"type\":\"done\"}\n\n");
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0], "{\"type\":\"token\",\"content\":\"hi\"}");
    }

    #[test]
    fn test_chat_frame_variants() {
        let frame: ChatFrame = serde_json::from_str(r#"{"type":"token","content":"你好"}"#).unwrap();
        assert_eq!(
            frame,
            ChatFrame::Token {
                content: "你好".to_string()
            }
        );
        let frame: ChatFrame =
            serde_json::from_str(r#"{"type":"skill_start","name":"tell_story","input":{}}"#)
                .unwrap();
        assert!(matches!(frame, ChatFrame::SkillStart { .. }));
        let frame: ChatFrame = serde_json::from_str(r#"{"type":"done"}"#).unwrap();
        assert_eq!(frame, ChatFrame::Done);
        // Unknown frame types map to Other instead of failing the stream.
        let frame: ChatFrame = serde_json::from_str(r#"{"type":"telemetry"}"#).unwrap();
        assert_eq!(frame, ChatFrame::Other);
    }

    #[test]
    fn test_malformed_frame_is_droppable() {
        assert!(serde_json::from_str::<ChatFrame>("{not json").is_err());
    }
}
