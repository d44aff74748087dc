use super::{VADOption, VadBackend, VadContext, VadEmitter, VadStatus, VadType};
use crate::media::codecs;
use crate::{PcmBuf, Samples};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::{Duration, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const NEURAL_SAMPLE_RATE: u32 = 16000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeuralVariant {
    /// Model runs next to the client; startup time is dominated by the model
    /// asset being prepared, surfaced as `Loading`.
    Local,
    /// Remote model server; startup time is the socket handshake, surfaced
    /// as `Connecting`.
    Server,
}

impl NeuralVariant {
    fn warmup_status(&self) -> VadStatus {
        match self {
            NeuralVariant::Local => VadStatus::Loading,
            NeuralVariant::Server => VadStatus::Connecting,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VadSocketError {
    #[error("no vad socket endpoint configured")]
    MissingEndpoint,
    #[error("connect timeout after {0:?}")]
    ConnectTimeout(Duration),
    #[error("websocket handshake failed: {0}")]
    Handshake(String),
}

#[derive(Debug, Serialize)]
struct SocketConfigFrame<'a> {
    mode: &'a str,
    chunk_size: usize,
    wav_format: &'a str,
    is_speaking: bool,
}

/// Reply frames are loose JSON: non-empty `text` means speech in progress,
/// `is_final` (or text dropping back to empty) means speech ended.
#[derive(Debug, Default, Deserialize)]
struct SocketReply {
    #[serde(default)]
    text: String,
    #[serde(default)]
    is_final: bool,
}

/// Neural detector over a WebSocket: streams little-endian 16-bit PCM at
/// 16 kHz mono and turns the server's discrete frames into speech events.
pub struct NeuralVad {
    variant: NeuralVariant,
    option: VADOption,
    ctx: VadContext,
    emitter: Arc<VadEmitter>,
    status: Arc<parking_lot::Mutex<VadStatus>>,
    token: parking_lot::Mutex<Option<CancellationToken>>,
}

impl NeuralVad {
    pub fn create_local(option: VADOption, ctx: VadContext) -> Result<Box<dyn VadBackend>> {
        Self::create(NeuralVariant::Local, option, ctx)
    }

    pub fn create_server(option: VADOption, ctx: VadContext) -> Result<Box<dyn VadBackend>> {
        Self::create(NeuralVariant::Server, option, ctx)
    }

    fn create(
        variant: NeuralVariant,
        option: VADOption,
        ctx: VadContext,
    ) -> Result<Box<dyn VadBackend>> {
        let emitter = Arc::new(VadEmitter::new(ctx.events.clone(), option.ignore_window_ms));
        Ok(Box::new(Self {
            variant,
            option,
            ctx,
            emitter,
            status: Arc::new(parking_lot::Mutex::new(VadStatus::Idle)),
            token: parking_lot::Mutex::new(None),
        }))
    }
}

#[async_trait]
impl VadBackend for NeuralVad {
    fn vad_type(&self) -> VadType {
        match self.variant {
            NeuralVariant::Local => VadType::NeuralLocal,
            NeuralVariant::Server => VadType::NeuralServer,
        }
    }

    async fn start(&self) -> Result<()> {
        if self.token.lock().is_some() {
            return Err(anyhow!("neural vad already started"));
        }
        let endpoint = self
            .option
            .socket
            .endpoint
            .clone()
            .ok_or(VadSocketError::MissingEndpoint)?;

        *self.status.lock() = self.variant.warmup_status();
        let connect_timeout = Duration::from_millis(self.option.socket.connect_timeout_ms);
        let connected = timeout(connect_timeout, connect_async(endpoint.as_str()))
            .await
            .map_err(|_| {
                *self.status.lock() =
                    VadStatus::Error(VadSocketError::ConnectTimeout(connect_timeout).to_string());
                VadSocketError::ConnectTimeout(connect_timeout)
            })?;
        let (mut ws, response) = connected.map_err(|e| {
            let err = VadSocketError::Handshake(e.to_string());
            *self.status.lock() = VadStatus::Error(err.to_string());
            err
        })?;
        debug!(%endpoint, status = %response.status(), "vad socket connected");

        let config = SocketConfigFrame {
            mode: &self.option.socket.mode,
            chunk_size: self.option.socket.chunk_size,
            wav_format: "pcm",
            is_speaking: true,
        };
        ws.send(Message::Text(serde_json::to_string(&config)?.into()))
            .await
            .map_err(|e| anyhow!("failed to send vad config: {}", e))?;

        let mut stream = self.ctx.source.open().await.map_err(|e| {
            *self.status.lock() = VadStatus::Error(e.to_string());
            e
        })?;
        *self.status.lock() = VadStatus::Active;
        self.emitter.mark_started();

        let token = CancellationToken::new();
        *self.token.lock() = Some(token.clone());
        let (mut ws_sender, mut ws_receiver) = ws.split();

        // Sender task: mic frames out, resampled to the protocol rate and
        // framed at chunk_size samples.
        let sender_token = token.clone();
        let chunk_size = self.option.socket.chunk_size.max(1);
        tokio::spawn(async move {
            let mut pending = PcmBuf::new();
            loop {
                tokio::select! {
                    _ = sender_token.cancelled() => break,
                    frame = stream.recv() => {
                        let Some(frame) = frame else { break };
                        let Samples::PCM { samples } = frame.samples else { continue };
                        let samples = if frame.sample_rate != NEURAL_SAMPLE_RATE {
                            match codecs::resample(&samples, frame.sample_rate, NEURAL_SAMPLE_RATE) {
                                Ok(samples) => samples,
                                Err(e) => {
                                    warn!("vad resample failed: {}", e);
                                    continue;
                                }
                            }
                        } else {
                            samples
                        };
                        pending.extend_from_slice(&samples);
                        while pending.len() >= chunk_size {
                            let chunk: PcmBuf = pending.drain(..chunk_size).collect();
                            let bytes = codecs::samples_to_bytes(&chunk);
                            if ws_sender.send(Message::Binary(bytes.into())).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            let goodbye = serde_json::json!({"is_speaking": false});
            let _ = ws_sender
                .send(Message::Text(goodbye.to_string().into()))
                .await;
            let _ = ws_sender.close().await;
        });

        // Receiver task: server frames in, mapped onto speech events.
        let receiver_token = token.clone();
        let emitter = self.emitter.clone();
        let status = self.status.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = receiver_token.cancelled() => break,
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<SocketReply>(&text) {
                                    Ok(reply) => {
                                        if reply.is_final || reply.text.is_empty() {
                                            emitter.speech_end();
                                        } else {
                                            emitter.speech_start();
                                        }
                                    }
                                    Err(e) => {
                                        // Malformed frames are dropped, the
                                        // stream keeps going.
                                        warn!("malformed vad frame: {} ({})", text, e);
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("vad socket closed");
                                *status.lock() = VadStatus::Idle;
                                break;
                            }
                            Some(Err(e)) => {
                                warn!("vad socket error: {}", e);
                                *status.lock() = VadStatus::Error(e.to_string());
                                break;
                            }
                            _ => {}
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn stop(&self) {
        if let Some(token) = self.token.lock().take() {
            token.cancel();
        }
        *self.status.lock() = VadStatus::Idle;
        self.emitter.reset();
    }

    fn status(&self) -> VadStatus {
        self.status.lock().clone()
    }

    fn is_speaking(&self) -> bool {
        self.emitter.is_speaking()
    }
}
