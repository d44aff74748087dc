use super::{VadBackend, VadContext, VadEvent, VadEventReceiver, VadStatus, VadType};
use crate::event::SessionEvent;
use crate::media::codecs;
use crate::media::ring::SampleRing;
use crate::media::vad::socket::NEURAL_SAMPLE_RATE;
use crate::transcription::TranscriptionClient;
use crate::{Samples, get_timestamp};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

fn default_stop_words() -> Vec<String> {
    ["停", "停止", "等等", "等一下", "别说了", "闭嘴", "stop", "wait"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct KeywordGateOption {
    pub enabled: bool,
    pub assistant_name: String,
    pub aliases: Vec<String>,
    pub stop_words: Vec<String>,
    /// Raw audio kept ahead of the speech-start event, so words spoken just
    /// before it are part of the verification clip.
    pub buffer_ms: u64,
}

impl Default for KeywordGateOption {
    fn default() -> Self {
        Self {
            enabled: false,
            assistant_name: "小智".to_string(),
            aliases: Vec::new(),
            stop_words: default_stop_words(),
            buffer_ms: 3000,
        }
    }
}

impl KeywordGateOption {
    pub fn matches(&self, transcript: &str) -> bool {
        let transcript = transcript.to_lowercase();
        std::iter::once(&self.assistant_name)
            .chain(self.aliases.iter())
            .chain(self.stop_words.iter())
            .filter(|w| !w.trim().is_empty())
            .any(|w| transcript.contains(&w.to_lowercase()))
    }
}

/// Keyword-gated detection, used while the assistant is speaking: raw speech
/// starts are verified against the transcription service and only forwarded
/// when the clip contains an interrupt word, so ambient noise cannot stop
/// playback. Verification in flight is cancelled by `stop()`; a gate being
/// torn down (e.g. on backend switch) can never fire a late speech start.
pub struct KeywordGate {
    inner: Box<dyn VadBackend>,
    option: KeywordGateOption,
    asr: Arc<dyn TranscriptionClient>,
    ctx: VadContext,
    raw_events: parking_lot::Mutex<Option<VadEventReceiver>>,
    speaking: Arc<AtomicBool>,
    token: parking_lot::Mutex<Option<CancellationToken>>,
}

impl KeywordGate {
    /// `inner` must have been created with `raw_events`'s sender as its
    /// event channel; the gate consumes the raw events and re-emits the
    /// verified ones on `ctx.events`.
    pub fn new(
        inner: Box<dyn VadBackend>,
        raw_events: VadEventReceiver,
        option: KeywordGateOption,
        asr: Arc<dyn TranscriptionClient>,
        ctx: VadContext,
    ) -> Self {
        Self {
            inner,
            option,
            asr,
            ctx,
            raw_events: parking_lot::Mutex::new(Some(raw_events)),
            speaking: Arc::new(AtomicBool::new(false)),
            token: parking_lot::Mutex::new(None),
        }
    }
}

#[async_trait]
impl VadBackend for KeywordGate {
    fn vad_type(&self) -> VadType {
        self.inner.vad_type()
    }

    async fn start(&self) -> Result<()> {
        let Some(mut raw_events) = self.raw_events.lock().take() else {
            return Err(anyhow::anyhow!("keyword gate already started"));
        };
        let token = CancellationToken::new();
        *self.token.lock() = Some(token.clone());

        // The gate keeps its own microphone stream; the inner backend's
        // stream is its own and never shared.
        let mut stream = self.ctx.source.open().await?;
        let sample_rate = stream.sample_rate();
        let ring = Arc::new(parking_lot::Mutex::new(SampleRing::with_duration(
            self.option.buffer_ms,
            sample_rate,
        )));

        let ring_writer = ring.clone();
        let ring_token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ring_token.cancelled() => break,
                    frame = stream.recv() => {
                        let Some(frame) = frame else { break };
                        if let Samples::PCM { samples } = frame.samples {
                            ring_writer.lock().push_slice(&samples);
                        }
                    }
                }
            }
        });

        if let Err(e) = self.inner.start().await {
            token.cancel();
            *self.token.lock() = None;
            return Err(e);
        }

        let option = self.option.clone();
        let asr = self.asr.clone();
        let out = self.ctx.events.clone();
        let session_events = self.ctx.session_events.clone();
        let speaking = self.speaking.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = raw_events.recv() => event,
                };
                match event {
                    Some(VadEvent::SpeechStart) => {
                        let _ = session_events.send(SessionEvent::Status {
                            timestamp: get_timestamp(),
                            status: "verifying interrupt word".to_string(),
                        });
                        let clip = {
                            let mut ring = ring.lock();
                            let snapshot = ring.snapshot();
                            ring.clear();
                            snapshot
                        };
                        // Canonical mono 16-bit 16 kHz WAV for verification.
                        let clip = if sample_rate != NEURAL_SAMPLE_RATE {
                            match codecs::resample(&clip, sample_rate, NEURAL_SAMPLE_RATE) {
                                Ok(clip) => clip,
                                Err(e) => {
                                    warn!("keyword clip resample failed: {}", e);
                                    continue;
                                }
                            }
                        } else {
                            clip
                        };
                        let wav = match codecs::pcm_to_wav(&clip, NEURAL_SAMPLE_RATE) {
                            Ok(wav) => wav,
                            Err(e) => {
                                warn!("keyword clip encode failed: {}", e);
                                continue;
                            }
                        };
                        let result = tokio::select! {
                            _ = token.cancelled() => break,
                            result = asr.transcribe(wav) => result,
                        };
                        match result {
                            Ok(result) if !result.is_empty() && option.matches(&result.text) => {
                                info!(text = %result.text, "interrupt word verified");
                                speaking.store(true, Ordering::SeqCst);
                                let _ = out.send(VadEvent::SpeechStart);
                            }
                            Ok(result) => {
                                debug!(text = %result.text, "speech without interrupt word, ignored");
                            }
                            Err(e) => {
                                // Transient ASR failure: treat as "no match".
                                warn!("keyword verification failed: {}", e);
                            }
                        }
                    }
                    Some(VadEvent::SpeechEnd) => {
                        if speaking.swap(false, Ordering::SeqCst) {
                            let _ = out.send(VadEvent::SpeechEnd);
                        }
                    }
                    None => break,
                }
            }
            debug!("keyword gate loop exited");
        });
        Ok(())
    }

    async fn stop(&self) {
        if let Some(token) = self.token.lock().take() {
            token.cancel();
        }
        self.inner.stop().await;
        self.speaking.store(false, Ordering::SeqCst);
    }

    fn status(&self) -> VadStatus {
        self.inner.status()
    }

    fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }
}
