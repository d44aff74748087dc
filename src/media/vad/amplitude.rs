use super::{VADOption, VadBackend, VadContext, VadEmitter, VadStatus, VadType};
use crate::Samples;
use crate::media::analysis::SpectrumAnalyzer;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Mean-FFT-magnitude detector: `trigger_count` consecutive frames above the
/// threshold confirm speech, `release_count` quiet frames end it. The
/// consecutive-frame debounce filters transient noise spikes.
pub struct AmplitudeVad {
    option: VADOption,
    ctx: VadContext,
    emitter: Arc<VadEmitter>,
    status: Arc<parking_lot::Mutex<VadStatus>>,
    token: parking_lot::Mutex<Option<CancellationToken>>,
}

impl AmplitudeVad {
    pub fn create(option: VADOption, ctx: VadContext) -> Result<Box<dyn VadBackend>> {
        let emitter = Arc::new(VadEmitter::new(ctx.events.clone(), option.ignore_window_ms));
        Ok(Box::new(Self {
            option,
            ctx,
            emitter,
            status: Arc::new(parking_lot::Mutex::new(VadStatus::Idle)),
            token: parking_lot::Mutex::new(None),
        }))
    }
}

#[async_trait]
impl VadBackend for AmplitudeVad {
    fn vad_type(&self) -> VadType {
        VadType::Amplitude
    }

    async fn start(&self) -> Result<()> {
        if self.token.lock().is_some() {
            return Err(anyhow!("amplitude vad already started"));
        }
        let mut stream = self.ctx.source.open().await.map_err(|e| {
            *self.status.lock() = VadStatus::Error(e.to_string());
            e
        })?;
        let token = CancellationToken::new();
        *self.token.lock() = Some(token.clone());
        *self.status.lock() = VadStatus::Active;
        self.emitter.mark_started();

        let emitter = self.emitter.clone();
        let opt = self.option.amplitude.clone();
        let sample_rate = stream.sample_rate();
        tokio::spawn(async move {
            let mut analyzer = SpectrumAnalyzer::new(opt.fft_size, sample_rate);
            let mut above = 0u32;
            let mut below = 0u32;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    frame = stream.recv() => {
                        let Some(frame) = frame else { break };
                        let Samples::PCM { samples } = frame.samples else { continue };
                        let level = analyzer.audio_level(&samples);
                        if level >= opt.threshold {
                            above += 1;
                            below = 0;
                            if above >= opt.trigger_count {
                                emitter.speech_start();
                            }
                        } else {
                            below += 1;
                            above = 0;
                            if below >= opt.release_count {
                                emitter.speech_end();
                            }
                        }
                    }
                }
            }
            debug!("amplitude vad loop exited");
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
