use super::{VADOption, VadBackend, VadContext, VadEmitter, VadStatus, VadType};
use crate::Samples;
use crate::media::analysis::SpectrumAnalyzer;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Voice-band energy detector. A frame is speech only when the 85-3000 Hz
/// band both dominates the spectrum (ratio) and carries real energy
/// (absolute floor). Start and end use asymmetric hysteresis so the state
/// does not chatter at utterance boundaries.
pub struct SpectralVad {
    option: VADOption,
    ctx: VadContext,
    emitter: Arc<VadEmitter>,
    status: Arc<parking_lot::Mutex<VadStatus>>,
    token: parking_lot::Mutex<Option<CancellationToken>>,
}

impl SpectralVad {
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
impl VadBackend for SpectralVad {
    fn vad_type(&self) -> VadType {
        VadType::Spectral
    }

    async fn start(&self) -> Result<()> {
        if self.token.lock().is_some() {
            return Err(anyhow!("spectral vad already started"));
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
        let opt = self.option.spectral.clone();
        let sample_rate = stream.sample_rate();
        tokio::spawn(async move {
            let mut analyzer = SpectrumAnalyzer::new(opt.fft_size, sample_rate);
            let mut positive = 0u32;
            let mut negative = 0u32;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    frame = stream.recv() => {
                        let Some(frame) = frame else { break };
                        let Samples::PCM { samples } = frame.samples else { continue };
                        let metrics =
                            analyzer.band_metrics(&samples, opt.band_lo_hz, opt.band_hi_hz);
                        let is_speech = metrics.ratio >= opt.ratio_threshold
                            && metrics.band_avg >= opt.energy_floor;
                        if is_speech {
                            positive += 1;
                            negative = 0;
                            if positive >= opt.speech_frames {
                                emitter.speech_start();
                            }
                        } else {
                            negative += 1;
                            positive = 0;
                            if negative >= opt.silence_frames {
                                emitter.speech_end();
                            }
                        }
                    }
                }
            }
            debug!("spectral vad loop exited");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PcmBuf;
    use crate::event::create_event_channel;
    use crate::media::source::ChannelSource;
    use crate::media::vad::{VadEvent, create_vad_event_channel};

    fn voice_frame(len: usize) -> PcmBuf {
        (0..len)
            .map(|i| {
                let t = i as f32 / 16000.0;
                ((2.0 * std::f32::consts::PI * 440.0 * t).sin() * 26000.0) as i16
            })
            .collect()
    }

    fn hiss_frame(len: usize) -> PcmBuf {
        (0..len)
            .map(|i| {
                let t = i as f32 / 16000.0;
                ((2.0 * std::f32::consts::PI * 6000.0 * t).sin() * 26000.0) as i16
            })
            .collect()
    }

    fn setup() -> (
        Box<dyn VadBackend>,
        Arc<ChannelSource>,
        crate::media::vad::VadEventReceiver,
    ) {
        let source = ChannelSource::new(16000);
        let (tx, rx) = create_vad_event_channel();
        let ctx = VadContext {
            source: source.clone(),
            events: tx,
            session_events: create_event_channel(),
        };
        let option = VADOption {
            r#type: VadType::Spectral,
            ignore_window_ms: 0,
            ..Default::default()
        };
        (SpectralVad::create(option, ctx).unwrap(), source, rx)
    }

    #[tokio::test]
    async fn test_voice_band_tone_triggers_speech() {
        let (vad, source, mut rx) = setup();
        vad.start().await.unwrap();
        for _ in 0..3 {
            source.push(voice_frame(512));
        }
        assert_eq!(rx.recv().await.unwrap(), VadEvent::SpeechStart);
        vad.stop().await;
    }

    #[tokio::test]
    async fn test_out_of_band_tone_never_triggers() {
        let (vad, source, mut rx) = setup();
        vad.start().await.unwrap();
        for _ in 0..10 {
            source.push(hiss_frame(512));
        }
        tokio::task::yield_now().await;
        vad.stop().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_asymmetric_hysteresis_ends_after_silence_frames() {
        let (vad, source, mut rx) = setup();
        vad.start().await.unwrap();
        for _ in 0..3 {
            source.push(voice_frame(512));
        }
        // Fewer than silence_frames quiet frames: still speaking.
        for _ in 0..5 {
            source.push(vec![0; 512]);
        }
        for _ in 0..2 {
            source.push(voice_frame(512));
        }
        for _ in 0..10 {
            source.push(vec![0; 512]);
        }
        assert_eq!(rx.recv().await.unwrap(), VadEvent::SpeechStart);
        assert_eq!(rx.recv().await.unwrap(), VadEvent::SpeechEnd);
        assert!(rx.try_recv().is_err());
        vad.stop().await;
    }
}
