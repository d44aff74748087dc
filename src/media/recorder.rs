use crate::event::{CallEvent, CallEventSender, EventSender, SessionEvent};
use crate::media::analysis::SpectrumAnalyzer;
use crate::media::codecs;
use crate::media::source::AudioSource;
use crate::{PcmBuf, Samples, get_timestamp};
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

fn default_silence_threshold() -> u8 {
    10
}
fn default_silence_duration_ms() -> u64 {
    1500
}
fn default_max_duration_ms() -> u64 {
    60_000
}
fn default_fft_size() -> usize {
    512
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecorderOption {
    /// AudioLevel (0..=255) at or below which a frame counts as silent.
    pub silence_threshold: u8,
    /// Uninterrupted at-or-below-threshold time that ends the utterance.
    pub silence_duration_ms: u64,
    /// Hard cap on one recording; reaching it behaves like silence.
    pub max_duration_ms: u64,
    pub fft_size: usize,
}

impl Default for RecorderOption {
    fn default() -> Self {
        Self {
            silence_threshold: default_silence_threshold(),
            silence_duration_ms: default_silence_duration_ms(),
            max_duration_ms: default_max_duration_ms(),
            fft_size: default_fft_size(),
        }
    }
}

struct ActiveRecording {
    token: CancellationToken,
    handle: JoinHandle<(PcmBuf, u32)>,
}

/// Captures one utterance from its own microphone stream, publishing the
/// per-frame AudioLevel and raising `SilenceDetected` via the two-phase
/// silence algorithm: nothing fires until the speaker has exceeded the
/// threshold at least once, and afterwards only an uninterrupted run of
/// quiet frames fires, exactly once per recording.
pub struct AudioRecorder {
    option: RecorderOption,
    source: Arc<dyn AudioSource>,
    events: CallEventSender,
    session_events: EventSender,
    active: Mutex<Option<ActiveRecording>>,
    recording: AtomicBool,
}

impl AudioRecorder {
    pub fn new(
        option: RecorderOption,
        source: Arc<dyn AudioSource>,
        events: CallEventSender,
        session_events: EventSender,
    ) -> Self {
        Self {
            option,
            source,
            events,
            session_events,
            active: Mutex::new(None),
            recording: AtomicBool::new(false),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    pub async fn start_recording(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(anyhow!("recorder already running"));
        }
        let mut stream = self.source.open().await?;
        let sample_rate = stream.sample_rate();
        let token = CancellationToken::new();
        let task_token = token.clone();
        let option = self.option.clone();
        let events = self.events.clone();
        let session_events = self.session_events.clone();

        let handle = tokio::spawn(async move {
            let mut analyzer = SpectrumAnalyzer::new(option.fft_size, sample_rate);
            let mut buffer = PcmBuf::new();
            let mut has_spoken = false;
            let mut silent_ms = 0u64;
            let mut total_ms = 0u64;
            let mut fired = false;

            let mut process = |frame: crate::AudioFrame,
                               buffer: &mut PcmBuf,
                               analyzer: &mut SpectrumAnalyzer| {
                let Samples::PCM { samples } = frame.samples else {
                    return;
                };
                let frame_ms = if sample_rate > 0 {
                    (samples.len() as u64 * 1000) / sample_rate as u64
                } else {
                    0
                };
                let level = analyzer.audio_level(&samples);
                buffer.extend_from_slice(&samples);
                let _ = session_events.send(SessionEvent::AudioLevel {
                    timestamp: get_timestamp(),
                    level,
                });
                total_ms += frame_ms;
                if level > option.silence_threshold {
                    has_spoken = true;
                    silent_ms = 0;
                } else if has_spoken && !fired {
                    silent_ms += frame_ms;
                    if silent_ms >= option.silence_duration_ms {
                        fired = true;
                        debug!(silent_ms, "recorder silence detected");
                        let _ = events.send(CallEvent::SilenceDetected);
                    }
                }
                if total_ms >= option.max_duration_ms && !fired {
                    fired = true;
                    warn!(total_ms, "recording hit max duration");
                    let _ = events.send(CallEvent::SilenceDetected);
                }
            };

            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    frame = stream.recv() => {
                        match frame {
                            Some(frame) => process(frame, &mut buffer, &mut analyzer),
                            None => break,
                        }
                    }
                }
            }
            // Finalize whatever the source already produced before the stop.
            while let Some(frame) = stream.try_recv() {
                process(frame, &mut buffer, &mut analyzer);
            }
            (buffer, sample_rate)
        });

        *active = Some(ActiveRecording { token, handle });
        self.recording.store(true, Ordering::SeqCst);
        debug!("recording started");
        Ok(())
    }

    /// Finalize the recording into a WAV blob and release the stream.
    pub async fn stop_recording(&self) -> Result<Vec<u8>> {
        let recording = {
            let mut active = self.active.lock().await;
            active.take().ok_or_else(|| anyhow!("recorder not running"))?
        };
        self.recording.store(false, Ordering::SeqCst);
        recording.token.cancel();
        let (buffer, sample_rate) = recording
            .handle
            .await
            .map_err(|e| anyhow!("recording task failed: {}", e))?;
        debug!(samples = buffer.len(), sample_rate, "recording stopped");
        codecs::pcm_to_wav(&buffer, sample_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{create_call_event_channel, create_event_channel};
    use crate::media::source::ChannelSource;

    fn loud_frame(len: usize) -> PcmBuf {
        (0..len)
            .map(|i| if i % 2 == 0 { 26000 } else { -26000 })
            .collect()
    }

    fn recorder_with_source() -> (
        AudioRecorder,
        Arc<ChannelSource>,
        crate::event::CallEventReceiver,
    ) {
        let source = ChannelSource::new(16000);
        let (events_tx, events_rx) = create_call_event_channel();
        let session_events = create_event_channel();
        let option = RecorderOption {
            silence_threshold: 10,
            silence_duration_ms: 200,
            ..Default::default()
        };
        (
            AudioRecorder::new(option, source.clone(), events_tx, session_events),
            source,
            events_rx,
        )
    }

    #[tokio::test]
    async fn test_quiet_input_never_fires_silence() {
        let (recorder, source, mut events) = recorder_with_source();
        recorder.start_recording().await.unwrap();
        // 40 quiet frames = 800 ms, well past the 200 ms silence window.
        for _ in 0..40 {
            source.push(vec![0; 320]);
        }
        let wav = recorder.stop_recording().await.unwrap();
        assert!(wav.len() > 44);
        assert!(events.try_recv().is_err(), "no silence event expected");
    }

    #[tokio::test]
    async fn test_silence_fires_exactly_once_after_speech() {
        let (recorder, source, mut events) = recorder_with_source();
        recorder.start_recording().await.unwrap();
        for _ in 0..3 {
            source.push(loud_frame(320));
        }
        // 30 quiet frames = 600 ms >= 200 ms window.
        for _ in 0..30 {
            source.push(vec![0; 320]);
        }
        recorder.stop_recording().await.unwrap();
        assert_eq!(events.try_recv().unwrap(), CallEvent::SilenceDetected);
        assert!(events.try_recv().is_err(), "silence must fire only once");
    }

    #[tokio::test]
    async fn test_loud_frame_resets_silence_timer() {
        let (recorder, source, mut events) = recorder_with_source();
        recorder.start_recording().await.unwrap();
        source.push(loud_frame(320));
        // 5 quiet frames (100 ms) never reach the 200 ms window because a
        // loud frame resets the timer in between.
        for _ in 0..5 {
            source.push(vec![0; 320]);
        }
        source.push(loud_frame(320));
        for _ in 0..5 {
            source.push(vec![0; 320]);
        }
        recorder.stop_recording().await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (recorder, _source, _events) = recorder_with_source();
        recorder.start_recording().await.unwrap();
        assert!(recorder.start_recording().await.is_err());
        recorder.stop_recording().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_without_start_fails() {
        let (recorder, _source, _events) = recorder_with_source();
        assert!(recorder.stop_recording().await.is_err());
    }
}
