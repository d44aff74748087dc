use crate::{AudioFrame, PcmBuf};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Audio output abstraction the TTS player writes decoded PCM into. `play`
/// returns when the buffer has been rendered to completion or the token is
/// cancelled, whichever comes first.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Prepare the output for playback. Some outputs must be unlocked by an
    /// explicit start gesture before they accept audio.
    async fn unlock(&self) -> Result<()>;

    async fn play(&self, samples: PcmBuf, sample_rate: u32, cancel: CancellationToken)
    -> Result<()>;
}

/// Renders playback in real time by pacing frames onto an optional observer
/// channel; the pacing is what gives `play` its natural duration.
pub struct PacedSink {
    frame_ms: u64,
    unlocked: AtomicBool,
    frames_tx: Option<mpsc::UnboundedSender<AudioFrame>>,
}

impl PacedSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            frame_ms: 20,
            unlocked: AtomicBool::new(false),
            frames_tx: None,
        })
    }

    /// Sink that forwards each rendered frame to `frames_tx`, for callers
    /// that route playback somewhere (a device writer, a network track).
    pub fn with_output(frames_tx: mpsc::UnboundedSender<AudioFrame>) -> Arc<Self> {
        Arc::new(Self {
            frame_ms: 20,
            unlocked: AtomicBool::new(false),
            frames_tx: Some(frames_tx),
        })
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSink for PacedSink {
    async fn unlock(&self) -> Result<()> {
        self.unlocked.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn play(
        &self,
        samples: PcmBuf,
        sample_rate: u32,
        cancel: CancellationToken,
    ) -> Result<()> {
        let frame_len = ((sample_rate as u64 * self.frame_ms) / 1000).max(1) as usize;
        for chunk in samples.chunks(frame_len) {
            if cancel.is_cancelled() {
                debug!("playback cancelled mid-buffer");
                return Ok(());
            }
            if let Some(tx) = &self.frames_tx {
                let _ = tx.send(AudioFrame::pcm(chunk.to_vec(), sample_rate));
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("playback cancelled mid-buffer");
                    return Ok(());
                }
                _ = sleep(Duration::from_millis(self.frame_ms)) => {}
            }
        }
        Ok(())
    }
}

/// Discards audio instantly. Used by tests that only care about ordering and
/// state, not timing.
pub struct NullSink;

impl NullSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl AudioSink for NullSink {
    async fn unlock(&self) -> Result<()> {
        Ok(())
    }

    async fn play(
        &self,
        _samples: PcmBuf,
        _sample_rate: u32,
        _cancel: CancellationToken,
    ) -> Result<()> {
        tokio::task::yield_now().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_paced_sink_takes_buffer_duration() {
        let sink = PacedSink::new();
        sink.unlock().await.unwrap();
        let start = tokio::time::Instant::now();
        // 16000 samples @ 16 kHz = 1 second
        sink.play(vec![0; 16000], 16000, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_paced_sink_stops_on_cancel() {
        let sink = PacedSink::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let start = tokio::time::Instant::now();
        sink.play(vec![0; 16000], 16000, cancel).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
