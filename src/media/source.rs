use crate::media::codecs;
use crate::{AudioFrame, PcmBuf};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One opened microphone stream. Dropping the stream releases it; the
/// producer side observes the cancellation and stops feeding frames.
pub struct AudioStream {
    sample_rate: u32,
    frames: mpsc::UnboundedReceiver<AudioFrame>,
    guard: CancellationToken,
}

impl AudioStream {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub async fn recv(&mut self) -> Option<AudioFrame> {
        self.frames.recv().await
    }

    /// Frames already queued by the producer, without waiting.
    pub fn try_recv(&mut self) -> Option<AudioFrame> {
        self.frames.try_recv().ok()
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        self.guard.cancel();
    }
}

/// Microphone abstraction. The recorder and every VAD backend open their own
/// stream; streams are never shared between consumers.
#[async_trait]
pub trait AudioSource: Send + Sync {
    async fn open(&self) -> Result<AudioStream>;
}

struct Subscriber {
    tx: mpsc::UnboundedSender<AudioFrame>,
    guard: CancellationToken,
}

/// In-process source fed by `push()`. Each `open()` gets an independent
/// stream receiving every frame pushed after the open.
pub struct ChannelSource {
    sample_rate: u32,
    subscribers: Mutex<Vec<Subscriber>>,
    failing: AtomicBool,
}

impl ChannelSource {
    pub fn new(sample_rate: u32) -> Arc<Self> {
        Arc::new(Self {
            sample_rate,
            subscribers: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        })
    }

    /// Make subsequent `open()` calls fail, simulating a missing or denied
    /// microphone device.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn push(&self, samples: PcmBuf) {
        let frame = AudioFrame::pcm(samples, self.sample_rate);
        let mut subs = self.subscribers.lock();
        subs.retain(|sub| !sub.guard.is_cancelled() && sub.tx.send(frame.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.subscribers.lock();
        subs.retain(|sub| !sub.guard.is_cancelled());
        subs.len()
    }
}

#[async_trait]
impl AudioSource for ChannelSource {
    async fn open(&self) -> Result<AudioStream> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("microphone unavailable"));
        }
        let (tx, frames) = mpsc::unbounded_channel();
        let guard = CancellationToken::new();
        self.subscribers.lock().push(Subscriber {
            tx,
            guard: guard.clone(),
        });
        Ok(AudioStream {
            sample_rate: self.sample_rate,
            frames,
            guard,
        })
    }
}

/// Plays a WAV file as a paced microphone feed, then an optional tail of
/// silence so downstream silence detection can complete.
pub struct WavFileSource {
    samples: PcmBuf,
    sample_rate: u32,
    frame_ms: u64,
    trailing_silence_ms: u64,
    realtime: bool,
}

impl WavFileSource {
    pub fn from_file(path: &str) -> Result<Self> {
        let (samples, sample_rate) = codecs::read_wav_file(path)?;
        Ok(Self {
            samples,
            sample_rate,
            frame_ms: 20,
            trailing_silence_ms: 2000,
            realtime: true,
        })
    }

    pub fn with_realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn with_trailing_silence_ms(mut self, ms: u64) -> Self {
        self.trailing_silence_ms = ms;
        self
    }
}

#[async_trait]
impl AudioSource for WavFileSource {
    async fn open(&self) -> Result<AudioStream> {
        let (tx, frames) = mpsc::unbounded_channel();
        let guard = CancellationToken::new();
        let token = guard.clone();
        let samples = self.samples.clone();
        let sample_rate = self.sample_rate;
        let frame_len = ((sample_rate as u64 * self.frame_ms) / 1000).max(1) as usize;
        let frame_ms = self.frame_ms;
        let silence_frames = (self.trailing_silence_ms / self.frame_ms.max(1)) as usize;
        let realtime = self.realtime;
        tokio::spawn(async move {
            for chunk in samples.chunks(frame_len) {
                if token.is_cancelled() {
                    return;
                }
                if tx.send(AudioFrame::pcm(chunk.to_vec(), sample_rate)).is_err() {
                    return;
                }
                if realtime {
                    sleep(Duration::from_millis(frame_ms)).await;
                }
            }
            for _ in 0..silence_frames {
                if token.is_cancelled() {
                    return;
                }
                if tx
                    .send(AudioFrame::pcm(vec![0; frame_len], sample_rate))
                    .is_err()
                {
                    return;
                }
                if realtime {
                    sleep(Duration::from_millis(frame_ms)).await;
                }
            }
            debug!("wav source drained");
        });
        Ok(AudioStream {
            sample_rate,
            frames,
            guard,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_source_fans_out_to_each_stream() {
        let source = ChannelSource::new(16000);
        let mut a = source.open().await.unwrap();
        let mut b = source.open().await.unwrap();
        source.push(vec![1, 2, 3]);
        let fa = a.recv().await.unwrap();
        let fb = b.recv().await.unwrap();
        assert_eq!(fa.duration_ms(), fb.duration_ms());
        assert_eq!(source.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_subscription() {
        let source = ChannelSource::new(16000);
        let stream = source.open().await.unwrap();
        assert_eq!(source.subscriber_count(), 1);
        drop(stream);
        assert_eq!(source.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_failing_source_rejects_open() {
        let source = ChannelSource::new(16000);
        source.set_failing(true);
        assert!(source.open().await.is_err());
    }

    #[tokio::test]
    async fn test_wav_file_source_plays_file_then_silence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.wav");
        let wav = codecs::pcm_to_wav(&vec![1000i16; 640], 16000).unwrap();
        std::fs::write(&path, wav).unwrap();

        let source = WavFileSource::from_file(path.to_str().unwrap())
            .unwrap()
            .with_realtime(false)
            .with_trailing_silence_ms(40);
        let mut stream = source.open().await.unwrap();
        assert_eq!(stream.sample_rate(), 16000);

        let mut voiced = 0usize;
        let mut silent = 0usize;
        while let Some(frame) = stream.recv().await {
            match frame.samples {
                crate::Samples::PCM { samples } if samples.iter().any(|&s| s != 0) => voiced += 1,
                _ => silent += 1,
            }
        }
        // 640 samples at 20 ms frames = 2 voiced frames, then 2 of silence.
        assert_eq!(voiced, 2);
        assert_eq!(silent, 2);
    }
}
