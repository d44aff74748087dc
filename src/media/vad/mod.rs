use crate::event::EventSender;
use crate::media::analysis::{VOICE_BAND_HI_HZ, VOICE_BAND_LO_HZ};
use crate::media::source::AudioSource;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::debug;

pub mod amplitude;
pub mod keyword;
pub mod socket;
pub mod spectral;

pub use keyword::{KeywordGate, KeywordGateOption};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum VadType {
    #[serde(rename = "amplitude")]
    Amplitude,
    #[serde(rename = "spectral")]
    Spectral,
    #[serde(rename = "neural-local")]
    NeuralLocal,
    #[serde(rename = "neural-server")]
    NeuralServer,
}

impl std::fmt::Display for VadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VadType::Amplitude => write!(f, "amplitude"),
            VadType::Spectral => write!(f, "spectral"),
            VadType::NeuralLocal => write!(f, "neural-local"),
            VadType::NeuralServer => write!(f, "neural-server"),
        }
    }
}

impl<'de> Deserialize<'de> for VadType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        match value.as_str() {
            "amplitude" => Ok(VadType::Amplitude),
            "spectral" => Ok(VadType::Spectral),
            "neural-local" | "local" => Ok(VadType::NeuralLocal),
            "neural-server" | "server" => Ok(VadType::NeuralServer),
            other => Err(serde::de::Error::custom(format!(
                "unknown vad type: {}",
                other
            ))),
        }
    }
}

fn default_ignore_window_ms() -> u64 {
    800
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AmplitudeOption {
    /// AudioLevel (0..=255) a frame must reach to count as speech.
    pub threshold: u8,
    /// Consecutive above-threshold frames required to confirm speech start.
    pub trigger_count: u32,
    /// Consecutive below-threshold frames required to confirm speech end.
    pub release_count: u32,
    pub fft_size: usize,
}

impl Default for AmplitudeOption {
    fn default() -> Self {
        Self {
            threshold: 15,
            trigger_count: 3,
            release_count: 10,
            fft_size: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpectralOption {
    /// Minimum voice-band share of total spectral energy.
    pub ratio_threshold: f32,
    /// Absolute floor on the mean voice-band energy; keeps pure hiss with a
    /// flat spectrum from passing on ratio alone.
    pub energy_floor: f32,
    pub speech_frames: u32,
    pub silence_frames: u32,
    pub band_lo_hz: f32,
    pub band_hi_hz: f32,
    pub fft_size: usize,
}

impl Default for SpectralOption {
    fn default() -> Self {
        Self {
            ratio_threshold: 0.5,
            energy_floor: 1.0,
            speech_frames: 3,
            silence_frames: 10,
            band_lo_hz: VOICE_BAND_LO_HZ,
            band_hi_hz: VOICE_BAND_HI_HZ,
            fft_size: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SocketOption {
    pub endpoint: Option<String>,
    /// Samples per binary frame pushed to the socket.
    pub chunk_size: usize,
    pub mode: String,
    pub connect_timeout_ms: u64,
}

impl Default for SocketOption {
    fn default() -> Self {
        Self {
            endpoint: None,
            chunk_size: 3200,
            mode: "online".to_string(),
            connect_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VADOption {
    pub r#type: VadType,
    /// Speech events within this window after start() are suppressed, so
    /// the microphone does not trip on the assistant's own opening audio.
    pub ignore_window_ms: u64,
    pub amplitude: AmplitudeOption,
    pub spectral: SpectralOption,
    pub socket: SocketOption,
}

impl Default for VADOption {
    fn default() -> Self {
        Self {
            r#type: VadType::Amplitude,
            ignore_window_ms: default_ignore_window_ms(),
            amplitude: AmplitudeOption::default(),
            spectral: SpectralOption::default(),
            socket: SocketOption::default(),
        }
    }
}

/// Detection-facing lifecycle state, surfaced as caller-visible status text
/// for the neural backends while their model/socket warms up.
#[derive(Debug, Clone, PartialEq)]
pub enum VadStatus {
    Idle,
    /// Local neural model asset being prepared.
    Loading,
    /// Server socket handshake in progress.
    Connecting,
    Active,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    SpeechStart,
    SpeechEnd,
}

pub type VadEventSender = mpsc::UnboundedSender<VadEvent>;
pub type VadEventReceiver = mpsc::UnboundedReceiver<VadEvent>;

pub fn create_vad_event_channel() -> (VadEventSender, VadEventReceiver) {
    mpsc::unbounded_channel()
}

/// Everything a backend needs besides its own options: the microphone to
/// open, the event channel the state machine drains, and the broadcast
/// channel for observers.
#[derive(Clone)]
pub struct VadContext {
    pub source: Arc<dyn AudioSource>,
    pub events: VadEventSender,
    pub session_events: EventSender,
}

/// Shared contract of the four interchangeable backends. At most one backend
/// is active at a time; switching is stop-then-start, never overlapping.
#[async_trait]
pub trait VadBackend: Send + Sync {
    fn vad_type(&self) -> VadType;
    async fn start(&self) -> Result<()>;
    async fn stop(&self);
    fn status(&self) -> VadStatus;
    fn is_active(&self) -> bool {
        self.status() == VadStatus::Active
    }
    fn is_speaking(&self) -> bool;
}

/// Debounced event output shared by all backends: deduplicates repeated
/// start/end signals and applies the post-start ignore window.
pub(crate) struct VadEmitter {
    events: VadEventSender,
    speaking: AtomicBool,
    started_at: parking_lot::Mutex<Option<Instant>>,
    ignore_window: Duration,
}

impl VadEmitter {
    pub fn new(events: VadEventSender, ignore_window_ms: u64) -> Self {
        Self {
            events,
            speaking: AtomicBool::new(false),
            started_at: parking_lot::Mutex::new(None),
            ignore_window: Duration::from_millis(ignore_window_ms),
        }
    }

    pub fn mark_started(&self) {
        *self.started_at.lock() = Some(Instant::now());
        self.speaking.store(false, Ordering::SeqCst);
    }

    fn in_ignore_window(&self) -> bool {
        self.started_at
            .lock()
            .map(|t| t.elapsed() < self.ignore_window)
            .unwrap_or(false)
    }

    pub fn speech_start(&self) {
        if self.speaking.load(Ordering::SeqCst) {
            return;
        }
        if self.in_ignore_window() {
            debug!("speech start suppressed by ignore window");
            return;
        }
        self.speaking.store(true, Ordering::SeqCst);
        let _ = self.events.send(VadEvent::SpeechStart);
    }

    pub fn speech_end(&self) {
        if !self.speaking.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.events.send(VadEvent::SpeechEnd);
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.speaking.store(false, Ordering::SeqCst);
        *self.started_at.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::create_event_channel;
    use crate::media::source::ChannelSource;

    #[tokio::test]
    async fn test_emitter_deduplicates_and_pairs_events() {
        let (tx, mut rx) = create_vad_event_channel();
        let emitter = VadEmitter::new(tx, 0);
        emitter.mark_started();
        emitter.speech_start();
        emitter.speech_start();
        emitter.speech_end();
        emitter.speech_end();
        assert_eq!(rx.try_recv().unwrap(), VadEvent::SpeechStart);
        assert_eq!(rx.try_recv().unwrap(), VadEvent::SpeechEnd);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_emitter_ignore_window_suppresses_start() {
        let (tx, mut rx) = create_vad_event_channel();
        let emitter = VadEmitter::new(tx, 500);
        emitter.mark_started();
        emitter.speech_start();
        assert!(rx.try_recv().is_err(), "inside ignore window");
        tokio::time::advance(Duration::from_millis(600)).await;
        emitter.speech_start();
        assert_eq!(rx.try_recv().unwrap(), VadEvent::SpeechStart);
    }

    #[test]
    fn test_vad_type_deserialize_aliases() {
        let t: VadType = serde_json::from_str("\"server\"").unwrap();
        assert_eq!(t, VadType::NeuralServer);
        let t: VadType = serde_json::from_str("\"amplitude\"").unwrap();
        assert_eq!(t, VadType::Amplitude);
        assert!(serde_json::from_str::<VadType>("\"bogus\"").is_err());
    }

    #[test]
    fn test_context_is_cloneable() {
        let (tx, _rx) = create_vad_event_channel();
        let ctx = VadContext {
            source: ChannelSource::new(16000),
            events: tx,
            session_events: create_event_channel(),
        };
        let _ = ctx.clone();
    }
}
