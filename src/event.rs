use crate::call::CallState;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

/// Events consumed by the call state machine. Transient: each one is drained
/// and handled exactly once by the dispatch loop.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StartCall,
    EndCall,
    VoiceDetected,
    SilenceDetected,
    AsrComplete { text: String },
    AsrEmpty,
    LlmComplete,
    TtsStarted,
    TtsEnded,
    Interrupted,
}

/// Event intake with the state machine's reentrancy guard built in: while a
/// transition is being processed, new events are dropped at send time —
/// except `EndCall`, which always goes through so a call can be terminated
/// even mid-transition.
#[derive(Clone)]
pub struct CallEventSender {
    tx: mpsc::UnboundedSender<CallEvent>,
    busy: Arc<AtomicBool>,
}

impl CallEventSender {
    /// Returns false when the event was dropped (guard active or machine
    /// gone).
    pub fn send(&self, event: CallEvent) -> bool {
        if event != CallEvent::EndCall && self.busy.load(Ordering::SeqCst) {
            debug!(?event, "event dropped: transition in flight");
            return false;
        }
        self.tx.send(event).is_ok()
    }

    /// The guard flag, held by the dispatch loop while it processes one
    /// event.
    pub fn busy_flag(&self) -> Arc<AtomicBool> {
        self.busy.clone()
    }
}

pub type CallEventReceiver = mpsc::UnboundedReceiver<CallEvent>;

pub fn create_call_event_channel() -> (CallEventSender, CallEventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        CallEventSender {
            tx,
            busy: Arc::new(AtomicBool::new(false)),
        },
        rx,
    )
}

/// Observer-facing session events, broadcast to any number of subscribers
/// (UI, metrics, tests). Never drives state transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SessionEvent {
    #[serde(rename_all = "camelCase")]
    StateChanged {
        timestamp: u64,
        state: CallState,
    },
    /// Caller-facing status line, e.g. "listening", "thinking".
    #[serde(rename_all = "camelCase")]
    Status {
        timestamp: u64,
        status: String,
    },
    /// Mean FFT magnitude of the current microphone frame, 0..=255.
    #[serde(rename_all = "camelCase")]
    AudioLevel {
        timestamp: u64,
        level: u8,
    },
    #[serde(rename_all = "camelCase")]
    AsrFinal {
        timestamp: u64,
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    LlmDelta {
        timestamp: u64,
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    LlmFinal {
        timestamp: u64,
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    TtsStarted {
        timestamp: u64,
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    TtsEnded {
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    Interrupted {
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    Metrics {
        timestamp: u64,
        key: String,
        duration: u32,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        timestamp: u64,
        sender: String,
        error: String,
        code: Option<u32>,
    },
}

pub type EventSender = broadcast::Sender<SessionEvent>;
pub type EventReceiver = broadcast::Receiver<SessionEvent>;

pub fn create_event_channel() -> EventSender {
    let (tx, _) = broadcast::channel(256);
    tx
}
