use crate::event::{
    CallEvent, CallEventReceiver, CallEventSender, EventSender, SessionEvent,
    create_call_event_channel,
};
use crate::get_timestamp;
use crate::llm::{ChatClient, ChatFrame, ChatMessage, ChatRequest};
use crate::media::engine::StreamEngine;
use crate::media::recorder::{AudioRecorder, RecorderOption};
use crate::media::sink::AudioSink;
use crate::media::source::AudioSource;
use crate::media::vad::{
    KeywordGate, KeywordGateOption, VADOption, VadBackend, VadContext, VadEvent, VadType,
    create_vad_event_channel,
};
use crate::segmenter::{SegmenterOption, SentenceSegmenter};
use crate::synthesis::SynthesisClient;
use crate::transcription::TranscriptionClient;
use crate::tts_player::StreamingTtsPlayer;
use anyhow::{Result, anyhow};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The one conversation state. Exactly one value is active; every
/// side-effecting resource is attached and detached on transition
/// boundaries, never left dangling across one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallState {
    Idle,
    Listening,
    Recording,
    Processing,
    Speaking,
}

fn default_interrupt_grace_ms() -> u64 {
    200
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CallOption {
    /// Delay between stopping TTS on a barge-in and re-arming the recorder,
    /// so the microphone does not capture the tail of the halted playback.
    /// Tuned per synthesis voice; do not assume one value generalizes.
    pub interrupt_grace_ms: u64,
    pub tts_enabled: bool,
    pub vad: VADOption,
    pub keyword_gate: KeywordGateOption,
    pub recorder: RecorderOption,
    pub segmenter: SegmenterOption,
}

impl Default for CallOption {
    fn default() -> Self {
        Self {
            interrupt_grace_ms: default_interrupt_grace_ms(),
            tts_enabled: true,
            vad: VADOption::default(),
            keyword_gate: KeywordGateOption::default(),
            recorder: RecorderOption::default(),
            segmenter: SegmenterOption::default(),
        }
    }
}

/// External entry points into a running session. Cloneable; every call is an
/// event enqueued for the dispatch loop.
#[derive(Clone)]
pub struct CallHandle {
    events: CallEventSender,
}

impl CallHandle {
    pub fn start_call(&self) {
        self.events.send(CallEvent::StartCall);
    }

    pub fn end_call(&self) {
        self.events.send(CallEvent::EndCall);
    }

    pub fn interrupt(&self) {
        self.events.send(CallEvent::Interrupted);
    }

    pub fn dispatch(&self, event: CallEvent) {
        self.events.send(event);
    }
}

enum VadMode {
    Direct,
    KeywordGated,
}

/// The orchestrator: owns the conversation state, drains the call event
/// queue, and drives VAD, recorder, transcription, chat and the TTS player
/// across transitions. All dispatches are serialized by the single drain
/// loop; the sender-side guard drops events that arrive while a transition
/// is still being processed (except `EndCall`).
pub struct CallSession {
    session_id: crate::SessionId,
    option: CallOption,
    state: CallState,
    /// The LLM stream for the current turn has finished; `Speaking` leaves
    /// for `Listening` only once this is set and the TTS queue is drained.
    llm_finished: bool,
    engine: Arc<StreamEngine>,
    source: Arc<dyn AudioSource>,
    sink: Arc<dyn AudioSink>,
    asr: Arc<dyn TranscriptionClient>,
    chat: Arc<dyn ChatClient>,
    recorder: Arc<AudioRecorder>,
    player: Arc<StreamingTtsPlayer>,
    vad: Option<Box<dyn VadBackend>>,
    vad_pump: Option<CancellationToken>,
    llm_abort: Option<CancellationToken>,
    asr_abort: Option<CancellationToken>,
    history: Arc<Mutex<Vec<ChatMessage>>>,
    events_tx: CallEventSender,
    events_rx: CallEventReceiver,
    session_events: EventSender,
    busy: Arc<AtomicBool>,
}

pub struct CallSessionBuilder {
    option: CallOption,
    source: Option<Arc<dyn AudioSource>>,
    sink: Option<Arc<dyn AudioSink>>,
    asr: Option<Arc<dyn TranscriptionClient>>,
    tts: Option<Arc<dyn SynthesisClient>>,
    chat: Option<Arc<dyn ChatClient>>,
    engine: Option<Arc<StreamEngine>>,
    session_events: Option<EventSender>,
    output_sample_rate: u32,
}

impl CallSessionBuilder {
    pub fn new(option: CallOption) -> Self {
        Self {
            option,
            source: None,
            sink: None,
            asr: None,
            tts: None,
            chat: None,
            engine: None,
            session_events: None,
            output_sample_rate: 16000,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn AudioSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn AudioSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_asr(mut self, asr: Arc<dyn TranscriptionClient>) -> Self {
        self.asr = Some(asr);
        self
    }

    pub fn with_tts(mut self, tts: Arc<dyn SynthesisClient>) -> Self {
        self.tts = Some(tts);
        self
    }

    pub fn with_chat(mut self, chat: Arc<dyn ChatClient>) -> Self {
        self.chat = Some(chat);
        self
    }

    pub fn with_engine(mut self, engine: Arc<StreamEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_session_events(mut self, events: EventSender) -> Self {
        self.session_events = Some(events);
        self
    }

    pub fn with_output_sample_rate(mut self, rate: u32) -> Self {
        self.output_sample_rate = rate;
        self
    }

    pub fn build(self) -> Result<(CallSession, CallHandle)> {
        let source = self.source.ok_or_else(|| anyhow!("audio source required"))?;
        let sink = self.sink.ok_or_else(|| anyhow!("audio sink required"))?;
        let asr = self.asr.ok_or_else(|| anyhow!("transcription client required"))?;
        let tts = self.tts.ok_or_else(|| anyhow!("synthesis client required"))?;
        let chat = self.chat.ok_or_else(|| anyhow!("chat client required"))?;
        let engine = self.engine.unwrap_or_else(|| Arc::new(StreamEngine::default()));
        let session_events = self
            .session_events
            .unwrap_or_else(crate::event::create_event_channel);

        let (events_tx, events_rx) = create_call_event_channel();
        let busy = events_tx.busy_flag();
        let recorder = Arc::new(AudioRecorder::new(
            self.option.recorder.clone(),
            source.clone(),
            events_tx.clone(),
            session_events.clone(),
        ));
        let player = Arc::new(StreamingTtsPlayer::new(
            tts,
            sink.clone(),
            events_tx.clone(),
            session_events.clone(),
            self.output_sample_rate,
        ));

        let handle = CallHandle {
            events: events_tx.clone(),
        };
        let session_id = format!("call_{}", uuid::Uuid::new_v4().simple());
        let session = CallSession {
            session_id,
            option: self.option,
            state: CallState::Idle,
            llm_finished: false,
            engine,
            source,
            sink,
            asr,
            chat,
            recorder,
            player,
            vad: None,
            vad_pump: None,
            llm_abort: None,
            asr_abort: None,
            history: Arc::new(Mutex::new(Vec::new())),
            events_tx,
            events_rx,
            session_events,
            busy,
        };
        Ok((session, handle))
    }
}

impl CallSession {
    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Drain loop. Runs until every sender (handle, recorder, player,
    /// pumps) is gone.
    pub async fn run(mut self) {
        info!(session_id = %self.session_id, "call session ready");
        while let Some(event) = self.events_rx.recv().await {
            self.busy.store(true, Ordering::SeqCst);
            self.dispatch(event).await;
            self.busy.store(false, Ordering::SeqCst);
        }
        debug!(session_id = %self.session_id, "call session loop exited");
    }

    async fn dispatch(&mut self, event: CallEvent) {
        debug!(session_id = %self.session_id, state = ?self.state, ?event, "dispatch");
        match (self.state, event) {
            (_, CallEvent::EndCall) => self.handle_end_call().await,
            (CallState::Idle, CallEvent::StartCall) => {
                if let Err(e) = self.sink.unlock().await {
                    warn!("audio output unlock failed: {}", e);
                }
                self.enter_listening().await;
            }
            (CallState::Listening, CallEvent::VoiceDetected) => {
                // The assistant is still audibly talking: let the utterance
                // play out rather than capturing our own tail.
                if self.player.is_playing() {
                    debug!("voice detected while tts still audible, skipped");
                    return;
                }
                self.begin_recording().await;
            }
            (CallState::Recording, CallEvent::SilenceDetected) => {
                self.set_status("thinking");
                match self.recorder.stop_recording().await {
                    Ok(wav) => {
                        self.set_state(CallState::Processing);
                        self.spawn_transcription(wav);
                    }
                    Err(e) => {
                        warn!("recorder stop failed: {}", e);
                        self.enter_listening().await;
                    }
                }
            }
            (CallState::Processing, CallEvent::AsrEmpty) => {
                debug!("transcription empty, back to listening");
                self.enter_listening().await;
            }
            (CallState::Processing, CallEvent::AsrComplete { text }) => {
                self.spawn_chat(text);
            }
            (CallState::Processing, CallEvent::TtsStarted) => {
                self.enter_speaking().await;
            }
            (CallState::Processing, CallEvent::LlmComplete) => {
                self.llm_finished = true;
                // No TTS output pending: nothing will ever reach Speaking.
                if !self.player.is_pending() && !self.player.is_playing() {
                    self.enter_listening().await;
                }
            }
            (CallState::Speaking, CallEvent::LlmComplete) => {
                self.llm_finished = true;
            }
            (CallState::Speaking, CallEvent::TtsEnded) => {
                if self.llm_finished && !self.player.is_pending() && !self.player.is_playing() {
                    self.enter_listening().await;
                }
            }
            (CallState::Speaking, CallEvent::VoiceDetected)
            | (CallState::Speaking, CallEvent::Interrupted) => {
                self.handle_interrupt().await;
            }
            (state, event) => {
                debug!(?state, ?event, "event ignored in this state");
            }
        }
    }

    fn set_state(&mut self, state: CallState) {
        if self.state == state {
            return;
        }
        debug!(from = ?self.state, to = ?state, "state transition");
        self.state = state;
        let _ = self.session_events.send(SessionEvent::StateChanged {
            timestamp: get_timestamp(),
            state,
        });
    }

    fn set_status(&self, status: &str) {
        let _ = self.session_events.send(SessionEvent::Status {
            timestamp: get_timestamp(),
            status: status.to_string(),
        });
    }

    async fn enter_listening(&mut self) {
        self.llm_finished = false;
        self.stop_vad().await;
        self.set_state(CallState::Listening);
        self.set_status("listening");
        if let Err(e) = self.start_vad(VadMode::Direct).await {
            // A broken VAD backend must never block the conversation: fall
            // back to recording unconditionally.
            warn!("vad start failed, recording unconditionally: {}", e);
            self.begin_recording().await;
        }
    }

    async fn enter_speaking(&mut self) {
        self.set_state(CallState::Speaking);
        self.set_status("speaking");
        self.stop_vad().await;
        if let Err(e) = self.start_vad(VadMode::KeywordGated).await {
            // Degraded barge-in: playback continues, interrupts only via
            // the explicit handle.
            warn!("keyword-gated vad start failed: {}", e);
        }
    }

    async fn begin_recording(&mut self) {
        self.stop_vad().await;
        self.llm_finished = false;
        match self.recorder.start_recording().await {
            Ok(()) => {
                self.set_state(CallState::Recording);
                self.set_status("recording");
            }
            Err(e) => {
                warn!("recorder start failed: {}", e);
                self.set_state(CallState::Listening);
                self.set_status("listening");
                if let Err(e) = self.start_vad(VadMode::Direct).await {
                    warn!("vad restart after recorder failure failed: {}", e);
                }
            }
        }
    }

    async fn start_vad(&mut self, mode: VadMode) -> Result<()> {
        let (out_tx, mut out_rx) = create_vad_event_channel();
        let ctx = VadContext {
            source: self.source.clone(),
            events: out_tx,
            session_events: self.session_events.clone(),
        };
        let backend: Box<dyn VadBackend> = match mode {
            VadMode::KeywordGated if self.option.keyword_gate.enabled => {
                let (raw_tx, raw_rx) = create_vad_event_channel();
                let inner_ctx = VadContext {
                    source: self.source.clone(),
                    events: raw_tx,
                    session_events: self.session_events.clone(),
                };
                let inner = self
                    .engine
                    .create_vad_backend(self.option.vad.clone(), inner_ctx)?;
                Box::new(KeywordGate::new(
                    inner,
                    raw_rx,
                    self.option.keyword_gate.clone(),
                    self.asr.clone(),
                    ctx,
                ))
            }
            _ => self.engine.create_vad_backend(self.option.vad.clone(), ctx)?,
        };

        match self.option.vad.r#type {
            VadType::NeuralLocal => self.set_status("loading vad model"),
            VadType::NeuralServer => self.set_status("connecting vad"),
            _ => {}
        }
        backend.start().await?;

        let pump_token = CancellationToken::new();
        let pump_guard = pump_token.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_guard.cancelled() => break,
                    event = out_rx.recv() => {
                        match event {
                            Some(VadEvent::SpeechStart) => {
                                events.send(CallEvent::VoiceDetected);
                            }
                            Some(VadEvent::SpeechEnd) => {}
                            None => break,
                        }
                    }
                }
            }
        });
        self.vad = Some(backend);
        self.vad_pump = Some(pump_token);
        Ok(())
    }

    async fn stop_vad(&mut self) {
        if let Some(token) = self.vad_pump.take() {
            token.cancel();
        }
        if let Some(vad) = self.vad.take() {
            vad.stop().await;
        }
    }

    fn spawn_transcription(&mut self, wav: Vec<u8>) {
        let token = CancellationToken::new();
        self.asr_abort = Some(token.clone());
        let asr = self.asr.clone();
        let events = self.events_tx.clone();
        let session_events = self.session_events.clone();
        tokio::spawn(async move {
            let begin = get_timestamp();
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = asr.transcribe(wav) => result,
            };
            let _ = session_events.send(SessionEvent::Metrics {
                timestamp: get_timestamp(),
                key: "completed.asr".to_string(),
                duration: get_timestamp().saturating_sub(begin) as u32,
            });
            match result {
                Ok(result) if !result.is_empty() => {
                    let _ = session_events.send(SessionEvent::AsrFinal {
                        timestamp: get_timestamp(),
                        text: result.text.clone(),
                    });
                    events.send(CallEvent::AsrComplete { text: result.text });
                }
                Ok(_) => {
                    events.send(CallEvent::AsrEmpty);
                }
                Err(e) => {
                    // Transient network failure: same as "heard nothing".
                    warn!("transcription failed: {}", e);
                    events.send(CallEvent::AsrEmpty);
                }
            }
        });
    }

    fn spawn_chat(&mut self, text: String) {
        let token = CancellationToken::new();
        self.llm_abort = Some(token.clone());
        let chat = self.chat.clone();
        let player = self.player.clone();
        let events = self.events_tx.clone();
        let session_events = self.session_events.clone();
        let history = self.history.clone();
        let segmenter_option = self.option.segmenter.clone();
        let tts_enabled = self.option.tts_enabled;
        tokio::spawn(async move {
            let request = ChatRequest {
                message: text.clone(),
                history: history.lock().await.clone(),
            };
            history.lock().await.push(ChatMessage::user(text));

            let stream = match chat.chat_stream(request, token.clone()).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("chat request failed: {}", e);
                    events.send(CallEvent::LlmComplete);
                    return;
                }
            };
            let mut stream = stream;
            let mut segmenter = SentenceSegmenter::new(segmenter_option);
            let mut reply = String::new();
            while let Some(frame) = stream.next().await {
                if token.is_cancelled() {
                    break;
                }
                match frame {
                    Ok(ChatFrame::Token { content }) => {
                        reply.push_str(&content);
                        let _ = session_events.send(SessionEvent::LlmDelta {
                            timestamp: get_timestamp(),
                            text: content.clone(),
                        });
                        for fragment in segmenter.push(&content) {
                            if tts_enabled {
                                player.speak(&fragment);
                            }
                        }
                    }
                    Ok(ChatFrame::Error { message }) => {
                        warn!("chat stream error frame: {}", message);
                        let _ = session_events.send(SessionEvent::Error {
                            timestamp: get_timestamp(),
                            sender: "chat".to_string(),
                            error: message,
                            code: None,
                        });
                    }
                    Ok(_) => {
                        // Skill and music frames carry no speakable text.
                    }
                    Err(e) => {
                        warn!("chat stream failed: {}", e);
                        break;
                    }
                }
            }
            if !token.is_cancelled() {
                if let Some(rest) = segmenter.finish() {
                    if tts_enabled {
                        player.speak(&rest);
                    }
                }
                if !reply.is_empty() {
                    history.lock().await.push(ChatMessage::assistant(reply.clone()));
                    let _ = session_events.send(SessionEvent::LlmFinal {
                        timestamp: get_timestamp(),
                        text: reply,
                    });
                }
                events.send(CallEvent::LlmComplete);
            }
        });
    }

    async fn handle_interrupt(&mut self) {
        info!("barge-in: stopping playback and aborting the reply");
        let _ = self.session_events.send(SessionEvent::Interrupted {
            timestamp: get_timestamp(),
        });
        self.player.stop();
        if let Some(token) = self.llm_abort.take() {
            token.cancel();
        }
        self.stop_vad().await;
        // Grace window before re-arming the recorder, so the microphone does
        // not pick up the tail of the just-stopped playback.
        sleep(Duration::from_millis(self.option.interrupt_grace_ms)).await;
        if self.state != CallState::Speaking {
            // A newer transition (EndCall) won the race during the wait.
            return;
        }
        self.begin_recording().await;
    }

    async fn handle_end_call(&mut self) {
        info!("ending call");
        self.stop_vad().await;
        self.player.stop();
        if let Some(token) = self.llm_abort.take() {
            token.cancel();
        }
        if let Some(token) = self.asr_abort.take() {
            token.cancel();
        }
        if self.recorder.is_recording() {
            if let Err(e) = self.recorder.stop_recording().await {
                warn!("recorder stop on end call failed: {}", e);
            }
        }
        self.history.lock().await.clear();
        self.llm_finished = false;
        self.set_state(CallState::Idle);
        self.set_status("idle");
    }
}
