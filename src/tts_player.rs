use crate::event::{CallEvent, CallEventSender, EventSender, SessionEvent};
use crate::media::codecs;
use crate::media::sink::AudioSink;
use crate::synthesis::SynthesisClient;
use crate::{PcmBuf, get_timestamp};
use anyhow::{Result, anyhow};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct QueueItem {
    text: String,
    synthesis: JoinHandle<Result<Vec<u8>>>,
}

struct Shared {
    queue: parking_lot::Mutex<VecDeque<QueueItem>>,
    pending: AtomicUsize,
    playing: AtomicBool,
    draining: AtomicBool,
    cancel: parking_lot::Mutex<CancellationToken>,
}

/// Sentence-at-a-time speech output. `speak` kicks off synthesis immediately
/// and enqueues the in-flight task; one drain loop plays items strictly in
/// submission order, so synthesis of sentence k+1 overlaps playback of
/// sentence k. `stop` flushes everything at once and suppresses the natural
/// end-of-queue event.
pub struct StreamingTtsPlayer {
    client: Arc<dyn SynthesisClient>,
    sink: Arc<dyn AudioSink>,
    events: CallEventSender,
    session_events: EventSender,
    output_sample_rate: u32,
    shared: Arc<Shared>,
}

impl StreamingTtsPlayer {
    pub fn new(
        client: Arc<dyn SynthesisClient>,
        sink: Arc<dyn AudioSink>,
        events: CallEventSender,
        session_events: EventSender,
        output_sample_rate: u32,
    ) -> Self {
        Self {
            client,
            sink,
            events,
            session_events,
            output_sample_rate,
            shared: Arc::new(Shared {
                queue: parking_lot::Mutex::new(VecDeque::new()),
                pending: AtomicUsize::new(0),
                playing: AtomicBool::new(false),
                draining: AtomicBool::new(false),
                cancel: parking_lot::Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// True while the sink is actively rendering audio.
    pub fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::SeqCst)
    }

    /// True while any submitted sentence has not finished playing.
    pub fn is_pending(&self) -> bool {
        self.shared.pending.load(Ordering::SeqCst) > 0
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Enqueue a sentence: synthesis starts now, playback happens in
    /// submission order regardless of synthesis completion order.
    pub fn speak(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let token = self.shared.cancel.lock().clone();
        let client = self.client.clone();
        let owned = text.to_string();
        let synth_text = owned.clone();
        let synth_token = token.clone();
        let synthesis = tokio::spawn(async move {
            tokio::select! {
                _ = synth_token.cancelled() => Err(anyhow!("synthesis cancelled")),
                result = client.synthesize(&synth_text) => result,
            }
        });

        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        self.shared.queue.lock().push_back(QueueItem {
            text: owned,
            synthesis,
        });

        if !self.shared.draining.swap(true, Ordering::SeqCst) {
            self.spawn_drain_loop(token);
        }
    }

    /// Flush the queue and halt the current playback immediately. Safe to
    /// call at any time, including when nothing is in flight.
    pub fn stop(&self) {
        let old = {
            let mut cancel = self.shared.cancel.lock();
            std::mem::replace(&mut *cancel, CancellationToken::new())
        };
        old.cancel();
        let drained: Vec<QueueItem> = self.shared.queue.lock().drain(..).collect();
        for item in &drained {
            item.synthesis.abort();
        }
        self.shared.pending.store(0, Ordering::SeqCst);
        self.shared.playing.store(false, Ordering::SeqCst);
        self.shared.draining.store(false, Ordering::SeqCst);
        if !drained.is_empty() {
            debug!(flushed = drained.len(), "tts queue flushed");
        }
    }

    fn spawn_drain_loop(&self, token: CancellationToken) {
        let shared = self.shared.clone();
        let sink = self.sink.clone();
        let events = self.events.clone();
        let session_events = self.session_events.clone();
        let decoder = DrainDecoder {
            output_sample_rate: self.output_sample_rate,
        };
        tokio::spawn(async move {
            loop {
                let mut started = false;
                loop {
                    if token.is_cancelled() {
                        return;
                    }
                    let item = shared.queue.lock().pop_front();
                    let Some(item) = item else { break };
                    // Synthesis is already in flight; by the time the head
                    // is reached this await is usually near-instant.
                    let bytes = match item.synthesis.await {
                        Ok(Ok(bytes)) => bytes,
                        Ok(Err(e)) => {
                            if !token.is_cancelled() {
                                warn!(text = %item.text, "synthesis failed: {}", e);
                                shared.pending.fetch_sub(1, Ordering::SeqCst);
                            }
                            continue;
                        }
                        Err(e) => {
                            if !token.is_cancelled() {
                                warn!(text = %item.text, "synthesis task failed: {}", e);
                                shared.pending.fetch_sub(1, Ordering::SeqCst);
                            }
                            continue;
                        }
                    };
                    if token.is_cancelled() {
                        return;
                    }
                    if bytes.is_empty() {
                        shared.pending.fetch_sub(1, Ordering::SeqCst);
                        continue;
                    }
                    let (samples, sample_rate) = match decoder.decode(&bytes) {
                        Ok(decoded) => decoded,
                        Err(e) => {
                            warn!(text = %item.text, "audio decode failed: {}", e);
                            shared.pending.fetch_sub(1, Ordering::SeqCst);
                            continue;
                        }
                    };
                    if !started {
                        started = true;
                        shared.playing.store(true, Ordering::SeqCst);
                        let _ = events.send(CallEvent::TtsStarted);
                        let _ = session_events.send(SessionEvent::TtsStarted {
                            timestamp: get_timestamp(),
                            text: item.text.clone(),
                        });
                    }
                    if let Err(e) = sink.play(samples, sample_rate, token.child_token()).await {
                        warn!(text = %item.text, "playback failed: {}", e);
                    }
                    if token.is_cancelled() {
                        return;
                    }
                    shared.pending.fetch_sub(1, Ordering::SeqCst);
                }
                if token.is_cancelled() {
                    return;
                }
                shared.playing.store(false, Ordering::SeqCst);
                shared.draining.store(false, Ordering::SeqCst);
                if started {
                    let _ = events.send(CallEvent::TtsEnded);
                    let _ = session_events.send(SessionEvent::TtsEnded {
                        timestamp: get_timestamp(),
                    });
                }
                // A speak() racing this natural end can have enqueued an item
                // after the final pop but before draining was cleared; that
                // item would otherwise sit until the next speak. Reclaim the
                // drain role and play it as a new burst.
                let raced_in = !shared.queue.lock().is_empty();
                if raced_in
                    && !token.is_cancelled()
                    && !shared.draining.swap(true, Ordering::SeqCst)
                {
                    continue;
                }
                return;
            }
        });
    }
}

struct DrainDecoder {
    output_sample_rate: u32,
}

impl DrainDecoder {
    /// WAV payloads carry their own rate; headerless payloads are raw
    /// little-endian PCM at the configured output rate.
    fn decode(&self, bytes: &[u8]) -> Result<(PcmBuf, u32)> {
        if bytes.starts_with(b"RIFF") {
            codecs::wav_to_pcm(bytes)
        } else {
            Ok((codecs::bytes_to_samples(bytes), self.output_sample_rate))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{create_call_event_channel, create_event_channel};
    use crate::media::sink::NullSink;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::sync::Notify;
    use tokio::time::Duration;

    /// Synthesis stub whose per-text completion is released by the test,
    /// so completion order can be forced to differ from submission order.
    struct GatedTts {
        gates: parking_lot::Mutex<HashMap<String, Arc<Notify>>>,
        calls: AtomicUsize,
    }

    impl GatedTts {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gates: parking_lot::Mutex::new(HashMap::new()),
                calls: AtomicUsize::new(0),
            })
        }

        fn gate(&self, text: &str) -> Arc<Notify> {
            self.gates
                .lock()
                .entry(text.to_string())
                .or_insert_with(|| Arc::new(Notify::new()))
                .clone()
        }

        fn release(&self, text: &str) {
            self.gate(text).notify_one();
        }
    }

    #[async_trait]
    impl SynthesisClient for GatedTts {
        async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let gate = self.gate(text);
            gate.notified().await;
            // Headerless PCM payload; content is irrelevant to the tests.
            Ok(vec![0u8; 640])
        }
    }

    struct InstantTts;

    #[async_trait]
    impl SynthesisClient for InstantTts {
        async fn synthesize(&self, _text: &str) -> Result<Vec<u8>> {
            Ok(vec![0u8; 640])
        }
    }

    /// Sink that records playback order.
    struct RecordingSink {
        played: parking_lot::Mutex<Vec<usize>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                played: parking_lot::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl crate::media::sink::AudioSink for RecordingSink {
        async fn unlock(&self) -> Result<()> {
            Ok(())
        }
        async fn play(
            &self,
            samples: PcmBuf,
            _sample_rate: u32,
            _cancel: CancellationToken,
        ) -> Result<()> {
            self.played.lock().push(samples.len());
            Ok(())
        }
    }

    fn player_with(
        client: Arc<dyn SynthesisClient>,
        sink: Arc<dyn AudioSink>,
    ) -> (StreamingTtsPlayer, crate::event::CallEventReceiver) {
        let (tx, rx) = create_call_event_channel();
        (
            StreamingTtsPlayer::new(client, sink, tx, create_event_channel(), 16000),
            rx,
        )
    }

    async fn wait_until<F: FnMut() -> bool>(mut cond: F) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    /// Ordering-order property: playback order equals submission order even
    /// when a later sentence's synthesis resolves first.
    #[tokio::test]
    async fn test_playback_order_equals_submission_order() {
        struct OrderSink {
            order: parking_lot::Mutex<Vec<String>>,
        }
        #[async_trait]
        impl crate::media::sink::AudioSink for OrderSink {
            async fn unlock(&self) -> Result<()> {
                Ok(())
            }
            async fn play(
                &self,
                samples: PcmBuf,
                _sample_rate: u32,
                _cancel: CancellationToken,
            ) -> Result<()> {
                // Payload length encodes which sentence this was.
                self.order
                    .lock()
                    .push(if samples.len() == 320 { "A" } else { "B" }.to_string());
                Ok(())
            }
        }

        struct SizedTts;
        #[async_trait]
        impl SynthesisClient for SizedTts {
            async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
                if text == "A" {
                    // A's synthesis resolves after B's.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(vec![0u8; 640])
                } else {
                    Ok(vec![0u8; 1280])
                }
            }
        }

        let sink = Arc::new(OrderSink {
            order: parking_lot::Mutex::new(Vec::new()),
        });
        let (player, mut events) = player_with(Arc::new(SizedTts), sink.clone());
        player.speak("A");
        player.speak("B");
        assert_eq!(events.recv().await.unwrap(), CallEvent::TtsStarted);
        assert_eq!(events.recv().await.unwrap(), CallEvent::TtsEnded);
        assert!(!player.is_pending());
        assert_eq!(*sink.order.lock(), vec!["A", "B"]);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_on_empty_queue_is_noop() {
        let (player, mut events) = player_with(Arc::new(InstantTts), NullSink::new());
        player.stop();
        assert!(!player.is_playing());
        assert!(!player.is_pending());
        assert_eq!(player.queue_len(), 0);
        assert!(events.try_recv().is_err());
        // A fresh speak works right after a stop.
        player.speak("hello");
        wait_until(|| !player.is_pending()).await;
    }

    #[tokio::test]
    async fn test_stop_mid_queue_flushes_and_suppresses_end_event() {
        let tts = GatedTts::new();
        let (player, mut events) = player_with(tts.clone(), NullSink::new());
        player.speak("one");
        player.speak("two");
        player.speak("three");
        assert!(player.is_pending());
        // Synthesis is pre-fetched: all three requests are in flight before
        // any playback happens.
        wait_until(|| tts.calls.load(Ordering::SeqCst) == 3).await;
        // Let the first synthesis finish so playback has started.
        tts.release("one");
        wait_until(|| {
            matches!(
                events.try_recv(),
                Ok(CallEvent::TtsStarted)
            )
        })
        .await;
        player.stop();
        assert!(!player.is_playing());
        assert!(!player.is_pending());
        assert_eq!(player.queue_len(), 0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(
            events.try_recv().is_err(),
            "no TtsEnded after an interrupting stop"
        );
    }

    #[tokio::test]
    async fn test_synthesis_failure_skips_item_and_continues() {
        struct FlakyTts;
        #[async_trait]
        impl SynthesisClient for FlakyTts {
            async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
                if text == "bad" {
                    Err(anyhow!("backend unavailable"))
                } else {
                    Ok(vec![0u8; 640])
                }
            }
        }
        let sink = RecordingSink::new();
        let (player, mut events) = player_with(Arc::new(FlakyTts), sink.clone());
        player.speak("bad");
        player.speak("good");
        assert_eq!(events.recv().await.unwrap(), CallEvent::TtsStarted);
        assert_eq!(events.recv().await.unwrap(), CallEvent::TtsEnded);
        assert!(!player.is_pending());
        assert_eq!(sink.played.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_text_is_ignored() {
        let (player, _events) = player_with(Arc::new(InstantTts), NullSink::new());
        player.speak("   ");
        assert_eq!(player.queue_len(), 0);
        assert!(!player.is_pending());
    }
}
