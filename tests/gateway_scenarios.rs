//! End-to-end scenario tests exercising the turn pipeline, conversation
//! state, analytics recorder, and scheduled-action coordinator together,
//! using in-memory stub adapters instead of live HTTP backends.

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use voice_gateway::analytics::{Recorder, TurnRecord};
use voice_gateway::clients::{LlmClient, LlmReply, SttClient, SttResult, TtsClient, TtsResult};
use voice_gateway::config::LiveParams;
use voice_gateway::conversation::{Conversation, KnowledgeSnapshot};
use voice_gateway::dashboard::Broadcaster;
use voice_gateway::error::GatewayError;
use voice_gateway::pipeline::{process_turn, PipelineContext};
use voice_gateway::scheduler::location::{LocationCoordinator, LocationSender};
use voice_gateway::scheduler::ActionScheduler;
use voice_gateway::types::TokenUsage;
use voice_gateway::voice::Utterance;

struct QueueSttClient {
    responses: Mutex<Vec<Result<SttResult, GatewayError>>>,
}

#[async_trait]
impl SttClient for QueueSttClient {
    async fn transcribe(&self, _wav: &[u8], _language_hint: &str) -> Result<SttResult, GatewayError> {
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Err(GatewayError::permanent("stt", anyhow::anyhow!("queue exhausted")));
        }
        responses.remove(0)
    }
}

struct FixedLlmClient {
    text: String,
}

#[async_trait]
impl LlmClient for FixedLlmClient {
    async fn reply(
        &self,
        _system_prompt: &str,
        _history: &[voice_gateway::types::Message],
        _max_tokens: u32,
    ) -> Result<LlmReply, GatewayError> {
        Ok(LlmReply {
            text: self.text.clone(),
            usage: TokenUsage {
                input_tokens: 12,
                output_tokens: 6,
            },
        })
    }
}

struct FixedTtsClient {
    samples: usize,
}

#[async_trait]
impl TtsClient for FixedTtsClient {
    async fn synthesize(&self, _text: &str, _voice: &str, _speed: f32) -> Result<TtsResult, GatewayError> {
        Ok(TtsResult {
            pcm: vec![0i16; self.samples],
        })
    }
}

fn utterance(speech_ms: u64) -> Utterance {
    Utterance {
        mulaw: vec![0xFFu8; 1600],
        speech_duration: Duration::from_millis(speech_ms),
        peak_rms: 1200.0,
    }
}

fn greeting_turn(text: &str) -> TurnRecord {
    TurnRecord {
        turn_index: 0,
        speaker: voice_gateway::types::Speaker::Ai,
        text: text.to_string(),
        anchor_words: vec![],
        confidence: None,
        input_tokens: 0,
        output_tokens: 0,
        latency: Default::default(),
        flags: vec![],
    }
}

async fn setup(
    stt: Vec<Result<SttResult, GatewayError>>,
    llm_reply: &str,
    tts_samples: usize,
) -> (PipelineContext, Arc<Recorder>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let broadcaster = Arc::new(Broadcaster::new());
    let recorder = Arc::new(Recorder::new(dir.path().to_path_buf(), broadcaster.clone()));
    let ctx = PipelineContext {
        stt: Arc::new(QueueSttClient {
            responses: Mutex::new(stt),
        }),
        llm: Arc::new(FixedLlmClient {
            text: llm_reply.to_string(),
        }),
        tts: Arc::new(FixedTtsClient { samples: tts_samples }),
        recorder: recorder.clone(),
        broadcaster,
    };
    (ctx, recorder, dir)
}

/// Scenario 1: greeting-only call. No media is ever sent, so the only
/// recorded turn is the AI greeting at turn 0.
#[tokio::test]
async fn greeting_only_call_reports_one_ai_turn() {
    let (_ctx, recorder, _dir) = setup(vec![], "unused", 19200).await;
    recorder.start_call("C1").await;
    recorder.record_turn("C1", greeting_turn("Buongiorno, come posso aiutarla?")).await;
    let summary = recorder.finalize_call("C1").await.unwrap();
    assert_eq!(summary.total_turns, 1);
    assert_eq!(summary.ai_turns, 1);
    assert_eq!(summary.caller_turns, 0);
}

/// Scenario 2: single exchange. STT/LLM/TTS stubs produce a transcript, a
/// reply, and synthesized audio; latency components sum to the total.
#[tokio::test]
async fn single_exchange_produces_turn_with_additive_latency() {
    let (ctx, recorder, _dir) = setup(
        vec![Ok(SttResult {
            transcript: "Pronto".into(),
            confidence: 0.92,
        })],
        "Salve, mi dica.",
        19200,
    )
    .await;
    recorder.start_call("C1").await;
    let mut conversation =
        Conversation::start("C1", "+390000", &KnowledgeSnapshot::default(), "Ciao", 4);
    let params = LiveParams::default();

    let outcome = process_turn(&ctx, "C1", 1, &utterance(3200), &mut conversation, &params)
        .await
        .expect("expected a turn outcome");

    assert_eq!(outcome.ai_reply.as_deref(), Some("Salve, mi dica."));
    assert_eq!(outcome.tts_pcm.len(), 19200);
    assert_eq!(conversation.turn_count(), 1);

    let (_events, turns, _summary) = {
        recorder.finalize_call("C1").await;
        recorder.read_call("C1").await.unwrap()
    };
    let turn = &turns[0];
    let latency = &turn.latency;
    let sum = latency.silence_detection_ms.unwrap_or(0)
        + latency.stt_ms.unwrap_or(0)
        + latency.llm_ms.unwrap_or(0)
        + latency.tts_ms.unwrap_or(0);
    assert_eq!(latency.total_ms.unwrap(), sum);
}

/// Scenario 3: quick-reply shortcut bypasses the LLM entirely.
#[tokio::test]
async fn quick_reply_reports_zero_cost_usage() {
    let (ctx, recorder, _dir) = setup(
        vec![Ok(SttResult {
            transcript: "grazie".into(),
            confidence: 0.97,
        })],
        "should never be used",
        19200,
    )
    .await;
    recorder.start_call("C1").await;
    let mut conversation =
        Conversation::start("C1", "+390000", &KnowledgeSnapshot::default(), "Ciao", 4);
    let params = LiveParams::default();

    let outcome = process_turn(&ctx, "C1", 1, &utterance(800), &mut conversation, &params)
        .await
        .unwrap();

    assert_eq!(outcome.ai_reply.as_deref(), Some("Prego."));
    assert_eq!(conversation.last_usage.input_tokens, 0);
    assert_eq!(conversation.last_usage.output_tokens, 0);
}

/// Scenario 4: a terminal phrase marks the outcome goodbye so the session
/// layer knows to request hangup after playback drains.
#[tokio::test]
async fn terminal_phrase_marks_outcome_as_goodbye() {
    let (ctx, recorder, _dir) = setup(
        vec![Ok(SttResult {
            transcript: "Va bene, grazie mille".into(),
            confidence: 0.9,
        })],
        "Arrivederci e buona giornata",
        19200,
    )
    .await;
    recorder.start_call("C1").await;
    let mut conversation =
        Conversation::start("C1", "+390000", &KnowledgeSnapshot::default(), "Ciao", 4);
    let params = LiveParams::default();

    let outcome = process_turn(&ctx, "C1", 1, &utterance(2000), &mut conversation, &params)
        .await
        .unwrap();

    assert!(outcome.is_goodbye);
}

/// Scenario 5: STT stub errors twice (its one retry is also transient), so
/// the turn yields no outcome, no LLM/TTS work, and the conversation history
/// is left untouched for the next utterance. The event log carries both the
/// retry and the final failure.
#[tokio::test]
async fn stt_failure_skips_turn_without_mutating_conversation() {
    let transient = || GatewayError::transient("stt", anyhow::anyhow!("upstream 500"));
    let (ctx, recorder, _dir) = setup(vec![Err(transient()), Err(transient())], "unused", 0).await;
    recorder.start_call("C1").await;
    let mut conversation =
        Conversation::start("C1", "+390000", &KnowledgeSnapshot::default(), "Ciao", 4);
    let params = LiveParams::default();
    let history_len_before = conversation.full_history().len();

    let outcome = process_turn(&ctx, "C1", 1, &utterance(1000), &mut conversation, &params).await;

    assert!(outcome.is_none());
    assert_eq!(conversation.full_history().len(), history_len_before);
    assert_eq!(conversation.turn_count(), 0);

    let (events, _turns, _summary) = {
        recorder.finalize_call("C1").await;
        recorder.read_call("C1").await.unwrap()
    };
    let event_names: Vec<_> = events.iter().map(|e| e.event_type).collect();
    assert!(event_names.contains(&voice_gateway::analytics::EventType::ApiRetry));
    assert!(event_names.contains(&voice_gateway::analytics::EventType::WhisperFailed));
}

/// Scenario 6: a dashboard-initiated cancel before the timer fires prevents
/// the scheduled location send and reports no location_sent broadcast.
#[tokio::test]
async fn scheduled_location_send_can_be_cancelled_before_timeout() {
    struct CountingSender {
        count: Arc<AtomicUsize>,
    }
    #[async_trait]
    impl LocationSender for CountingSender {
        async fn send(&self, _call_id: &str, _caller: &str) -> AnyResult<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let count = Arc::new(AtomicUsize::new(0));
    let broadcaster = Arc::new(Broadcaster::new());
    let coordinator = LocationCoordinator::new(
        Arc::new(ActionScheduler::new()),
        Arc::new(CountingSender { count: count.clone() }),
        broadcaster,
    );

    coordinator
        .start_pending("TEST-ABC", "+390000", 0.7, "caller asked for directions", Duration::from_millis(60))
        .await;
    // Simulate a dashboard cancel_location arriving well before the timeout.
    tokio::time::sleep(Duration::from_millis(10)).await;
    coordinator.cancel("TEST-ABC").await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);
}
