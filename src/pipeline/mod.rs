//! Turn pipeline (C4): serializes STT -> LLM -> TTS for one caller utterance
//! and emits the C7 event sequence at each stage.
//!
//! Grounded on `voice/coordinator.rs`'s sequential stage-execution pattern
//! and the original's `routers/twilio.backup.py::process_speech`, which is
//! the canonical turn sequence this reimplements: silence-detected ->
//! whisper -> claude -> tts -> playback, with a goodbye check at the end.

use crate::analytics::events::EventType;
use crate::analytics::quality::{anchor_words, similarity_ratio};
use crate::analytics::{LatencyBreakdown, Recorder, TurnRecord};
use crate::clients::{LlmClient, SttClient, TtsClient};
use crate::config::LiveParams;
use crate::conversation::Conversation;
use crate::dashboard::Broadcaster;
use crate::error::GatewayError;
use crate::types::{Speaker, TokenUsage};
use crate::voice::Utterance;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

pub const ECHO_THRESHOLD: f64 = 0.60;
pub const REPEAT_THRESHOLD: f64 = 0.80;

/// Runs `call` once; on a `Transient` failure, emits `ApiRetry`, backs off,
/// and runs it exactly one more time (SPEC_FULL.md §4.3/§9.7: "one retry
/// with small backoff; every retry emits an `API_RETRY`-flagged event").
/// `Permanent` failures and a failed retry both propagate straight through.
async fn with_retry<T, F, Fut>(
    recorder: &Recorder,
    call_id: &str,
    turn_index: u32,
    mut call: F,
) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    match call().await {
        Ok(value) => Ok(value),
        Err(GatewayError::Transient { stage, source }) => {
            recorder
                .emit(
                    call_id,
                    EventType::ApiRetry,
                    Some(turn_index),
                    json!({"stage": stage, "error": source.to_string()}),
                )
                .await;
            tokio::time::sleep(crate::clients::RETRY_BACKOFF).await;
            call().await
        }
        Err(other) => Err(other),
    }
}

pub struct PipelineContext {
    pub stt: Arc<dyn SttClient>,
    pub llm: Arc<dyn LlmClient>,
    pub tts: Arc<dyn TtsClient>,
    pub recorder: Arc<Recorder>,
    pub broadcaster: Arc<Broadcaster>,
}

/// Outcome of one turn, consumed by the call session to drive playback and
/// the hangup decision.
pub struct TurnOutcome {
    pub turn_index: u32,
    pub ai_reply: Option<String>,
    pub tts_pcm: Vec<i16>,
    pub is_goodbye: bool,
}

/// Runs the full STT -> quality-checks -> LLM -> TTS sequence for one
/// utterance. `turn_index` is the caller-turn index being produced (the
/// session allocates it before calling in, so event ordering is observable
/// even if this function errors out early).
pub async fn process_turn(
    ctx: &PipelineContext,
    call_id: &str,
    turn_index: u32,
    utterance: &Utterance,
    conversation: &mut Conversation,
    params: &LiveParams,
) -> Option<TurnOutcome> {
    let recorder = &ctx.recorder;

    recorder
        .emit(
            call_id,
            EventType::SilenceDetected,
            Some(turn_index),
            json!({
                "speech_duration_ms": utterance.speech_duration.as_millis() as u64,
                "bytes": utterance.mulaw.len(),
                "peak_rms": utterance.peak_rms,
            }),
        )
        .await;

    let wav = crate::audio::prepare_for_stt(&utterance.mulaw);

    recorder
        .emit(call_id, EventType::WhisperStarted, Some(turn_index), json!({}))
        .await;
    ctx.broadcaster.processing(call_id, "transcribing").await;

    let stt_start = Instant::now();
    let stt_result = with_retry(recorder, call_id, turn_index, || ctx.stt.transcribe(&wav, "it")).await;
    let stt_ms = stt_start.elapsed().as_millis() as u64;

    let stt_result = match stt_result {
        Ok(r) => r,
        Err(err) => {
            recorder
                .emit(
                    call_id,
                    EventType::WhisperFailed,
                    Some(turn_index),
                    json!({"error": err.to_string(), "duration_ms": stt_ms}),
                )
                .await;
            return None;
        }
    };

    recorder
        .emit(
            call_id,
            EventType::WhisperCompleted,
            Some(turn_index),
            json!({
                "transcript": stt_result.transcript,
                "duration_ms": stt_ms,
                "confidence": stt_result.confidence,
            }),
        )
        .await;

    if stt_result.transcript.trim().is_empty() {
        return None;
    }

    ctx.broadcaster
        .transcript(call_id, "caller", &stt_result.transcript, turn_index, Some(stt_ms))
        .await;

    let mut flags: Vec<String> = Vec::new();

    if stt_result.confidence < params.confidence_threshold {
        recorder
            .emit(
                call_id,
                EventType::LowConfidence,
                Some(turn_index),
                json!({"confidence": stt_result.confidence}),
            )
            .await;
        flags.push("low_confidence".to_string());
    }

    for prior_ai in conversation.recent_ai_outputs(3) {
        if similarity_ratio(&stt_result.transcript, prior_ai) >= ECHO_THRESHOLD {
            recorder
                .emit(call_id, EventType::EchoDetected, Some(turn_index), json!({}))
                .await;
            flags.push("echo".to_string());
            break;
        }
    }

    for prior_caller in conversation.recent_caller_transcripts(5) {
        if similarity_ratio(&stt_result.transcript, prior_caller) >= REPEAT_THRESHOLD {
            recorder
                .emit(call_id, EventType::RepeatDetected, Some(turn_index), json!({}))
                .await;
            flags.push("repeat".to_string());
            break;
        }
    }

    // Quick-reply shortcut: synthetic zero-cost events, no LLM call.
    let llm_start = Instant::now();
    let (reply_text, usage, via_quick_reply) =
        if let Some(quick) = conversation.quick_reply(&stt_result.transcript) {
            recorder
                .emit(
                    call_id,
                    EventType::ClaudeStarted,
                    Some(turn_index),
                    json!({"quick_reply": true}),
                )
                .await;
            recorder
                .emit(
                    call_id,
                    EventType::ClaudeCompleted,
                    Some(turn_index),
                    json!({"response": quick, "duration_ms": 0, "tokens_in": 0, "tokens_out": 0}),
                )
                .await;
            (quick, TokenUsage::default(), true)
        } else {
            recorder
                .emit(
                    call_id,
                    EventType::ClaudeStarted,
                    Some(turn_index),
                    json!({"context_size": conversation.context_window().len()}),
                )
                .await;
            ctx.broadcaster.processing(call_id, "thinking").await;

            let reply = with_retry(recorder, call_id, turn_index, || {
                ctx.llm.reply(
                    conversation.system_prompt(),
                    conversation.context_window(),
                    params.llm_max_tokens,
                )
            })
            .await;

            match reply {
                Ok(reply) => {
                    let llm_ms = llm_start.elapsed().as_millis() as u64;
                    recorder
                        .emit(
                            call_id,
                            EventType::ClaudeCompleted,
                            Some(turn_index),
                            json!({
                                "response": reply.text,
                                "duration_ms": llm_ms,
                                "tokens_in": reply.usage.input_tokens,
                                "tokens_out": reply.usage.output_tokens,
                            }),
                        )
                        .await;
                    (reply.text, reply.usage, false)
                }
                Err(err) => {
                    recorder
                        .emit(
                            call_id,
                            EventType::ClaudeFailed,
                            Some(turn_index),
                            json!({"error": err.to_string()}),
                        )
                        .await;
                    (crate::clients::llm::FALLBACK_REPLY.to_string(), TokenUsage::default(), false)
                }
            }
        };
    let llm_ms = if via_quick_reply { 0 } else { llm_start.elapsed().as_millis() as u64 };

    conversation.record_turn(&stt_result.transcript, &reply_text, usage);
    ctx.broadcaster
        .transcript(call_id, "ai", &reply_text, turn_index, Some(llm_ms))
        .await;

    let is_goodbye = conversation.is_goodbye(&reply_text);

    recorder
        .emit(call_id, EventType::TtsStarted, Some(turn_index), json!({}))
        .await;
    ctx.broadcaster.processing(call_id, "speaking").await;

    let tts_start = Instant::now();
    let tts_result = with_retry(recorder, call_id, turn_index, || {
        ctx.tts.synthesize(&reply_text, &params.tts_voice, params.tts_speed)
    })
    .await;
    let tts_ms = tts_start.elapsed().as_millis() as u64;

    let tts_pcm = match tts_result {
        Ok(result) if !result.pcm.is_empty() => {
            let audio_duration_ms =
                (result.pcm.len() as f64 / crate::audio::TTS_SAMPLE_RATE as f64 * 1000.0) as u64;
            recorder
                .emit(
                    call_id,
                    EventType::TtsCompleted,
                    Some(turn_index),
                    json!({"duration_ms": tts_ms, "audio_bytes": result.pcm.len() * 2, "audio_duration_ms": audio_duration_ms}),
                )
                .await;
            result.pcm
        }
        Ok(_) => {
            recorder
                .emit(call_id, EventType::TtsFailed, Some(turn_index), json!({"duration_ms": tts_ms}))
                .await;
            Vec::new()
        }
        Err(err) => {
            recorder
                .emit(
                    call_id,
                    EventType::TtsFailed,
                    Some(turn_index),
                    json!({"error": err.to_string(), "duration_ms": tts_ms}),
                )
                .await;
            Vec::new()
        }
    };

    let total_ms = utterance.speech_duration.as_millis() as u64 + stt_ms + llm_ms + tts_ms;

    recorder
        .record_turn(
            call_id,
            TurnRecord {
                turn_index,
                speaker: Speaker::Caller,
                text: stt_result.transcript.clone(),
                anchor_words: anchor_words(&stt_result.transcript),
                confidence: Some(stt_result.confidence),
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                latency: LatencyBreakdown {
                    silence_detection_ms: Some(utterance.speech_duration.as_millis() as u64),
                    stt_ms: Some(stt_ms),
                    llm_ms: Some(llm_ms),
                    tts_ms: Some(tts_ms),
                    overhead_ms: Some(0),
                    total_ms: Some(total_ms),
                },
                flags,
            },
        )
        .await;

    Some(TurnOutcome {
        turn_index,
        ai_reply: Some(reply_text),
        tts_pcm,
        is_goodbye,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::llm::tests::StubLlmClient;
    use crate::clients::stt::tests::StubSttClient;
    use crate::clients::stt::SttResult;
    use crate::clients::tts::tests::StubTtsClient;
    use crate::conversation::KnowledgeSnapshot;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn ctx(stt: SttResult, llm_reply: &str) -> (PipelineContext, Arc<Recorder>) {
        let broadcaster = Arc::new(Broadcaster::new());
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::new(dir.path().to_path_buf(), broadcaster.clone()));
        let pipeline_ctx = PipelineContext {
            stt: Arc::new(StubSttClient {
                responses: StdMutex::new(vec![stt]),
            }),
            llm: Arc::new(StubLlmClient {
                reply_text: llm_reply.to_string(),
            }),
            tts: Arc::new(StubTtsClient { samples: 24000 }),
            recorder: recorder.clone(),
            broadcaster,
        };
        (pipeline_ctx, recorder)
    }

    fn utterance() -> Utterance {
        Utterance {
            mulaw: vec![0xFFu8; 1600],
            speech_duration: Duration::from_millis(800),
            peak_rms: 900.0,
        }
    }

    #[tokio::test]
    async fn full_turn_produces_outcome_and_records_latencies() {
        let (ctx, recorder) = ctx(
            SttResult {
                transcript: "Pronto".into(),
                confidence: 0.9,
            },
            "Salve, mi dica.",
        );
        recorder.start_call("C1").await;
        let mut conversation = Conversation::start(
            "C1",
            "+390000",
            &KnowledgeSnapshot::default(),
            "Buongiorno",
            4,
        );
        let params = LiveParams::default();
        let outcome = process_turn(&ctx, "C1", 1, &utterance(), &mut conversation, &params)
            .await
            .expect("expected a turn outcome");
        assert_eq!(outcome.ai_reply.as_deref(), Some("Salve, mi dica."));
        assert!(!outcome.is_goodbye);
        assert_eq!(outcome.tts_pcm.len(), 24000);
    }

    #[tokio::test]
    async fn empty_transcript_yields_no_outcome() {
        let (ctx, recorder) = ctx(
            SttResult {
                transcript: "".into(),
                confidence: 0.0,
            },
            "unused",
        );
        recorder.start_call("C1").await;
        let mut conversation =
            Conversation::start("C1", "+390000", &KnowledgeSnapshot::default(), "Ciao", 4);
        let params = LiveParams::default();
        let outcome = process_turn(&ctx, "C1", 1, &utterance(), &mut conversation, &params).await;
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn quick_reply_skips_llm_and_reports_zero_usage() {
        let (ctx, recorder) = ctx(
            SttResult {
                transcript: "grazie".into(),
                confidence: 0.95,
            },
            "should not be used",
        );
        recorder.start_call("C1").await;
        let mut conversation =
            Conversation::start("C1", "+390000", &KnowledgeSnapshot::default(), "Ciao", 4);
        let params = LiveParams::default();
        let outcome = process_turn(&ctx, "C1", 1, &utterance(), &mut conversation, &params)
            .await
            .unwrap();
        assert_eq!(outcome.ai_reply.as_deref(), Some("Prego."));
        assert_eq!(conversation.last_usage.input_tokens, 0);
    }

    #[tokio::test]
    async fn goodbye_phrase_marks_outcome_terminal() {
        let (ctx, recorder) = ctx(
            SttResult {
                transcript: "Va bene".into(),
                confidence: 0.9,
            },
            "Arrivederci e buona giornata",
        );
        recorder.start_call("C1").await;
        let mut conversation =
            Conversation::start("C1", "+390000", &KnowledgeSnapshot::default(), "Ciao", 4);
        let params = LiveParams::default();
        let outcome = process_turn(&ctx, "C1", 1, &utterance(), &mut conversation, &params)
            .await
            .unwrap();
        assert!(outcome.is_goodbye);
    }
}
