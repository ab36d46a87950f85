//! Call session / media handler (C6): drives the carrier WebSocket, the
//! segmenter, the turn pipeline, and the hangup decision for one call.
//!
//! Grounded on `server/realtime_voice.rs`'s `handle_voice_session` (split
//! sink/stream, dedicated outbound mpsc + sender task, inline state machine)
//! and the original's `routers/twilio.backup.py::media_stream` for the
//! carrier event vocabulary and playback pacing.

use crate::analytics::events::EventType;
use crate::analytics::{LatencyBreakdown, TurnRecord};
use crate::clients::HangupClient;
use crate::config::LiveParams;
use crate::conversation::{Conversation, KnowledgeSnapshot};
use crate::dashboard::Broadcaster;
use crate::pipeline::{self, PipelineContext};
use crate::scheduler::ActionScheduler;
use crate::voice::{Segmenter, SegmenterConfig};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Inbound carrier frame discriminants (closed set; unknown values are
/// logged and dropped per SPEC_FULL.md §9).
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum CarrierInbound {
    Connected,
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        #[serde(rename = "customParameters", default)]
        custom_parameters: CustomParameters,
    },
    Media {
        media: MediaPayload,
    },
    Mark {
        mark: MarkPayload,
    },
    Stop,
}

#[derive(Debug, Deserialize, Default)]
struct CustomParameters {
    #[serde(default)]
    call_sid: String,
    #[serde(default)]
    caller: String,
}

#[derive(Debug, Deserialize)]
struct MediaPayload {
    payload: String,
}

#[derive(Debug, Deserialize)]
struct MarkPayload {
    #[allow(dead_code)]
    name: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum CarrierOutbound {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: OutboundMediaPayload,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: OutboundMarkPayload,
    },
}

#[derive(Debug, Serialize)]
struct OutboundMediaPayload {
    payload: String,
}

#[derive(Debug, Serialize)]
struct OutboundMarkPayload {
    name: String,
}

/// Frames produced for the carrier socket, paced by the sender task.
enum PlaybackFrame {
    Audio(Vec<u8>),
    Mark(String),
}

const FRAME_BYTES: usize = 640; // ~80ms of 8kHz mulaw
const FRAME_PACE: Duration = Duration::from_millis(20);

pub struct SessionDeps {
    pub pipeline: PipelineContext,
    pub hangup: Arc<dyn HangupClient>,
    pub scheduler: Arc<ActionScheduler>,
    pub broadcaster: Arc<Broadcaster>,
    pub knowledge: KnowledgeSnapshot,
    pub greeting: String,
    pub live_params: Arc<std::sync::RwLock<LiveParams>>,
}

pub async fn handle_carrier_session(socket: WebSocket, deps: Arc<SessionDeps>) {
    use futures_util::{SinkExt, StreamExt};

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (playback_tx, mut playback_rx) = mpsc::unbounded_channel::<PlaybackFrame>();
    let stream_sid_holder = Arc::new(std::sync::Mutex::new(String::new()));
    let stream_sid_for_sender = stream_sid_holder.clone();

    let sender_task = tokio::spawn(async move {
        while let Some(frame) = playback_rx.recv().await {
            let stream_sid = stream_sid_for_sender.lock().unwrap().clone();
            let outbound = match frame {
                PlaybackFrame::Audio(chunk) => CarrierOutbound::Media {
                    stream_sid,
                    media: OutboundMediaPayload {
                        payload: crate::audio::base64_encode(&chunk),
                    },
                },
                PlaybackFrame::Mark(name) => CarrierOutbound::Mark {
                    stream_sid,
                    mark: OutboundMarkPayload { name },
                },
            };
            let text = serde_json::to_string(&outbound).unwrap_or_default();
            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
            tokio::time::sleep(FRAME_PACE).await;
        }
    });

    let mut call_id = String::new();
    let mut caller = String::new();
    let mut segmenter: Option<Segmenter> = None;
    let mut conversation: Option<Conversation> = None;
    let mut turn_index: u32 = 0;
    let mut ended = false;

    while let Some(Ok(msg)) = ws_rx.next().await {
        let WsMessage::Text(text) = msg else { continue };
        let inbound: CarrierInbound = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) => {
                warn!("malformed carrier frame, dropping");
                continue;
            }
        };

        match inbound {
            CarrierInbound::Connected => {}
            CarrierInbound::Start {
                stream_sid,
                custom_parameters,
            } => {
                *stream_sid_holder.lock().unwrap() = stream_sid;
                call_id = custom_parameters.call_sid;
                caller = custom_parameters.caller;
                info!(call_id = %call_id, "carrier stream started");

                deps.pipeline.recorder.start_call(&call_id).await;
                deps.pipeline
                    .recorder
                    .emit(&call_id, EventType::CallStarted, None, json!({"caller": caller}))
                    .await;
                deps.pipeline
                    .recorder
                    .emit(&call_id, EventType::StreamConnected, None, json!({}))
                    .await;
                deps.broadcaster.call_started(&call_id, &caller, "gateway").await;

                let params = deps.live_params.read().unwrap().clone();
                segmenter = Some(Segmenter::new(
                    SegmenterConfig {
                        silence_ms: params.silence_duration_ms,
                        min_speech_ms: params.min_speech_duration_ms,
                        silence_rms: params.silence_threshold as f64,
                    },
                    Duration::from_millis(20),
                ));

                let mut conv = Conversation::start(
                    call_id.clone(),
                    caller.clone(),
                    &deps.knowledge,
                    deps.greeting.clone(),
                    params.context_turns,
                );
                run_greeting(&deps, &call_id, &mut conv, &params, &playback_tx).await;
                conversation = Some(conv);
            }
            CarrierInbound::Media { media } => {
                if ended {
                    continue;
                }
                let Some(seg) = segmenter.as_mut() else { continue };
                let Ok(frame) = crate::audio::base64_decode(&media.payload) else {
                    continue;
                };
                if let Some(utterance) = seg.push(&frame) {
                    turn_index += 1;
                    let params = deps.live_params.read().unwrap().clone();
                    if let Some(conv) = conversation.as_mut() {
                        let outcome = pipeline::process_turn(
                            &deps.pipeline,
                            &call_id,
                            turn_index,
                            &utterance,
                            conv,
                            &params,
                        )
                        .await;

                        if let Some(outcome) = outcome {
                            play_reply(&deps, &call_id, &outcome, &playback_tx).await;
                            if outcome.is_goodbye {
                                ended = true;
                                request_hangup(&deps, &call_id, &outcome).await;
                            }
                        }
                        deps.broadcaster.processing(&call_id, "listening").await;
                    }
                }
            }
            CarrierInbound::Mark { .. } => {}
            CarrierInbound::Stop => break,
        }
    }

    if let Some(seg) = segmenter.as_mut() {
        if let Some(utterance) = seg.flush() {
            if let Some(conv) = conversation.as_mut() {
                turn_index += 1;
                let params = deps.live_params.read().unwrap().clone();
                if let Some(outcome) = pipeline::process_turn(
                    &deps.pipeline,
                    &call_id,
                    turn_index,
                    &utterance,
                    conv,
                    &params,
                )
                .await
                {
                    play_reply(&deps, &call_id, &outcome, &playback_tx).await;
                }
            }
        }
    }

    if !call_id.is_empty() {
        let summary = deps.pipeline.recorder.finalize_call(&call_id).await;
        deps.pipeline
            .recorder
            .emit(&call_id, EventType::CallEnded, None, json!({}))
            .await;
        deps.broadcaster
            .call_ended(&call_id, summary.and_then(|s| s.duration_seconds))
            .await;
        deps.scheduler.cancel(&call_id).await;
    }

    drop(playback_tx);
    let _ = sender_task.await;
}

async fn run_greeting(
    deps: &SessionDeps,
    call_id: &str,
    conversation: &mut Conversation,
    params: &LiveParams,
    playback_tx: &mpsc::UnboundedSender<PlaybackFrame>,
) {
    deps.pipeline
        .recorder
        .emit(call_id, EventType::GreetingStarted, Some(0), json!({}))
        .await;

    deps.pipeline
        .recorder
        .emit(call_id, EventType::TtsStarted, Some(0), json!({}))
        .await;
    let greeting_text = conversation.full_history()[0].text.clone();
    let tts_start = std::time::Instant::now();
    let tts = deps
        .pipeline
        .tts
        .synthesize(&greeting_text, &params.tts_voice, params.tts_speed)
        .await;
    let tts_ms = tts_start.elapsed().as_millis() as u64;

    if let Ok(result) = tts {
        if !result.pcm.is_empty() {
            deps.pipeline
                .recorder
                .emit(call_id, EventType::TtsCompleted, Some(0), json!({}))
                .await;
            deps.pipeline
                .recorder
                .emit(call_id, EventType::PlaybackStarted, Some(0), json!({}))
                .await;
            send_pcm(&result.pcm, playback_tx);
            deps.pipeline
                .recorder
                .emit(call_id, EventType::PlaybackCompleted, Some(0), json!({}))
                .await;
        }
    }

    deps.pipeline
        .recorder
        .record_turn(
            call_id,
            TurnRecord {
                turn_index: 0,
                speaker: crate::types::Speaker::Ai,
                text: greeting_text,
                anchor_words: Vec::new(),
                confidence: None,
                input_tokens: 0,
                output_tokens: 0,
                latency: LatencyBreakdown {
                    silence_detection_ms: None,
                    stt_ms: None,
                    llm_ms: None,
                    tts_ms: Some(tts_ms),
                    overhead_ms: None,
                    total_ms: Some(tts_ms),
                },
                flags: Vec::new(),
            },
        )
        .await;

    deps.pipeline
        .recorder
        .emit(call_id, EventType::GreetingCompleted, Some(0), json!({}))
        .await;
    deps.broadcaster.processing(call_id, "listening").await;
}

async fn play_reply(
    deps: &SessionDeps,
    call_id: &str,
    outcome: &pipeline::TurnOutcome,
    playback_tx: &mpsc::UnboundedSender<PlaybackFrame>,
) {
    if outcome.tts_pcm.is_empty() {
        return;
    }
    deps.pipeline
        .recorder
        .emit(
            call_id,
            EventType::PlaybackStarted,
            Some(outcome.turn_index),
            json!({}),
        )
        .await;
    send_pcm(&outcome.tts_pcm, playback_tx);
    deps.pipeline
        .recorder
        .emit(
            call_id,
            EventType::PlaybackCompleted,
            Some(outcome.turn_index),
            json!({}),
        )
        .await;
}

/// Resamples/encodes PCM to carrier mulaw and enqueues it in fixed-size,
/// paced frames on the sender task's channel.
fn send_pcm(pcm_24k: &[i16], playback_tx: &mpsc::UnboundedSender<PlaybackFrame>) {
    let pcm_8k = crate::audio::resample_linear(pcm_24k, crate::audio::TTS_SAMPLE_RATE, crate::audio::CARRIER_SAMPLE_RATE);
    let mulaw = crate::audio::pcm_to_mulaw(&pcm_8k);
    for chunk in mulaw.chunks(FRAME_BYTES) {
        let _ = playback_tx.send(PlaybackFrame::Audio(chunk.to_vec()));
    }
    let _ = playback_tx.send(PlaybackFrame::Mark("utterance-end".to_string()));
}

/// Waits for the played-back audio to drain, then requests carrier hangup.
async fn request_hangup(deps: &SessionDeps, call_id: &str, outcome: &pipeline::TurnOutcome) {
    let audio_duration_ms =
        (outcome.tts_pcm.len() as f64 / crate::audio::TTS_SAMPLE_RATE as f64 * 1000.0) as u64;
    let wait = Duration::from_millis(audio_duration_ms + 500);
    tokio::time::sleep(wait).await;

    if let Err(err) = deps.hangup.hangup(call_id).await {
        warn!(call_id, error = %err, "hangup request failed");
        deps.broadcaster.error(call_id, "hangup_failed", &err.to_string()).await;
    }
}
