//! Analytics recorder (C7): event emission, turn/call aggregation, and
//! append-only JSON-line persistence.
//!
//! Grounded on `metrics/execution.rs`'s `MetricsStore` for the
//! in-memory-authoritative + JSON-persistence shape (an `Arc<RwLock<...>>`
//! guarding state that's independently durable to disk), generalized from a
//! single global store to one instance per call directory.

pub mod events;
pub mod quality;

pub use events::{Event, EventType};

use crate::dashboard::Broadcaster;
use crate::types::Speaker;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LatencyBreakdown {
    pub silence_detection_ms: Option<u64>,
    pub stt_ms: Option<u64>,
    pub llm_ms: Option<u64>,
    pub tts_ms: Option<u64>,
    pub overhead_ms: Option<u64>,
    pub total_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn_index: u32,
    pub speaker: Speaker,
    pub text: String,
    pub anchor_words: Vec<String>,
    pub confidence: Option<f64>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency: LatencyBreakdown,
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CallSummary {
    pub call_id: String,
    pub total_turns: u32,
    pub caller_turns: u32,
    pub ai_turns: u32,
    pub duration_seconds: Option<f64>,
    pub avg_total_ms: Option<f64>,
    pub avg_stt_ms: Option<f64>,
    pub avg_llm_ms: Option<f64>,
    pub avg_tts_ms: Option<f64>,
    pub p95_total_ms: Option<u64>,
    pub avg_confidence: Option<f64>,
    pub slowest_turn_index: Option<u32>,
    pub slowest_component: Option<String>,
    pub total_input_tokens: u32,
    pub total_output_tokens: u32,
    pub flags_summary: HashMap<String, u32>,
}

struct CallState {
    events: Vec<Event>,
    turns: Vec<TurnRecord>,
    next_event_id: AtomicU64,
    started_at: chrono::DateTime<chrono::Utc>,
}

/// Per-process analytics recorder. One instance is shared across all calls;
/// call-scoped state lives in an internal map keyed by call_id.
pub struct Recorder {
    analytics_root: PathBuf,
    calls: RwLock<HashMap<String, CallState>>,
    broadcaster: Arc<Broadcaster>,
}

impl Recorder {
    pub fn new(analytics_root: PathBuf, broadcaster: Arc<Broadcaster>) -> Self {
        Recorder {
            analytics_root,
            calls: RwLock::new(HashMap::new()),
            broadcaster,
        }
    }

    pub async fn start_call(&self, call_id: &str) {
        let mut calls = self.calls.write().await;
        calls.insert(
            call_id.to_string(),
            CallState {
                events: Vec::new(),
                turns: Vec::new(),
                next_event_id: AtomicU64::new(0),
                started_at: chrono::Utc::now(),
            },
        );
        let dir = self.call_dir(call_id);
        if let Err(err) = tokio::fs::create_dir_all(&dir).await {
            warn!(call_id, error = %err, "failed to create analytics directory");
        }
    }

    fn call_dir(&self, call_id: &str) -> PathBuf {
        self.analytics_root.join(call_id)
    }

    /// Emits an event: appends to memory, appends a JSON line to disk,
    /// forwards to the dashboard. Disk failure degrades to memory-only.
    pub async fn emit(
        &self,
        call_id: &str,
        event_type: EventType,
        turn_index: Option<u32>,
        payload: serde_json::Value,
    ) {
        let event = {
            let calls = self.calls.read().await;
            let Some(state) = calls.get(call_id) else {
                warn!(call_id, "emit() called for unknown call");
                return;
            };
            let id = state.next_event_id.fetch_add(1, Ordering::SeqCst);
            Event::new(id, call_id, event_type, turn_index, payload)
        };

        {
            let mut calls = self.calls.write().await;
            if let Some(state) = calls.get_mut(call_id) {
                state.events.push(event.clone());
            }
        }

        self.append_event_line(call_id, &event).await;
        self.broadcaster.analytics_event(call_id, &event).await;
    }

    async fn append_event_line(&self, call_id: &str, event: &Event) {
        let path = self.call_dir(call_id).join("events.jsonl");
        let line = match serde_json::to_string(event) {
            Ok(l) => l,
            Err(err) => {
                warn!(call_id, error = %err, "failed to serialize event");
                return;
            }
        };
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await
        }
        .await;
        if let Err(err) = result {
            warn!(call_id, error = %err, "failed to persist event to disk");
        }
    }

    pub async fn record_turn(&self, call_id: &str, turn: TurnRecord) {
        let mut calls = self.calls.write().await;
        if let Some(state) = calls.get_mut(call_id) {
            state.turns.push(turn);
        }
    }

    /// Finalizes a call: writes `turns.json` and `summary.json`, returns the
    /// computed summary.
    pub async fn finalize_call(&self, call_id: &str) -> Option<CallSummary> {
        let (turns, started_at) = {
            let calls = self.calls.read().await;
            let state = calls.get(call_id)?;
            (state.turns.clone(), state.started_at)
        };

        let summary = compute_summary(call_id, &turns, started_at);

        let dir = self.call_dir(call_id);
        if let Err(err) = write_json(&dir.join("turns.json"), &turns).await {
            warn!(call_id, error = %err, "failed to write turns.json");
        }
        if let Err(err) = write_json(&dir.join("summary.json"), &summary).await {
            warn!(call_id, error = %err, "failed to write summary.json");
        }

        let mut calls = self.calls.write().await;
        calls.remove(call_id);

        Some(summary)
    }

    /// Reads back `{events, turns, summary}` for a single call.
    pub async fn read_call(
        &self,
        call_id: &str,
    ) -> anyhow::Result<(Vec<Event>, Vec<TurnRecord>, CallSummary)> {
        let dir = self.call_dir(call_id);
        let events_raw = tokio::fs::read_to_string(dir.join("events.jsonl")).await?;
        let events: Vec<Event> = events_raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect();
        let turns: Vec<TurnRecord> =
            serde_json::from_str(&tokio::fs::read_to_string(dir.join("turns.json")).await?)?;
        let summary: CallSummary =
            serde_json::from_str(&tokio::fs::read_to_string(dir.join("summary.json")).await?)?;
        Ok((events, turns, summary))
    }

    /// Lists call summaries under the analytics root, newest first.
    pub async fn list_calls(&self) -> anyhow::Result<Vec<CallSummary>> {
        let mut entries = tokio::fs::read_dir(&self.analytics_root).await?;
        let mut dated: Vec<(std::time::SystemTime, CallSummary)> = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let summary_path = entry.path().join("summary.json");
            if let Ok(raw) = tokio::fs::read_to_string(&summary_path).await {
                if let Ok(summary) = serde_json::from_str::<CallSummary>(&raw) {
                    let modified = entry
                        .metadata()
                        .await
                        .and_then(|m| m.modified())
                        .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                    dated.push((modified, summary));
                }
            }
        }
        dated.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(dated.into_iter().map(|(_, s)| s).collect())
    }
}

/// Rebuilds `turns.json`/`summary.json` purely from a call's persisted event
/// log, independent of the live `CallState.turns` side channel that
/// `record_turn` populates. Confirms events.jsonl is by itself a sufficient
/// record of a call (SPEC_FULL.md SS4.7/SS9): caller turns are grouped by
/// `turn_index` and rebuilt from their `whisper_completed`/`claude_completed`/
/// `tts_completed`(or `tts_failed`)/`silence_detected` payloads. Turns with no
/// `whisper_completed` event (the AI-only greeting turn, recorded directly via
/// `record_turn`) are not reconstructible from caller-facing events and are
/// skipped.
pub fn reconstruct_turns_from_events(
    call_id: &str,
    events: &[Event],
    started_at: chrono::DateTime<chrono::Utc>,
) -> (Vec<TurnRecord>, CallSummary) {
    let mut by_turn: BTreeMap<u32, Vec<&Event>> = BTreeMap::new();
    for event in events {
        if let Some(idx) = event.turn_index {
            by_turn.entry(idx).or_default().push(event);
        }
    }

    let mut turns = Vec::new();
    for (turn_index, turn_events) in by_turn {
        let Some(whisper) = turn_events
            .iter()
            .find(|e| e.event_type == EventType::WhisperCompleted)
        else {
            continue;
        };
        let transcript = whisper
            .payload
            .get("transcript")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let confidence = whisper.payload.get("confidence").and_then(|v| v.as_f64());
        let stt_ms = whisper.payload.get("duration_ms").and_then(|v| v.as_u64());

        let (input_tokens, output_tokens, llm_ms) = turn_events
            .iter()
            .find(|e| e.event_type == EventType::ClaudeCompleted)
            .map(|e| {
                (
                    e.payload.get("tokens_in").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                    e.payload.get("tokens_out").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                    e.payload.get("duration_ms").and_then(|v| v.as_u64()),
                )
            })
            .unwrap_or((0, 0, None));

        let tts_ms = turn_events
            .iter()
            .find(|e| matches!(e.event_type, EventType::TtsCompleted | EventType::TtsFailed))
            .and_then(|e| e.payload.get("duration_ms").and_then(|v| v.as_u64()));

        let silence_ms = turn_events
            .iter()
            .find(|e| e.event_type == EventType::SilenceDetected)
            .and_then(|e| e.payload.get("speech_duration_ms").and_then(|v| v.as_u64()));

        let total_ms = match (silence_ms, stt_ms, llm_ms, tts_ms) {
            (None, None, None, None) => None,
            _ => Some(
                silence_ms.unwrap_or(0) + stt_ms.unwrap_or(0) + llm_ms.unwrap_or(0) + tts_ms.unwrap_or(0),
            ),
        };

        let flags: Vec<String> = turn_events
            .iter()
            .filter(|e| e.event_type.is_quality_flag())
            .map(|e| quality_flag_label(e.event_type).to_string())
            .collect();

        turns.push(TurnRecord {
            turn_index,
            speaker: Speaker::Caller,
            text: transcript.clone(),
            anchor_words: crate::analytics::quality::anchor_words(&transcript),
            confidence,
            input_tokens,
            output_tokens,
            latency: LatencyBreakdown {
                silence_detection_ms: silence_ms,
                stt_ms,
                llm_ms,
                tts_ms,
                overhead_ms: Some(0),
                total_ms,
            },
            flags,
        });
    }

    let summary = compute_summary(call_id, &turns, started_at);
    (turns, summary)
}

fn quality_flag_label(event_type: EventType) -> &'static str {
    match event_type {
        EventType::EchoDetected => "echo",
        EventType::InterruptDetected => "interrupt",
        EventType::RepeatDetected => "repeat",
        EventType::LowConfidence => "low_confidence",
        EventType::LongSilence => "long_silence",
        _ => "flag",
    }
}

async fn write_json<T: Serialize>(path: &std::path::Path, value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    tokio::fs::write(path, json).await?;
    Ok(())
}

fn percentile_95(mut values: Vec<u64>) -> Option<u64> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    let idx = ((values.len() as f64) * 0.95).floor() as usize;
    let idx = idx.min(values.len() - 1);
    Some(values[idx])
}

fn compute_summary(
    call_id: &str,
    turns: &[TurnRecord],
    started_at: chrono::DateTime<chrono::Utc>,
) -> CallSummary {
    let caller_turns: Vec<&TurnRecord> = turns
        .iter()
        .filter(|t| matches!(t.speaker, Speaker::Caller))
        .collect();
    let ai_turns = turns
        .iter()
        .filter(|t| matches!(t.speaker, Speaker::Ai))
        .count() as u32;

    let totals: Vec<u64> = caller_turns.iter().filter_map(|t| t.latency.total_ms).collect();
    let stts: Vec<u64> = caller_turns.iter().filter_map(|t| t.latency.stt_ms).collect();
    let llms: Vec<u64> = caller_turns.iter().filter_map(|t| t.latency.llm_ms).collect();
    let ttss: Vec<u64> = caller_turns.iter().filter_map(|t| t.latency.tts_ms).collect();
    let confidences: Vec<f64> = caller_turns.iter().filter_map(|t| t.confidence).collect();

    let mean = |v: &[u64]| -> Option<f64> {
        if v.is_empty() {
            None
        } else {
            Some(v.iter().sum::<u64>() as f64 / v.len() as f64)
        }
    };
    let mean_f = |v: &[f64]| -> Option<f64> {
        if v.is_empty() {
            None
        } else {
            Some(v.iter().sum::<f64>() / v.len() as f64)
        }
    };

    let (slowest_turn_index, slowest_component) = caller_turns
        .iter()
        .filter_map(|t| t.latency.total_ms.map(|ms| (t.turn_index, ms)))
        .max_by_key(|(_, ms)| *ms)
        .map(|(idx, _)| {
            let turn = caller_turns.iter().find(|t| t.turn_index == idx).unwrap();
            let component = [
                ("stt", turn.latency.stt_ms),
                ("llm", turn.latency.llm_ms),
                ("tts", turn.latency.tts_ms),
            ]
            .into_iter()
            .filter_map(|(name, ms)| ms.map(|ms| (name, ms)))
            .max_by_key(|(_, ms)| *ms)
            .map(|(name, _)| name.to_string());
            (Some(idx), component)
        })
        .unwrap_or((None, None));

    let mut flags_summary: HashMap<String, u32> = HashMap::new();
    for turn in turns {
        for flag in &turn.flags {
            *flags_summary.entry(flag.clone()).or_insert(0) += 1;
        }
    }

    let duration_seconds = Some((chrono::Utc::now() - started_at).num_milliseconds() as f64 / 1000.0);

    CallSummary {
        call_id: call_id.to_string(),
        total_turns: turns.len() as u32,
        caller_turns: caller_turns.len() as u32,
        ai_turns,
        duration_seconds,
        avg_total_ms: mean(&totals),
        avg_stt_ms: mean(&stts),
        avg_llm_ms: mean(&llms),
        avg_tts_ms: mean(&ttss),
        p95_total_ms: percentile_95(totals),
        avg_confidence: mean_f(&confidences),
        slowest_turn_index,
        slowest_component,
        total_input_tokens: caller_turns.iter().map(|t| t.input_tokens).sum(),
        total_output_tokens: caller_turns.iter().map(|t| t.output_tokens).sum(),
        flags_summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dashboard::Broadcaster;

    fn turn(idx: u32, total_ms: u64, stt: u64, llm: u64, tts: u64) -> TurnRecord {
        TurnRecord {
            turn_index: idx,
            speaker: Speaker::Caller,
            text: "ciao".into(),
            anchor_words: vec![],
            confidence: Some(0.9),
            input_tokens: 10,
            output_tokens: 5,
            latency: LatencyBreakdown {
                silence_detection_ms: Some(100),
                stt_ms: Some(stt),
                llm_ms: Some(llm),
                tts_ms: Some(tts),
                overhead_ms: Some(5),
                total_ms: Some(total_ms),
            },
            flags: vec![],
        }
    }

    #[tokio::test]
    async fn emit_and_finalize_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let broadcaster = Arc::new(Broadcaster::new());
        let recorder = Recorder::new(dir.path().to_path_buf(), broadcaster);
        recorder.start_call("C1").await;
        recorder
            .emit("C1", EventType::CallStarted, None, serde_json::json!({}))
            .await;
        recorder.record_turn("C1", turn(1, 1500, 500, 700, 300)).await;
        let summary = recorder.finalize_call("C1").await.unwrap();
        assert_eq!(summary.total_turns, 1);
        assert_eq!(summary.caller_turns, 1);

        let (events, turns, read_summary) = recorder.read_call("C1").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(turns.len(), 1);
        assert_eq!(read_summary.call_id, "C1");
    }

    #[test]
    fn p95_clamps_to_last_element_on_small_samples() {
        assert_eq!(percentile_95(vec![10]), Some(10));
        assert_eq!(percentile_95(vec![]), None);
    }

    #[test]
    fn summary_identifies_slowest_turn_and_component() {
        let turns = vec![turn(1, 1000, 200, 600, 200), turn(2, 3000, 300, 2500, 200)];
        let summary = compute_summary("C1", &turns, chrono::Utc::now());
        assert_eq!(summary.slowest_turn_index, Some(2));
        assert_eq!(summary.slowest_component, Some("llm".to_string()));
    }

    #[tokio::test]
    async fn reconstruction_from_event_log_matches_live_turn_recording() {
        let dir = tempfile::tempdir().unwrap();
        let broadcaster = Arc::new(Broadcaster::new());
        let recorder = Recorder::new(dir.path().to_path_buf(), broadcaster);
        recorder.start_call("C1").await;

        recorder
            .emit(
                "C1",
                EventType::SilenceDetected,
                Some(1),
                serde_json::json!({"speech_duration_ms": 800}),
            )
            .await;
        recorder
            .emit(
                "C1",
                EventType::WhisperCompleted,
                Some(1),
                serde_json::json!({"transcript": "Pronto", "duration_ms": 200, "confidence": 0.9}),
            )
            .await;
        recorder
            .emit(
                "C1",
                EventType::LowConfidence,
                Some(1),
                serde_json::json!({"confidence": 0.4}),
            )
            .await;
        recorder
            .emit(
                "C1",
                EventType::ClaudeCompleted,
                Some(1),
                serde_json::json!({"response": "Salve", "duration_ms": 400, "tokens_in": 12, "tokens_out": 6}),
            )
            .await;
        recorder
            .emit(
                "C1",
                EventType::TtsCompleted,
                Some(1),
                serde_json::json!({"duration_ms": 150, "audio_bytes": 2000}),
            )
            .await;

        let (events, _turns, _summary) = recorder.read_call("C1").await.unwrap();
        let (turns, summary) = reconstruct_turns_from_events("C1", &events, chrono::Utc::now());

        assert_eq!(turns.len(), 1);
        let turn = &turns[0];
        assert_eq!(turn.text, "Pronto");
        assert_eq!(turn.input_tokens, 12);
        assert_eq!(turn.output_tokens, 6);
        assert_eq!(turn.flags, vec!["low_confidence".to_string()]);
        assert_eq!(turn.latency.total_ms, Some(800 + 200 + 400 + 150));
        assert_eq!(summary.total_turns, 1);
    }
}
