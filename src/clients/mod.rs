//! Thin HTTP adapters to the external speech-to-text, language-generation,
//! text-to-speech, and carrier-control services (C3, C10).
//!
//! Each adapter is a trait so the turn pipeline can be exercised against an
//! in-memory stub in tests, mirroring how `agent/llm.rs`'s client is
//! constructed against a configurable base URL rather than a hardcoded one.

pub mod hangup;
pub mod llm;
pub mod stt;
pub mod tts;

pub use hangup::{HangupClient, HttpHangupClient};
pub use llm::{HttpLlmClient, LlmClient, LlmReply};
pub use stt::{HttpSttClient, SttClient, SttResult};
pub use tts::{HttpTtsClient, TtsClient, TtsResult};

use std::time::Duration;

/// Per-stage hard deadlines (ADR-level defaults; see SPEC_FULL.md §5).
pub const STT_TIMEOUT: Duration = Duration::from_secs(15);
pub const LLM_TIMEOUT: Duration = Duration::from_secs(10);
pub const TTS_TIMEOUT: Duration = Duration::from_secs(10);

/// Backoff applied before the single adapter-local retry (SPEC_FULL.md §4.3:
/// "one retry with small backoff").
pub const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Maps a raw average log-probability (as returned by typical STT engines)
/// onto a [0,1] confidence via a small set of monotonic anchor points.
pub fn logprob_to_confidence(avg_logprob: f64) -> f64 {
    const ANCHORS: &[(f64, f64)] = &[
        (-0.5, 1.00),
        (-1.0, 0.85),
        (-1.5, 0.60),
        (-2.0, 0.35),
        (-3.0, 0.05),
    ];
    if avg_logprob >= ANCHORS[0].0 {
        return ANCHORS[0].1;
    }
    if avg_logprob <= ANCHORS[ANCHORS.len() - 1].0 {
        return ANCHORS[ANCHORS.len() - 1].1;
    }
    for window in ANCHORS.windows(2) {
        let (x0, y0) = window[0];
        let (x1, y1) = window[1];
        if avg_logprob <= x0 && avg_logprob >= x1 {
            let frac = (avg_logprob - x0) / (x1 - x0);
            return y0 + (y1 - y0) * frac;
        }
    }
    0.0
}
