use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed event-type enum (C7). Every analytics event carries one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    CallStarted,
    StreamConnected,
    GreetingStarted,
    GreetingCompleted,
    CallEnded,
    SpeechStarted,
    SilenceDetected,
    WhisperStarted,
    WhisperCompleted,
    WhisperFailed,
    ClaudeStarted,
    ClaudeCompleted,
    ClaudeFailed,
    TtsStarted,
    TtsCompleted,
    TtsFailed,
    ApiRetry,
    PlaybackStarted,
    PlaybackCompleted,
    MarkReceived,
    EchoDetected,
    InterruptDetected,
    RepeatDetected,
    LowConfidence,
    LongSilence,
}

impl EventType {
    /// Quality-flag-implying event types contribute to a turn's flag set.
    pub fn is_quality_flag(self) -> bool {
        matches!(
            self,
            EventType::EchoDetected
                | EventType::InterruptDetected
                | EventType::RepeatDetected
                | EventType::LowConfidence
                | EventType::LongSilence
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub call_id: String,
    pub event_type: EventType,
    pub ts: DateTime<Utc>,
    pub turn_index: Option<u32>,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(
        id: u64,
        call_id: impl Into<String>,
        event_type: EventType,
        turn_index: Option<u32>,
        payload: serde_json::Value,
    ) -> Self {
        Event {
            id,
            call_id: call_id.into(),
            event_type,
            ts: Utc::now(),
            turn_index,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_retry_is_not_a_quality_flag() {
        assert!(!EventType::ApiRetry.is_quality_flag());
        assert!(EventType::LowConfidence.is_quality_flag());
    }

    #[test]
    fn event_type_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&EventType::ApiRetry).unwrap(), "\"api_retry\"");
        assert_eq!(serde_json::to_string(&EventType::WhisperFailed).unwrap(), "\"whisper_failed\"");
    }
}
