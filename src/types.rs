//! Shared types used across modules.
//!
//! Kept small deliberately: most component-specific types (events, turns,
//! config parameters) live in their own modules to avoid this file becoming
//! a dumping ground.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Who produced a turn's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Caller,
    Ai,
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::Caller => write!(f, "caller"),
            Speaker::Ai => write!(f, "ai"),
        }
    }
}

/// One message in a conversation's rolling history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub speaker: Speaker,
    pub text: String,
}

impl Message {
    pub fn caller(text: impl Into<String>) -> Self {
        Message {
            speaker: Speaker::Caller,
            text: text.into(),
        }
    }

    pub fn ai(text: impl Into<String>) -> Self {
        Message {
            speaker: Speaker::Ai,
            text: text.into(),
        }
    }
}

/// Token usage reported by the LLM adapter for a single turn.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

pub type CallId = String;
