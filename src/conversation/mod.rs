//! Conversation state (C5): prompt construction, rolling context window,
//! quick-reply shortcut, greeting bootstrap, goodbye detection.
//!
//! Grounded on `original_source/api/app/services/claude.py`'s
//! `ConversationState`/`ClaudeConversationService`, with two deliberate
//! deviations from the observed behavior (see SPEC_FULL.md design notes):
//! turns are indexed by caller+AI pair rather than raw message count, and
//! usage is reset at the start of every turn rather than persisting from a
//! turn where a quick-reply short-circuited it.

use crate::types::{Message, TokenUsage};
use std::collections::HashMap;

/// Static facts injected into the system prompt. Fixed for the life of a
/// call so the LLM context stays cache-friendly and deterministic.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeSnapshot {
    pub identity: String,
    pub address: String,
    pub directions: String,
    pub accounts: String,
    pub verification_qa: String,
    pub preferences: String,
}

impl KnowledgeSnapshot {
    pub fn build_system_prompt(&self) -> String {
        format!(
            "Sei un assistente telefonico. Identità: {}. Indirizzo: {}. \
             Indicazioni: {}. Account: {}. Verifica: {}. Preferenze: {}.",
            self.identity,
            self.address,
            self.directions,
            self.accounts,
            self.verification_qa,
            self.preferences
        )
    }
}

const GOODBYE_PHRASES: &[&str] = &[
    "arrivederci",
    "buona giornata",
    "buonasera",
    "a presto",
    "buon proseguimento",
    "alla prossima",
];

fn normalize(text: &str) -> String {
    text.trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Case-insensitive substring match against the fixed terminal-phrase list.
pub fn contains_goodbye(text: &str) -> bool {
    let lower = text.to_lowercase();
    GOODBYE_PHRASES.iter().any(|p| lower.contains(p))
}

fn default_quick_replies() -> HashMap<String, String> {
    let mut m = HashMap::new();
    m.insert("grazie".to_string(), "Prego.".to_string());
    m.insert("ok".to_string(), "Va bene.".to_string());
    m.insert("va bene".to_string(), "Perfetto.".to_string());
    m
}

pub struct Conversation {
    pub call_id: String,
    pub caller_number: String,
    system_prompt: String,
    history: Vec<Message>,
    /// Number of caller+AI turn pairs completed; turn 0 is the greeting.
    turn_count: u32,
    quick_replies: HashMap<String, String>,
    context_turns: usize,
    pub last_usage: TokenUsage,
}

impl Conversation {
    pub fn start(
        call_id: impl Into<String>,
        caller_number: impl Into<String>,
        knowledge: &KnowledgeSnapshot,
        greeting: impl Into<String>,
        context_turns: usize,
    ) -> Self {
        let greeting = greeting.into();
        let mut conv = Conversation {
            call_id: call_id.into(),
            caller_number: caller_number.into(),
            system_prompt: knowledge.build_system_prompt(),
            history: Vec::new(),
            turn_count: 0,
            quick_replies: default_quick_replies(),
            context_turns,
            last_usage: TokenUsage::default(),
        };
        // Greeting enters history before any caller input so the model never
        // re-greets on turn 1.
        conv.history.push(Message::ai(greeting));
        conv
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn turn_count(&self) -> u32 {
        self.turn_count
    }

    /// History tail fed to the LLM: the most recent `2 * context_turns`
    /// messages.
    pub fn context_window(&self) -> &[Message] {
        let window = self.context_turns * 2;
        let start = self.history.len().saturating_sub(window);
        &self.history[start..]
    }

    pub fn full_history(&self) -> &[Message] {
        &self.history
    }

    pub fn recent_ai_outputs(&self, n: usize) -> Vec<&str> {
        self.history
            .iter()
            .rev()
            .filter(|m| matches!(m.speaker, crate::types::Speaker::Ai))
            .take(n)
            .map(|m| m.text.as_str())
            .collect()
    }

    pub fn recent_caller_transcripts(&self, n: usize) -> Vec<&str> {
        self.history
            .iter()
            .rev()
            .filter(|m| matches!(m.speaker, crate::types::Speaker::Caller))
            .take(n)
            .map(|m| m.text.as_str())
            .collect()
    }

    /// Looks up the quick-reply lexicon for a normalized caller transcript.
    pub fn quick_reply(&self, caller_text: &str) -> Option<String> {
        self.quick_replies.get(&normalize(caller_text)).cloned()
    }

    /// Records a completed caller+AI turn. Resets `last_usage` to the
    /// supplied value unconditionally, so a quick-reply turn in between
    /// never leaks a stale non-zero usage into the next LLM turn's record.
    pub fn record_turn(&mut self, caller_text: &str, ai_text: &str, usage: TokenUsage) -> u32 {
        self.history.push(Message::caller(caller_text));
        self.history.push(Message::ai(ai_text));
        self.turn_count += 1;
        self.last_usage = usage;
        self.turn_count
    }

    pub fn is_goodbye(&self, ai_text: &str) -> bool {
        contains_goodbye(ai_text)
    }
}
