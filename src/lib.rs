//! Voice Gateway - real-time voice-agent gateway for telephony
//!
//! Bridges a carrier media stream (mulaw over WebSocket) to a
//! speech-to-text / LLM / text-to-speech pipeline, records per-call
//! analytics, and fans out live events to operator dashboards.
//!
//! # Example
//!
//! ```ignore
//! use voice_gateway::config::GatewayConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let _config = GatewayConfig::load()?;
//!     voice_gateway::cli::run().await
//! }
//! ```

pub mod error;
pub mod types;
pub mod config;
pub mod audio;
pub mod voice;
pub mod clients;
pub mod conversation;
pub mod pipeline;
pub mod analytics;
pub mod dashboard;
pub mod scheduler;
pub mod session;
pub mod server;
pub mod cli;

pub use error::GatewayError;
pub use config::GatewayConfig;
pub use types::{CallId, Message, Speaker, TokenUsage};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get the library info
pub fn info() -> String {
    format!("{} v{} - real-time voice-agent gateway", NAME, VERSION)
}

/// Truncates `s` to at most `max_chars` characters, respecting UTF-8
/// boundaries, for compact log/CLI output.
pub fn truncate_safe(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}
