//! Streaming voice-activity segmenter (C2).
//!
//! Accumulates inbound mulaw frames and emits a completed [`Utterance`] once
//! sustained silence follows speech. Grounded on the original service's
//! `AudioBuffer`: RMS-threshold speech detection that tolerates short
//! intra-utterance pauses, with a minimum speech duration gate so breathing
//! noise and clicks never become a turn.

use crate::audio::mulaw_rms;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct SegmenterConfig {
    pub silence_ms: u64,
    pub min_speech_ms: u64,
    pub silence_rms: f64,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        SegmenterConfig {
            silence_ms: 1200,
            min_speech_ms: 500,
            silence_rms: 500.0,
        }
    }
}

/// A completed caller speaking turn, ready for the turn pipeline.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub mulaw: Vec<u8>,
    pub speech_duration: Duration,
    pub peak_rms: f64,
}

/// Per-call accumulation state. One instance per call; not shared.
pub struct Segmenter {
    cfg: SegmenterConfig,
    buffer: Vec<u8>,
    speech_active: bool,
    speech_elapsed: Duration,
    silence_elapsed: Duration,
    peak_rms: f64,
    /// Duration represented by one frame passed to `push`, used to advance
    /// the elapsed-time counters without a wall-clock dependency.
    frame_duration: Duration,
}

impl Segmenter {
    pub fn new(cfg: SegmenterConfig, frame_duration: Duration) -> Self {
        Segmenter {
            cfg,
            buffer: Vec::new(),
            speech_active: false,
            speech_elapsed: Duration::ZERO,
            silence_elapsed: Duration::ZERO,
            peak_rms: 0.0,
            frame_duration,
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.speech_active = false;
        self.speech_elapsed = Duration::ZERO;
        self.silence_elapsed = Duration::ZERO;
        self.peak_rms = 0.0;
    }

    /// Feed one inbound mulaw frame. Returns `Some(Utterance)` iff this frame
    /// completed an utterance meeting the minimum-speech-duration gate.
    pub fn push(&mut self, frame: &[u8]) -> Option<Utterance> {
        let rms = mulaw_rms(frame);

        if rms > self.cfg.silence_rms {
            self.speech_active = true;
            self.silence_elapsed = Duration::ZERO;
            self.speech_elapsed += self.frame_duration;
            self.peak_rms = self.peak_rms.max(rms);
            self.buffer.extend_from_slice(frame);
            return None;
        }

        if self.speech_active {
            self.buffer.extend_from_slice(frame);
            self.silence_elapsed += self.frame_duration;
            self.speech_elapsed += self.frame_duration;

            if self.silence_elapsed.as_millis() as u64 >= self.cfg.silence_ms {
                return self.finish();
            }
        }
        None
    }

    /// Force-complete any in-progress buffer (stream end).
    pub fn flush(&mut self) -> Option<Utterance> {
        if self.speech_active {
            self.finish()
        } else {
            None
        }
    }

    fn finish(&mut self) -> Option<Utterance> {
        let speech_ms = self.speech_elapsed.as_millis() as u64;
        let result = if speech_ms >= self.cfg.min_speech_ms {
            Some(Utterance {
                mulaw: self.buffer.clone(),
                speech_duration: self.speech_elapsed,
                peak_rms: self.peak_rms,
            })
        } else {
            None
        };
        self.reset();
        result
    }

    pub fn is_speech_active(&self) -> bool {
        self.speech_active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone_frame(len: usize) -> Vec<u8> {
        // mulaw byte 0x00 decodes to a large-magnitude negative sample, well
        // above the default silence threshold.
        vec![0x00u8; len]
    }

    fn silence_frame(len: usize) -> Vec<u8> {
        // mulaw 0xFF decodes to 0 (silence).
        vec![0xFFu8; len]
    }

    #[test]
    fn emits_utterance_when_speech_meets_minimum_duration() {
        let cfg = SegmenterConfig {
            silence_ms: 100,
            min_speech_ms: 50,
            silence_rms: 50.0,
        };
        let mut seg = Segmenter::new(cfg, Duration::from_millis(20));
        for _ in 0..5 {
            assert!(seg.push(&tone_frame(160)).is_none());
        }
        let mut utterance = None;
        for _ in 0..6 {
            if let Some(u) = seg.push(&silence_frame(160)) {
                utterance = Some(u);
                break;
            }
        }
        let utterance = utterance.expect("expected an utterance");
        assert!(utterance.speech_duration.as_millis() >= 50);
    }

    #[test]
    fn discards_speech_shorter_than_minimum_duration() {
        let cfg = SegmenterConfig {
            silence_ms: 40,
            min_speech_ms: 500,
            silence_rms: 50.0,
        };
        let mut seg = Segmenter::new(cfg, Duration::from_millis(20));
        seg.push(&tone_frame(160));
        let mut emitted = false;
        for _ in 0..4 {
            if seg.push(&silence_frame(160)).is_some() {
                emitted = true;
            }
        }
        assert!(!emitted, "short speech burst should not emit an utterance");
    }

    #[test]
    fn tolerates_micro_pauses_within_an_utterance() {
        let cfg = SegmenterConfig {
            silence_ms: 200,
            min_speech_ms: 50,
            silence_rms: 50.0,
        };
        let mut seg = Segmenter::new(cfg, Duration::from_millis(20));
        seg.push(&tone_frame(160));
        seg.push(&silence_frame(160)); // micro-pause, below silence_ms
        assert!(seg.push(&tone_frame(160)).is_none());
        assert!(seg.is_speech_active());
    }

    #[test]
    fn flush_returns_in_progress_buffer() {
        let cfg = SegmenterConfig {
            silence_ms: 1000,
            min_speech_ms: 10,
            silence_rms: 50.0,
        };
        let mut seg = Segmenter::new(cfg, Duration::from_millis(20));
        seg.push(&tone_frame(160));
        let flushed = seg.flush().expect("flush should emit the in-progress buffer");
        assert!(!flushed.mulaw.is_empty());
    }

    #[test]
    fn flush_on_idle_segmenter_emits_nothing() {
        let mut seg = Segmenter::new(SegmenterConfig::default(), Duration::from_millis(20));
        assert!(seg.flush().is_none());
    }
}
