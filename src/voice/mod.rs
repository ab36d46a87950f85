//! Streaming voice-activity segmentation for the call media pipeline.

pub mod segmenter;

pub use segmenter::{Segmenter, SegmenterConfig, Utterance};
