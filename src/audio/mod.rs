//! Audio capture module for voice-live
//!
//! This module handles microphone input capture and chunking.
//! Uses CPAL for audio capture; chunks flow to the session over a bounded
//! tokio channel.

mod chunk;
pub mod recorder;

pub use chunk::{downsample, mix_to_mono, AudioChunk, AudioFormat, ChunkAssembler};
pub use recorder::{AudioError, AudioRecorder, CaptureConfig, CaptureStats, RecordingHandle};
