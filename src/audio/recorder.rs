//! Microphone capture using CPAL
//!
//! The AudioRecorder captures audio from the default input device and turns
//! every callback buffer into fixed-size mono PCM16 chunks. Chunks are handed
//! to the async side through a bounded channel with `try_send`, so the audio
//! thread never blocks on network I/O. When the queue is full the chunk is
//! dropped and counted.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::chunk::{downsample, mix_to_mono, AudioChunk, AudioFormat, ChunkAssembler};

/// Errors that can occur during audio capture.
#[derive(Debug, Clone)]
pub enum AudioError {
    NoInputDevice,
    NoSupportedConfig,
    StreamCreationFailed(String),
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::NoInputDevice => write!(f, "No audio input device found"),
            AudioError::NoSupportedConfig => write!(f, "No supported audio configuration"),
            AudioError::StreamCreationFailed(e) => {
                write!(f, "Failed to create audio stream: {}", e)
            }
        }
    }
}

impl std::error::Error for AudioError {}

/// What the capture side should produce
#[derive(Debug, Clone, Copy)]
pub struct CaptureConfig {
    /// Sample rate sent to the service (16000 for the Live API)
    pub target_sample_rate: u32,
    /// Duration of each emitted chunk
    pub chunk_duration_ms: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: 16000,
            chunk_duration_ms: 100,
        }
    }
}

/// Counters reported when a recording stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub chunks_emitted: u64,
    pub chunks_dropped: u64,
}

#[derive(Default)]
struct Counters {
    emitted: AtomicU64,
    dropped: AtomicU64,
}

/// Shared between the capture callback and the handle
struct ChunkPipe {
    assembler: Mutex<ChunkAssembler>,
    tx: mpsc::Sender<AudioChunk>,
    counters: Counters,
}

impl ChunkPipe {
    fn offer(&self, chunk: AudioChunk) {
        match self.tx.try_send(chunk) {
            Ok(()) => {
                self.counters.emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(chunk)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::trace!("Audio queue full, dropped chunk {}", chunk.sequence);
                if dropped % 50 == 1 {
                    log::warn!("Audio queue full: {} chunk(s) dropped so far", dropped);
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::trace!("Audio queue closed, discarding chunk");
            }
        }
    }

    fn stats(&self) -> CaptureStats {
        CaptureStats {
            chunks_emitted: self.counters.emitted.load(Ordering::Relaxed),
            chunks_dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Handle to an active recording.
/// When dropped, capture stops and the chunk queue closes.
pub struct RecordingHandle {
    stream: Stream,
    pipe: Arc<ChunkPipe>,
    is_recording: Arc<AtomicBool>,
}

impl RecordingHandle {
    /// Stop capture, flush the final partial chunk, and close the queue.
    pub fn stop(self) -> CaptureStats {
        self.is_recording.store(false, Ordering::SeqCst);

        if let Err(e) = self.stream.pause() {
            log::debug!("Failed to pause input stream: {}", e);
        }
        drop(self.stream);

        let last = match self.pipe.assembler.lock() {
            Ok(mut assembler) => assembler.flush(),
            Err(poisoned) => poisoned.into_inner().flush(),
        };
        if let Some(chunk) = last {
            self.pipe.offer(chunk);
        }

        let stats = self.pipe.stats();
        log::info!(
            "Recording stopped: {} chunk(s) queued, {} dropped",
            stats.chunks_emitted,
            stats.chunks_dropped
        );
        stats
    }
}

/// Audio recorder that captures from the default input device.
pub struct AudioRecorder {
    device: Device,
    config: StreamConfig,
    sample_format: SampleFormat,
}

impl AudioRecorder {
    /// Create a new AudioRecorder using the default input device.
    pub fn new() -> Result<Self, AudioError> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or(AudioError::NoInputDevice)?;

        log::info!("Using audio input device: {:?}", device.name());

        let supported_config = device
            .default_input_config()
            .map_err(|_| AudioError::NoSupportedConfig)?;

        log::info!(
            "Audio config: {} Hz, {} channels, {:?}",
            supported_config.sample_rate().0,
            supported_config.channels(),
            supported_config.sample_format()
        );

        let sample_format = supported_config.sample_format();
        let config: StreamConfig = supported_config.into();

        Ok(Self {
            device,
            config,
            sample_format,
        })
    }

    /// Start capturing into `tx`.
    /// Returns a handle that must be used to stop the recording.
    pub fn start(
        &self,
        tx: mpsc::Sender<AudioChunk>,
        capture: CaptureConfig,
    ) -> Result<RecordingHandle, AudioError> {
        let format = AudioFormat::pcm16_mono(capture.target_sample_rate);
        let assembler = ChunkAssembler::new(format, capture.chunk_duration_ms);
        let samples_per_chunk = assembler.samples_per_chunk();
        let pipe = Arc::new(ChunkPipe {
            assembler: Mutex::new(assembler),
            tx,
            counters: Counters::default(),
        });
        let is_recording = Arc::new(AtomicBool::new(true));

        let stream = self.build_stream(pipe.clone(), is_recording.clone(), capture)?;

        stream.play().map_err(|e| {
            AudioError::StreamCreationFailed(format!("Failed to start stream: {}", e))
        })?;

        log::info!(
            "Recording started ({} Hz → {} Hz, {} ms chunks of {} samples)",
            self.config.sample_rate.0,
            capture.target_sample_rate,
            capture.chunk_duration_ms,
            samples_per_chunk
        );

        Ok(RecordingHandle {
            stream,
            pipe,
            is_recording,
        })
    }

    fn build_stream(
        &self,
        pipe: Arc<ChunkPipe>,
        is_recording: Arc<AtomicBool>,
        capture: CaptureConfig,
    ) -> Result<Stream, AudioError> {
        let err_fn = |err| log::error!("Audio stream error: {}", err);

        match self.sample_format {
            SampleFormat::I16 => {
                self.build_stream_typed::<i16>(pipe, is_recording, capture, err_fn)
            }
            SampleFormat::U16 => {
                self.build_stream_typed::<u16>(pipe, is_recording, capture, err_fn)
            }
            SampleFormat::F32 => {
                self.build_stream_typed::<f32>(pipe, is_recording, capture, err_fn)
            }
            _ => Err(AudioError::NoSupportedConfig),
        }
    }

    fn build_stream_typed<T>(
        &self,
        pipe: Arc<ChunkPipe>,
        is_recording: Arc<AtomicBool>,
        capture: CaptureConfig,
        err_fn: impl FnMut(cpal::StreamError) + Send + 'static,
    ) -> Result<Stream, AudioError>
    where
        T: cpal::Sample + cpal::SizedSample + Send + 'static,
        f32: cpal::FromSample<T>,
    {
        let config = self.config.clone();
        let channels = config.channels;
        let source_rate = config.sample_rate.0;

        let stream = self
            .device
            .build_input_stream(
                &config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    if !is_recording.load(Ordering::SeqCst) {
                        return;
                    }

                    let samples: Vec<i16> = data.iter().map(|&s| sample_to_i16(s)).collect();
                    let mono = mix_to_mono(&samples, channels);
                    let resampled = downsample(&mono, source_rate, capture.target_sample_rate);

                    let ready = match pipe.assembler.lock() {
                        Ok(mut assembler) => assembler.push(&resampled),
                        Err(_) => {
                            log::error!("Chunk assembler poisoned");
                            return;
                        }
                    };
                    for chunk in ready {
                        pipe.offer(chunk);
                    }
                },
                err_fn,
                None,
            )
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        Ok(stream)
    }
}

/// Convert any sample type to i16.
fn sample_to_i16<T>(sample: T) -> i16
where
    T: cpal::Sample,
    f32: cpal::FromSample<T>,
{
    let f32_sample: f32 = sample.to_sample::<f32>();
    // Clamp and convert to i16
    let clamped = f32_sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}
