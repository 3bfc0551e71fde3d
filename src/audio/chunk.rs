//! Fixed-size PCM chunks and the sample conversions that produce them
//!
//! # Chunk Size
//!
//! At 16kHz mono PCM16 with 100ms chunks:
//! - 1600 samples × 2 bytes = 3,200 bytes per chunk
//! - ~4.3 KB per chunk once base64-encoded into a frame

/// Format metadata carried by every chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub channels: u16,
}

impl AudioFormat {
    /// 16-bit little-endian mono at `sample_rate`
    pub const fn pcm16_mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            bits_per_sample: 16,
            channels: 1,
        }
    }

    /// MIME type understood by the Live API, e.g. `audio/pcm;rate=16000`
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }

    pub fn bytes_per_frame(&self) -> usize {
        (self.bits_per_sample as usize / 8) * self.channels as usize
    }
}

/// A chunk of PCM bytes with metadata
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Raw PCM bytes (little-endian samples)
    pub data: Vec<u8>,
    pub format: AudioFormat,
    /// Sequence number for ordering (monotonically increasing)
    pub sequence: u64,
}

impl AudioChunk {
    /// Build a chunk from PCM16 samples (little-endian)
    pub fn from_samples(samples: &[i16], format: AudioFormat, sequence: u64) -> Self {
        let data: Vec<u8> = samples.iter().flat_map(|&s| s.to_le_bytes()).collect();
        Self {
            data,
            format,
            sequence,
        }
    }

    /// Duration of this chunk in milliseconds
    pub fn duration_ms(&self) -> u64 {
        let frame_bytes = self.format.bytes_per_frame() as u64;
        if frame_bytes == 0 || self.format.sample_rate == 0 {
            return 0;
        }
        (self.data.len() as u64 / frame_bytes * 1000) / self.format.sample_rate as u64
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Accumulates mono samples and cuts them into fixed-size chunks
///
/// Thread-safety: This struct is NOT internally synchronized.
/// Wrap in `Arc<Mutex<>>` if shared with the capture callback.
#[derive(Debug)]
pub struct ChunkAssembler {
    format: AudioFormat,
    samples_per_chunk: usize,
    pending: Vec<i16>,
    next_sequence: u64,
}

impl ChunkAssembler {
    /// # Arguments
    /// * `format` - Output format (mono PCM16)
    /// * `chunk_duration_ms` - Duration of each chunk (e.g., 100)
    pub fn new(format: AudioFormat, chunk_duration_ms: u32) -> Self {
        let samples_per_chunk =
            ((format.sample_rate as u64 * chunk_duration_ms as u64) / 1000).max(1) as usize;

        Self {
            format,
            samples_per_chunk,
            pending: Vec::with_capacity(samples_per_chunk * 2),
            next_sequence: 0,
        }
    }

    /// Add samples, returning every chunk that is now complete
    pub fn push(&mut self, samples: &[i16]) -> Vec<AudioChunk> {
        self.pending.extend_from_slice(samples);

        let mut ready = Vec::new();
        while self.pending.len() >= self.samples_per_chunk {
            let chunk: Vec<i16> = self.pending.drain(..self.samples_per_chunk).collect();
            ready.push(self.emit(&chunk));
        }
        ready
    }

    /// Emit whatever is left as a final, shorter chunk
    pub fn flush(&mut self) -> Option<AudioChunk> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(self.emit(&rest))
    }

    fn emit(&mut self, samples: &[i16]) -> AudioChunk {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        AudioChunk::from_samples(samples, self.format, sequence)
    }

    pub fn samples_per_chunk(&self) -> usize {
        self.samples_per_chunk
    }
}

/// Average interleaved frames down to one channel
pub fn mix_to_mono(samples: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }

    samples
        .chunks(channels as usize)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / frame.len() as i32) as i16
        })
        .collect()
}

/// Downsample audio from source rate to target rate using simple averaging
///
/// Supports integer ratios (e.g., 48kHz → 16kHz).
///
/// # Returns
/// Downsampled audio, or original if rates match or ratio not supported
pub fn downsample(samples: &[i16], source_rate: u32, target_rate: u32) -> Vec<i16> {
    // Guard against division by zero
    if target_rate == 0 || source_rate == 0 {
        log::warn!(
            "Invalid sample rate (source: {}, target: {}), returning original",
            source_rate,
            target_rate
        );
        return samples.to_vec();
    }

    if source_rate == target_rate {
        return samples.to_vec();
    }

    if source_rate % target_rate != 0 {
        log::warn!(
            "Unsupported resample ratio {}:{}, returning original",
            source_rate,
            target_rate
        );
        return samples.to_vec();
    }

    let ratio = (source_rate / target_rate) as usize;

    samples
        .chunks(ratio)
        .map(|chunk| {
            // Use i64 to prevent overflow with large chunks
            let sum: i64 = chunk.iter().map(|&s| s as i64).sum();
            (sum / chunk.len() as i64) as i16
        })
        .collect()
}
