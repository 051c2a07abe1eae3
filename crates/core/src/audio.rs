//! Audio frame buffering and PCM conversion
//!
//! Decoded PCM arrives in arbitrarily sized chunks. The engine consumes
//! fixed-size frames, so [`AudioFrameBuffer`] accumulates samples and hands out
//! complete frames in arrival order, keeping the remainder for the next call.

use std::collections::VecDeque;

/// FIFO accumulator that slices incoming PCM into fixed-size frames.
///
/// After every [`drain_frames`](Self::drain_frames) call the residual length
/// is strictly less than the frame size, and no sample is ever dropped or
/// reordered.
#[derive(Debug, Clone)]
pub struct AudioFrameBuffer {
    frame_size: usize,
    samples: VecDeque<f32>,
}

impl AudioFrameBuffer {
    /// Create a buffer for frames of `frame_size` samples.
    ///
    /// # Panics
    ///
    /// Panics if `frame_size` is zero.
    pub fn new(frame_size: usize) -> Self {
        assert!(frame_size > 0, "frame size must be non-zero");
        Self {
            frame_size,
            samples: VecDeque::with_capacity(frame_size * 2),
        }
    }

    /// Samples per frame
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Samples currently buffered and not yet part of a drained frame
    pub fn residual(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Append decoded samples to the tail of the buffer
    pub fn append(&mut self, pcm: &[f32]) {
        self.samples.extend(pcm.iter().copied());
    }

    /// Remove and return the oldest complete frame, if one is available
    pub fn pop_frame(&mut self) -> Option<Vec<f32>> {
        if self.samples.len() < self.frame_size {
            return None;
        }
        Some(self.samples.drain(..self.frame_size).collect())
    }

    /// Remove every complete frame, oldest first
    pub fn drain_frames(&mut self) -> Vec<Vec<f32>> {
        let count = self.samples.len() / self.frame_size;
        let mut frames = Vec::with_capacity(count);
        while let Some(frame) = self.pop_frame() {
            frames.push(frame);
        }
        frames
    }

    /// Drop all buffered samples
    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Convert little-endian PCM16 bytes to normalized f32 samples.
///
/// A trailing odd byte is ignored; callers streaming bytes should carry it over.
pub fn pcm16_le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|chunk| {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
            sample as f32 / 32768.0
        })
        .collect()
}

/// Convert normalized f32 samples to little-endian PCM16 bytes
pub fn f32_to_pcm16_le(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}
