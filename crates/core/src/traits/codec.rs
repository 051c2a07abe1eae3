//! Frame codec traits

use crate::Result;

/// Streaming decoder: compressed client bytes in, PCM out.
///
/// Bytes may arrive split at arbitrary boundaries; the decoder buffers
/// partial packets internally.
pub trait StreamDecoder: Send + 'static {
    /// Feed compressed bytes received from the client
    fn append_bytes(&mut self, bytes: &[u8]) -> Result<()>;

    /// Take all PCM decoded so far (possibly empty)
    fn read_pcm(&mut self) -> Vec<f32>;

    /// Discard all buffered state
    fn reset(&mut self);
}

/// Streaming encoder: PCM in, compressed bytes out.
pub trait StreamEncoder: Send + 'static {
    /// Feed synthesized PCM
    fn append_pcm(&mut self, pcm: &[f32]) -> Result<()>;

    /// Take all complete encoded bytes produced so far (possibly empty)
    fn read_bytes(&mut self) -> Vec<u8>;

    /// Samples accepted but not yet emitted as encoded bytes
    fn pending_samples(&self) -> usize;

    /// Discard all buffered state
    fn reset(&mut self);
}

/// Factory for per-session decoder/encoder pairs.
///
/// Handing out fresh halves is how a session resets the codec.
pub trait FrameCodec: Send + Sync + 'static {
    /// PCM sample rate on the decoded side
    fn sample_rate(&self) -> u32;

    fn decoder(&self) -> Box<dyn StreamDecoder>;

    fn encoder(&self) -> Box<dyn StreamEncoder>;

    /// Codec name for logging
    fn name(&self) -> &str;
}
