//! Raw PCM16 frame codec
//!
//! Client bytes are 16-bit little-endian mono samples. Outbound audio is
//! emitted in fixed packets of `packet_samples`; a partial packet stays
//! pending until more audio arrives.

use voice_gateway_core::{
    f32_to_pcm16_le, pcm16_le_to_f32, FrameCodec, Result, StreamDecoder, StreamEncoder,
};

#[derive(Debug, Clone)]
pub struct Pcm16Codec {
    sample_rate: u32,
    packet_samples: usize,
}

impl Pcm16Codec {
    pub fn new(sample_rate: u32, packet_samples: usize) -> Self {
        Self {
            sample_rate,
            packet_samples: packet_samples.max(1),
        }
    }

    pub fn packet_samples(&self) -> usize {
        self.packet_samples
    }
}

impl FrameCodec for Pcm16Codec {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(Pcm16Decoder::default())
    }

    fn encoder(&self) -> Box<dyn StreamEncoder> {
        Box::new(Pcm16Encoder::new(self.packet_samples))
    }

    fn name(&self) -> &str {
        "pcm16"
    }
}

/// Decoder half; carries a split sample over to the next chunk
#[derive(Debug, Default)]
pub struct Pcm16Decoder {
    carry: Option<u8>,
    decoded: Vec<f32>,
}

impl StreamDecoder for Pcm16Decoder {
    fn append_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }

        let mut joined;
        let bytes = match self.carry.take() {
            Some(first) => {
                joined = Vec::with_capacity(bytes.len() + 1);
                joined.push(first);
                joined.extend_from_slice(bytes);
                joined.as_slice()
            }
            None => bytes,
        };

        if bytes.len() % 2 == 1 {
            self.carry = bytes.last().copied();
        }
        self.decoded.extend(pcm16_le_to_f32(bytes));
        Ok(())
    }

    fn read_pcm(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.decoded)
    }

    fn reset(&mut self) {
        self.carry = None;
        self.decoded.clear();
    }
}

/// Encoder half; emits whole packets only
#[derive(Debug)]
pub struct Pcm16Encoder {
    packet_samples: usize,
    pending: Vec<f32>,
    encoded: Vec<u8>,
}

impl Pcm16Encoder {
    pub fn new(packet_samples: usize) -> Self {
        Self {
            packet_samples: packet_samples.max(1),
            pending: Vec::new(),
            encoded: Vec::new(),
        }
    }
}

impl StreamEncoder for Pcm16Encoder {
    fn append_pcm(&mut self, pcm: &[f32]) -> Result<()> {
        self.pending.extend_from_slice(pcm);
        let whole = self.pending.len() / self.packet_samples * self.packet_samples;
        if whole > 0 {
            let packets: Vec<f32> = self.pending.drain(..whole).collect();
            self.encoded.extend(f32_to_pcm16_le(&packets));
        }
        Ok(())
    }

    fn read_bytes(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.encoded)
    }

    fn pending_samples(&self) -> usize {
        self.pending.len()
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.encoded.clear();
    }
}
