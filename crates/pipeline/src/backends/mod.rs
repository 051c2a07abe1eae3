//! Reference backends
//!
//! - [`LoopbackEngine`]: deterministic engine that echoes its input after a
//!   fixed delay, used for tests and for running the gateway without weights
//! - [`Pcm16Codec`]: raw 16-bit little-endian PCM framing
//! - [`HfTokenizer`]: HuggingFace `tokenizers` wrapper

mod hf_tokenizer;
mod loopback;
mod pcm16;

pub use hf_tokenizer::HfTokenizer;
pub use loopback::{LoopbackConfig, LoopbackEngine, LoopbackLoader};
pub use pcm16::{Pcm16Codec, Pcm16Decoder, Pcm16Encoder};
