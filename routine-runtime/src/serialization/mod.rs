mod json;

pub use json::JsonCodec;

/// Re-export the codec traits from `routine-core`.
pub use routine_core::codec::{Codec, Decoder, Encoder, StateCodec};
