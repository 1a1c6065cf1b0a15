use crate::descriptor::ContinuationDescriptor;
use crate::intent::Outbox;
use crate::state::{RoutineResult, StateEnvelope};
use anyhow::Result;
use bytes::Bytes;

/// Sealed helper traits for codec implementations.
///
/// To implement a codec:
/// 1. Implement `Encoder` and `Decoder` (empty impls are fine)
/// 2. Implement `sealed::EncodeValue<T>` / `sealed::DecodeValue<T>` with the bounds your
///    format needs
pub mod sealed {
    use super::*;

    pub trait EncodeValue<T>: Send + Sync + 'static {
        fn encode_value(&self, value: &T) -> Result<Bytes>;
    }

    pub trait DecodeValue<T>: Send + Sync + 'static {
        fn decode_value(&self, bytes: Bytes) -> Result<T>;
    }
}

/// Serializes a value into an opaque blob.
pub trait Encoder: Send + Sync + 'static {
    fn encode<T>(&self, value: &T) -> Result<Bytes>
    where
        Self: sealed::EncodeValue<T>,
    {
        sealed::EncodeValue::encode_value(self, value)
    }
}

/// Deserializes a value from an opaque blob.
pub trait Decoder: Send + Sync + 'static {
    fn decode<T>(&self, bytes: Bytes) -> Result<T>
    where
        Self: sealed::DecodeValue<T>,
    {
        sealed::DecodeValue::decode_value(self, bytes)
    }
}

pub trait Codec: Encoder + Decoder {}

impl<U> Codec for U where U: Encoder + Decoder {}

/// A codec able to handle every blob the engine itself persists or roams:
/// state envelopes, results, continuation lists and outboxes.
pub trait StateCodec:
    Codec
    + sealed::EncodeValue<StateEnvelope>
    + sealed::DecodeValue<StateEnvelope>
    + sealed::EncodeValue<RoutineResult>
    + sealed::DecodeValue<RoutineResult>
    + sealed::EncodeValue<Vec<ContinuationDescriptor>>
    + sealed::DecodeValue<Vec<ContinuationDescriptor>>
    + sealed::EncodeValue<Outbox>
    + sealed::DecodeValue<Outbox>
{
}

impl<U> StateCodec for U where
    U: Codec
        + sealed::EncodeValue<StateEnvelope>
        + sealed::DecodeValue<StateEnvelope>
        + sealed::EncodeValue<RoutineResult>
        + sealed::DecodeValue<RoutineResult>
        + sealed::EncodeValue<Vec<ContinuationDescriptor>>
        + sealed::DecodeValue<Vec<ContinuationDescriptor>>
    + sealed::EncodeValue<Outbox>
    + sealed::DecodeValue<Outbox>
{
}
