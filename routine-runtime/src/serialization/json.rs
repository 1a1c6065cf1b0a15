use anyhow::Result;
use bytes::Bytes;
use routine_core::codec::{Decoder, Encoder, sealed};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// JSON codec for routine state, results and continuation lists.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Encoder for JsonCodec {}
impl Decoder for JsonCodec {}

impl<T> sealed::EncodeValue<T> for JsonCodec
where
    T: Serialize,
{
    fn encode_value(&self, value: &T) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }
}

impl<T> sealed::DecodeValue<T> for JsonCodec
where
    T: DeserializeOwned,
{
    fn decode_value(&self, bytes: Bytes) -> Result<T> {
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use routine_core::state::PendingKind;
    use routine_core::{CallerInfo, RoutineResult, RoutineState, StateEnvelope, TaskId};

    #[test]
    fn envelope_survives_encoding() {
        let codec = JsonCodec;
        let mut state = RoutineState::seeded(Bytes::from_static(b"{\"sku\":\"A-1\"}"));
        state.step = 2;
        state.put(&codec, "quantity", &3u32).unwrap();
        state.open_slot(TaskId::new(0), PendingKind::Checkpoint);
        state.set_awaiting(vec![TaskId::new(0)]);

        let envelope = StateEnvelope {
            state,
            caller: CallerInfo::external(),
        };
        let bytes = codec.encode(&envelope).unwrap();
        let decoded: StateEnvelope = codec.decode(bytes).unwrap();

        assert_eq!(decoded, envelope);
        assert_eq!(decoded.state.get::<_, u32>(&codec, "quantity").unwrap(), Some(3));
    }

    #[test]
    fn decode_rejects_garbage() {
        let result: Result<RoutineResult> = JsonCodec.decode(Bytes::from_static(b"not json"));
        assert!(result.is_err());
    }
}
