//! Values stored in the shared state, codecs for typed access, and session tokens.

use std::fmt::{self, Debug, Display};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// The payload type of the shared state dictionary.
///
/// The authority arbitrates a last-writer-wins map of string keys to loosely
/// structured values; JSON is the value model on the wire and in the mirror.
pub type Value = serde_json::Value;

/// Converts between a typed resource value and the untyped [`Value`] payload.
///
/// A codec is supplied by the caller when a typed view over a key is created,
/// so the store itself never needs to know about `T`. Decoding is fallible:
/// a `None` means the stored payload does not fit the expected shape, and the
/// typed view falls back to its configured default.
pub trait ResourceCodec<T>: Send + Sync + 'static {
    /// Encode a typed value into a shared-state payload.
    fn encode(&self, value: &T) -> Value;
    /// Decode a shared-state payload, or `None` if it does not fit `T`.
    fn decode(&self, value: &Value) -> Option<T>;
}

/// The default codec: serde to and from JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T: Serialize + DeserializeOwned> ResourceCodec<T> for JsonCodec {
    fn encode(&self, value: &T) -> Value {
        serde_json::to_value(value).unwrap_or(Value::Null)
    }

    fn decode(&self, value: &Value) -> Option<T> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Opaque per-session identity, minted once per store.
///
/// The authority uses the token to recognize which session holds a key lock,
/// and to attribute update requests. It carries no cryptographic meaning.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionToken([u8; 16]);

impl SessionToken {
    /// Generate a fresh random token.
    pub fn generate() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken({})", hex::encode(self.0))
    }
}

impl Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_codec_roundtrip() {
        let codec = JsonCodec;
        let encoded = ResourceCodec::<f64>::encode(&codec, &1.25);
        assert_eq!(encoded, serde_json::json!(1.25));
        let decoded: Option<f64> = codec.decode(&encoded);
        assert_eq!(decoded, Some(1.25));
    }

    #[test]
    fn json_codec_decode_mismatch() {
        let codec = JsonCodec;
        let decoded: Option<f64> = codec.decode(&serde_json::json!("not a number"));
        assert_eq!(decoded, None);
    }

    #[test]
    fn tokens_are_unique() {
        assert_ne!(SessionToken::generate(), SessionToken::generate());
    }
}
