//! Messages and their canonical encoding.

use crate::error::{LogError, Result};
use crate::id::Id;
use crate::signature::Signature;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// One log message.
///
/// In a sequenced log `clock` is one past the largest parent clock and
/// `parents` is the author's frontier at the time of writing. In an
/// unsequenced log both are zero/empty.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message<P> {
    pub clock: u64,
    /// Sorted and free of duplicates.
    pub parents: Vec<Id>,
    pub payload: P,
}

impl<P> Message<P> {
    pub fn new(clock: u64, mut parents: Vec<Id>, payload: P) -> Self {
        parents.sort();
        parents.dedup();
        Message {
            clock,
            parents,
            payload,
        }
    }
}

/// A decoded entry together with its id and the exact bytes it was decoded from.
#[derive(Clone, Debug)]
pub struct SignedMessage<P> {
    pub id: Id,
    pub signature: Option<Signature>,
    pub message: Message<P>,
    pub value: Vec<u8>,
}

impl<P: Serialize + DeserializeOwned> SignedMessage<P> {
    /// Encode a message and derive its id.
    pub fn encode(signature: Option<Signature>, message: Message<P>) -> Result<Self> {
        let value = encode_value(signature.as_ref(), &message)?;
        Ok(SignedMessage {
            id: Id::for_value(message.clock, &value),
            signature,
            message,
            value,
        })
    }

    /// Decode an entry value exactly as it was published.
    ///
    /// Values not in canonical form are rejected, so one message has one id.
    pub fn decode(value: Vec<u8>) -> Result<Self> {
        let (signature, message) = decode_value(&value)?;
        let json: serde_json::Value = serde_json::from_slice(&value)
            .map_err(|e| LogError::Validation(format!("malformed entry: {}", e)))?;
        if canonical(&json)? != value {
            return Err(LogError::Validation("entry is not canonically encoded".into()));
        }
        Ok(SignedMessage {
            id: Id::for_value(message.clock, &value),
            signature,
            message,
            value,
        })
    }
}

/// Compact JSON with object keys in sorted order, whatever map type the payload uses.
fn canonical<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_value(value)
        .and_then(|json| serde_json::to_vec(&json))
        .map_err(|e| LogError::Validation(e.to_string()))
}

/// Entry value: JSON array `[signature, message]`.
pub fn encode_value<P: Serialize>(signature: Option<&Signature>, message: &Message<P>) -> Result<Vec<u8>> {
    canonical(&(signature, message))
}

pub fn decode_value<P: DeserializeOwned>(value: &[u8]) -> Result<(Option<Signature>, Message<P>)> {
    serde_json::from_slice(value).map_err(|e| LogError::Validation(format!("malformed entry: {}", e)))
}

/// Bytes covered by a signature. Binding the topic keeps a signature from being
/// replayed into another log.
pub fn signed_bytes<P: Serialize>(topic: &str, message: &Message<P>) -> Result<Vec<u8>> {
    canonical(&(topic, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn scores(pairs: &[(&str, u32)]) -> HashMap<String, u32> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_parents_sorted_and_deduped() {
        let a = Id::for_value(1, b"a");
        let b = Id::for_value(1, b"b");
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let message = Message::new(2, vec![hi, lo, hi], ());
        assert_eq!(message.parents, vec![lo, hi]);
    }

    #[test]
    fn test_id_covers_exact_bytes() {
        let encoded = SignedMessage::encode(None, Message::new(1, vec![], "hello".to_string())).unwrap();
        let decoded = SignedMessage::<String>::decode(encoded.value.clone()).unwrap();
        assert_eq!(decoded.id, encoded.id);
        assert_eq!(decoded.message.payload, "hello");
        assert_eq!(decoded.id.clock(), 1);
    }

    #[test]
    fn test_different_payloads_different_ids() {
        let a = SignedMessage::encode(None, Message::new(1, vec![], 1u32)).unwrap();
        let b = SignedMessage::encode(None, Message::new(1, vec![], 2u32)).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_malformed_value_rejected() {
        assert!(matches!(
            SignedMessage::<String>::decode(b"not json".to_vec()),
            Err(LogError::Validation(_))
        ));
    }

    #[test]
    fn test_signed_bytes_bind_topic() {
        let message = Message::new(1, vec![], 5u8);
        assert_ne!(signed_bytes("a", &message).unwrap(), signed_bytes("b", &message).unwrap());
    }

    #[test]
    fn test_map_payload_encodes_independent_of_insertion_order() {
        let pairs: Vec<(String, u32)> = (0..64).map(|n| (format!("player-{}", n), n)).collect();
        let forward: HashMap<String, u32> = pairs.iter().cloned().collect();
        let backward: HashMap<String, u32> = pairs.iter().rev().cloned().collect();

        let a = Message::new(1, vec![], forward);
        let b = Message::new(1, vec![], backward);
        assert_eq!(encode_value(None, &a).unwrap(), encode_value(None, &b).unwrap());
        assert_eq!(signed_bytes("t", &a).unwrap(), signed_bytes("t", &b).unwrap());
    }

    #[test]
    fn test_map_payload_survives_decode() {
        let message = Message::new(1, vec![], scores(&[("carol", 3), ("alice", 1), ("bob", 2)]));
        let encoded = SignedMessage::encode(None, message.clone()).unwrap();
        let decoded = SignedMessage::<HashMap<String, u32>>::decode(encoded.value.clone()).unwrap();
        assert_eq!(decoded.id, encoded.id);
        assert_eq!(decoded.message, message);
        assert_eq!(
            signed_bytes("t", &decoded.message).unwrap(),
            signed_bytes("t", &message).unwrap()
        );
    }

    #[test]
    fn test_non_canonical_value_rejected() {
        let encoded = SignedMessage::encode(None, Message::new(1, vec![], scores(&[("a", 1), ("b", 2)]))).unwrap();
        let text = String::from_utf8(encoded.value).unwrap();
        let reordered = text.replace(r#"{"a":1,"b":2}"#, r#"{"b":2,"a":1}"#);
        assert_ne!(reordered, text);
        assert!(matches!(
            SignedMessage::<HashMap<String, u32>>::decode(reordered.into_bytes()),
            Err(LogError::Validation(_))
        ));
        let spaced = text.replacen(',', ", ", 1);
        assert!(matches!(
            SignedMessage::<HashMap<String, u32>>::decode(spaced.into_bytes()),
            Err(LogError::Validation(_))
        ));
    }
}
