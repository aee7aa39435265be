//! Tree node definition and the promotion rule.
//!
//! Each node in the tree is addressed by `(level, key)`:
//! - Level 0 holds one leaf per entry plus the *anchor*, a leaf with the empty key
//! - A key is promoted to the next level depending only on the key itself
//! - The anchor exists at every level and the topmost anchor is the root

use crate::hash::{Hash, Hasher};
use serde::{Deserialize, Serialize};

/// Expected number of children per interior node.
pub const FANOUT: u32 = 32;

const PROMOTION_LIMIT: u32 = u32::MAX / FANOUT;

/// A node of the tree, as exchanged by the sync protocol.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Height above the leaves. Leaves are level 0.
    pub level: u8,

    /// First key covered by this node. Empty for the anchor.
    #[serde(with = "hex_bytes")]
    pub key: Vec<u8>,

    /// Leaf hash, or hash of the children's hashes for interior nodes.
    pub hash: Hash,

    /// The entry value. Only present on leaves, and only when explicitly requested.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "hex_bytes_opt")]
    pub value: Option<Vec<u8>>,
}

impl Node {
    /// Whether this is the anchor of its level.
    pub fn is_anchor(&self) -> bool {
        self.key.is_empty()
    }

    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    /// The same node with its value stripped.
    pub fn without_value(mut self) -> Self {
        self.value = None;
        self
    }
}

/// Whether a key present at `level` is also present at `level + 1`.
///
/// The anchor is always promoted. For every other key the decision is a pure
/// function of `(level, key)`, so the tree shape depends only on the key set.
pub fn is_promoted(level: u8, key: &[u8]) -> bool {
    if key.is_empty() {
        return true;
    }
    let mut hasher = Hasher::new();
    hasher.update(&[level]);
    hasher.update(key);
    let digest = hasher.finalize();
    let prefix = digest.as_bytes();
    u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) < PROMOTION_LIMIT
}

/// Serde helpers for byte strings carried as lowercase hex.
pub mod hex_bytes {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        serializer.serialize_str(&hex)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        decode(&s).ok_or_else(|| de::Error::custom("invalid hex"))
    }

    pub fn decode(s: &str) -> Option<Vec<u8>> {
        if s.len() % 2 != 0 {
            return None;
        }
        s.as_bytes()
            .chunks(2)
            .map(|chunk| {
                std::str::from_utf8(chunk)
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
            })
            .collect()
    }
}

pub mod hex_bytes_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => super::hex_bytes::serialize(bytes, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let s = Option::<String>::deserialize(deserializer)?;
        match s {
            Some(s) => super::hex_bytes::decode(&s)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom("invalid hex")),
            None => Ok(None),
        }
    }
}
