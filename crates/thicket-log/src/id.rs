//! Sortable, content-addressed message identifiers.
//!
//! An [`Id`] is a big-endian logical clock followed by a truncated SHA-256 of
//! the encoded entry. Comparing ids as bytes therefore compares clocks first,
//! so iterating the store in key order visits messages in causal order.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thicket_merkle::{Hash, Hasher};
use thiserror::Error;

/// Bytes taken by the clock prefix.
pub const CLOCK_SIZE: usize = 8;

/// Bytes of the content hash kept in an id.
pub const DIGEST_SIZE: usize = 16;

/// Total width of an encoded id.
pub const ID_SIZE: usize = CLOCK_SIZE + DIGEST_SIZE;

/// A key that is not exactly [`ID_SIZE`] bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid key: expected {ID_SIZE} bytes, got {0}")]
pub struct InvalidKey(pub usize);

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id([u8; ID_SIZE]);

impl Id {
    /// Build an id from a clock and the hash of the encoded entry.
    pub fn encode(clock: u64, hash: &Hash) -> Self {
        let mut bytes = [0u8; ID_SIZE];
        bytes[..CLOCK_SIZE].copy_from_slice(&clock.to_be_bytes());
        bytes[CLOCK_SIZE..].copy_from_slice(&hash.as_bytes()[..DIGEST_SIZE]);
        Id(bytes)
    }

    /// The id of an encoded entry with the given clock.
    pub fn for_value(clock: u64, value: &[u8]) -> Self {
        Self::encode(clock, &Hasher::hash(value))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, InvalidKey> {
        let bytes: [u8; ID_SIZE] = bytes.try_into().map_err(|_| InvalidKey(bytes.len()))?;
        Ok(Id(bytes))
    }

    pub fn clock(&self) -> u64 {
        let mut prefix = [0u8; CLOCK_SIZE];
        prefix.copy_from_slice(&self.0[..CLOCK_SIZE]);
        u64::from_be_bytes(prefix)
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = thicket_merkle::hex_bytes::decode(s)?;
        Self::decode(&bytes).ok()
    }
}

impl AsRef<[u8]> for Id {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({}:{})", self.clock(), &self.to_hex()[CLOCK_SIZE * 2..CLOCK_SIZE * 2 + 8])
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Id::from_hex(&s).ok_or_else(|| de::Error::custom("invalid message id"))
    }
}

/// Clock for a message with the given parents: one past the largest parent clock.
///
/// `None` if a parent already sits at `u64::MAX`.
pub fn get_clock<'a>(parents: impl IntoIterator<Item = &'a Id>) -> Option<u64> {
    match parents.into_iter().map(Id::clock).max() {
        Some(max) => max.checked_add(1),
        None => Some(1),
    }
}
