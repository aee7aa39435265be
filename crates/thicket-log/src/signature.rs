//! Pluggable signature schemes.
//!
//! A [`Signature`] is opaque to the log apart from its scheme name, which
//! selects the [`Verifier`] that checks it. Ed25519 is built in.

use crate::error::{LogError, Result};
use ed25519_dalek::{Signer as _, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thicket_merkle::hex_bytes;

/// Scheme name of the built-in ed25519 scheme.
pub const ED25519: &str = "ed25519";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub scheme: String,
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key: String = self.public_key.iter().take(4).map(|b| format!("{:02x}", b)).collect();
        write!(f, "Signature({}:{}...)", self.scheme, key)
    }
}

/// Produces signatures for locally authored messages.
pub trait Signer: Send + Sync {
    fn sign(&self, bytes: &[u8]) -> Result<Signature>;
}

/// Checks signatures of one scheme.
pub trait Verifier: Send + Sync {
    fn scheme(&self) -> &str;

    fn verify(&self, signature: &Signature, bytes: &[u8]) -> Result<()>;
}

/// Ed25519 signing key.
#[derive(Clone)]
pub struct Ed25519Signer {
    signing_key: SigningKey,
}

impl Ed25519Signer {
    /// Create a signer with a random key.
    pub fn generate() -> Self {
        Ed25519Signer {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Ed25519Signer {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }
}

impl fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519Signer").finish_non_exhaustive()
    }
}

impl Signer for Ed25519Signer {
    fn sign(&self, bytes: &[u8]) -> Result<Signature> {
        Ok(Signature {
            scheme: ED25519.to_string(),
            public_key: self.public_key().to_vec(),
            signature: self.signing_key.sign(bytes).to_bytes().to_vec(),
        })
    }
}

/// Strict ed25519 verification.
#[derive(Clone, Copy, Debug, Default)]
pub struct Ed25519Verifier;

impl Verifier for Ed25519Verifier {
    fn scheme(&self) -> &str {
        ED25519
    }

    fn verify(&self, signature: &Signature, bytes: &[u8]) -> Result<()> {
        let public_key: [u8; 32] = signature
            .public_key
            .as_slice()
            .try_into()
            .map_err(|_| LogError::Signature("ed25519 public key must be 32 bytes".into()))?;
        let key = VerifyingKey::from_bytes(&public_key)
            .map_err(|e| LogError::Signature(e.to_string()))?;
        let sig = ed25519_dalek::Signature::from_slice(&signature.signature)
            .map_err(|e| LogError::Signature(e.to_string()))?;
        key.verify_strict(bytes, &sig)
            .map_err(|e| LogError::Signature(e.to_string()))
    }
}
