// SPDX-License-Identifier: MIT OR Apache-2.0

//! Curve25519 key pairs used as backup and recovery keys.
//!
//! Only the key material lives here, wrapping secrets to these keys is done with HPKE.
use std::fmt;

use serde::{Deserialize, Serialize};
use x25519_dalek::StaticSecret;

use crate::crypto::sha2::sha2_256;
use crate::crypto::{Rng, RngError, Secret};

/// 256-bit secret key size.
pub const SECRET_KEY_SIZE: usize = 32;

/// 256-bit public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Fingerprint size of a public key.
pub const FINGERPRINT_SIZE: usize = 8;

/// Secret Curve25519 key a device or the recovery holder unwraps key bags with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKey(Secret<SECRET_KEY_SIZE>);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        let clamped = StaticSecret::from(bytes).to_bytes();
        SecretKey(Secret::from_bytes(clamped))
    }

    pub fn from_rng(rng: &Rng) -> Result<Self, RngError> {
        Ok(Self::from_bytes(rng.random_array()?))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; SECRET_KEY_SIZE] {
        self.0.as_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(*self.0.as_bytes());
        PublicKey(x25519_dalek::PublicKey::from(&secret).to_bytes())
    }
}

/// Public Curve25519 key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "serde_bytes")] [u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    pub fn from_bytes(public_key: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(public_key)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Short digest identifying this key inside key bags.
    pub fn fingerprint(&self) -> KeyFingerprint {
        let digest = sha2_256(&[b"x25519", &self.0]);
        let mut bytes = [0u8; FINGERPRINT_SIZE];
        bytes.copy_from_slice(&digest[..FINGERPRINT_SIZE]);
        KeyFingerprint(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Truncated hash of a [`PublicKey`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyFingerprint(#[serde(with = "serde_bytes")] [u8; FINGERPRINT_SIZE]);

impl fmt::Display for KeyFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}
