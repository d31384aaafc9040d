// SPDX-License-Identifier: MIT OR Apache-2.0

//! Signing keys of devices and of the group's trust anchor.
//!
//! Every device signs with its own Ed25519 key and is identified by a [`PeerId`] derived from the
//! public half. The anchor key is shared by the whole device group: it is deterministically
//! derived from the group passphrase, so any device which knows the passphrase can sign with it.
use std::fmt;

use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::hkdf::{HkdfError, hkdf};
use crate::crypto::sha2::sha2_256;
use crate::crypto::x25519;
use crate::crypto::{Rng, RngError, Secret};

pub const PRIVATE_KEY_SIZE: usize = 32;
pub const PUBLIC_KEY_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

/// Number of digest bytes a peer id is made of.
const PEER_ID_SIZE: usize = 16;

const ANCHOR_INFO: &[u8] = b"trust-circle anchor v1";

/// Ed25519 private key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateKey(Secret<PRIVATE_KEY_SIZE>);

impl PrivateKey {
    pub fn from_bytes(bytes: [u8; PRIVATE_KEY_SIZE]) -> Self {
        Self(Secret::from_bytes(bytes))
    }

    pub fn from_rng(rng: &Rng) -> Result<Self, RngError> {
        Ok(Self::from_bytes(rng.random_array()?))
    }

    pub fn public_key(&self) -> PublicKey {
        let signing_key = ed25519_dalek::SigningKey::from_bytes(self.0.as_bytes());
        PublicKey(signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, bytes: &[u8]) -> Signature {
        let signing_key = ed25519_dalek::SigningKey::from_bytes(self.0.as_bytes());
        Signature(signing_key.sign(bytes).to_bytes())
    }
}

/// Ed25519 public key.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "serde_bytes")] [u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub fn verify(&self, bytes: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(&self.0)
            .map_err(|_| SignatureError::InvalidPublicKey)?;
        let signature = ed25519_dalek::Signature::from_bytes(&signature.0);
        verifying_key
            .verify(bytes, &signature)
            .map_err(|_| SignatureError::VerificationFailed)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey").field(&self.to_hex()).finish()
    }
}

/// Ed25519 signature.
#[derive(Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "serde_bytes")] [u8; SIGNATURE_SIZE]);

impl Signature {
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn to_bytes(self) -> [u8; SIGNATURE_SIZE] {
        self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Signature")
            .field(&hex::encode(&self.0[..8]))
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("signature does not match public key and payload")]
    VerificationFailed,

    #[error("bytes do not represent a valid ed25519 public key")]
    InvalidPublicKey,
}

/// Identifier of one device enrollment.
///
/// Hex-encoded, truncated SHA256 digest of the device's public key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&PublicKey> for PeerId {
    fn from(public_key: &PublicKey) -> Self {
        let digest = sha2_256(&[public_key.as_bytes()]);
        Self(hex::encode(&digest[..PEER_ID_SIZE]))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Ids received from other devices are not guaranteed to be hex.
        let short: String = self.0.chars().take(8).collect();
        write!(f, "<PeerId {short}>")
    }
}

/// Key every device of a group shares, anchoring trust independently of any single device.
///
/// Devices which did not yet learn the passphrase only hold the public half and can verify, but
/// not sign.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorKey {
    public_key: PublicKey,
    private_key: Option<PrivateKey>,
}

impl AnchorKey {
    /// Derives the anchor key pair from the group passphrase.
    pub fn derive(passphrase: &[u8], salt: &[u8]) -> Result<Self, HkdfError> {
        let seed: [u8; PRIVATE_KEY_SIZE] = hkdf(salt, passphrase, Some(ANCHOR_INFO))?;
        Ok(Self::from_private_key(PrivateKey::from_bytes(seed)))
    }

    pub fn from_private_key(private_key: PrivateKey) -> Self {
        Self {
            public_key: private_key.public_key(),
            private_key: Some(private_key),
        }
    }

    pub fn from_public_key(public_key: PublicKey) -> Self {
        Self {
            public_key,
            private_key: None,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn private_key(&self) -> Option<&PrivateKey> {
        self.private_key.as_ref()
    }

    pub fn can_sign(&self) -> bool {
        self.private_key.is_some()
    }

    /// Drops the private half.
    pub fn to_public(&self) -> Self {
        Self::from_public_key(self.public_key)
    }
}

/// Secret keys of the local device.
///
/// The signing key identifies the device and signs its records and countersignatures, the
/// backup secret unwraps backup and recovery key bags addressed to this device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Credentials {
    pub(crate) private_key: PrivateKey,
    pub(crate) backup_secret: x25519::SecretKey,
}

impl Credentials {
    pub fn new(rng: &Rng) -> Result<Self, RngError> {
        let private_key = PrivateKey::from_rng(rng)?;
        let backup_secret = x25519::SecretKey::from_rng(rng)?;
        Ok(Self {
            private_key,
            backup_secret,
        })
    }

    pub fn from_keys(private_key: PrivateKey, backup_secret: x25519::SecretKey) -> Self {
        Self {
            private_key,
            backup_secret,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from(&self.public_key())
    }

    pub fn public_key(&self) -> PublicKey {
        self.private_key.public_key()
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    pub fn backup_secret(&self) -> &x25519::SecretKey {
        &self.backup_secret
    }

    pub fn backup_public_key(&self) -> x25519::PublicKey {
        self.backup_secret.public_key()
    }
}
