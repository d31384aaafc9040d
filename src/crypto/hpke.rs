// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wrapping secrets to Curve25519 keys with Hybrid Public Key Encryption (HPKE), using
//! DHKEM-X25519, HKDF SHA256 and ChaCha20Poly1305 AEAD parameters.
//!
//! <https://www.rfc-editor.org/rfc/rfc9180>
use hpke_rs::{Hpke, HpkePrivateKey, HpkePublicKey, Mode};
use hpke_rs_crypto::types::{AeadAlgorithm, KdfAlgorithm, KemAlgorithm};
use hpke_rs_rust_crypto::HpkeRustCrypto;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::x25519::{PublicKey, SecretKey};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HpkeCiphertext {
    /// Encapsulated shared secret.
    #[serde(with = "serde_bytes")]
    pub kem_output: Vec<u8>,

    /// Encrypted payload.
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

fn hpke() -> Hpke<HpkeRustCrypto> {
    Hpke::<HpkeRustCrypto>::new(
        Mode::Base,
        KemAlgorithm::DhKem25519,
        KdfAlgorithm::HkdfSha256,
        AeadAlgorithm::ChaCha20Poly1305,
    )
}

/// Wrap `plaintext` for the holder of `public_key`.
///
/// `info` binds the ciphertext to its purpose and `aad` to its recipient, both need to be
/// repeated when unwrapping.
pub fn wrap(
    public_key: &PublicKey,
    info: &[u8],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<HpkeCiphertext, HpkeError> {
    // `hpke-rs` draws randomness from its own provider here.
    let mut hpke = hpke();
    let pk_r = HpkePublicKey::new(public_key.as_bytes().to_vec());
    let (kem_output, ciphertext) = hpke
        .seal(&pk_r, info, aad, plaintext, None, None, None)
        .map_err(HpkeError::Encryption)?;
    Ok(HpkeCiphertext {
        kem_output,
        ciphertext,
    })
}

/// Unwrap a ciphertext created by [`wrap`] with the matching secret key.
pub fn unwrap(
    input: &HpkeCiphertext,
    secret_key: &SecretKey,
    info: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, HpkeError> {
    let sk_r = HpkePrivateKey::new(secret_key.as_bytes().to_vec());
    let plaintext = hpke()
        .open(
            &input.kem_output,
            &sk_r,
            info,
            aad,
            &input.ciphertext,
            None,
            None,
            None,
        )
        .map_err(HpkeError::Decryption)?;
    Ok(plaintext)
}

#[derive(Debug, Error)]
pub enum HpkeError {
    #[error("could not wrap secret with hpke: {0:?}")]
    Encryption(hpke_rs::HpkeError),

    #[error("could not unwrap secret with hpke: {0:?}")]
    Decryption(hpke_rs::HpkeError),
}
