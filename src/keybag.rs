// SPDX-License-Identifier: MIT OR Apache-2.0

//! Containers distributing secrets to the devices of a circle.
//!
//! A [`BackupSliceKeyBag`] wraps one symmetric backup secret of a view individually for every
//! eligible device (and optionally for the recovery key), so each of them can unwrap it with
//! their own backup key. A [`RecoveryKeyBag`] announces the current recovery key to all members.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::hpke::{self, HpkeCiphertext, HpkeError};
use crate::crypto::sha2::{SHA256_DIGEST_SIZE, sha2_256};
use crate::crypto::x25519::{self, KeyFingerprint};
use crate::crypto::{Rng, RngError, Secret};
use crate::identity::PeerId;
use crate::timestamp::Timestamp;
use crate::view::ViewName;

/// 256-bit backup secret.
pub const BACKUP_SECRET_SIZE: usize = 32;

/// Domain separation for wrapped backup slices.
const BACKUP_SLICE_INFO: &[u8] = b"backup-slice";

/// Recipient label used when wrapping for the recovery key.
const RECOVERY_RECIPIENT: &[u8] = b"recovery";

/// Public identifier of a backup secret, the SHA256 digest of the secret itself.
pub type BackupSecretId = [u8; SHA256_DIGEST_SIZE];

/// Symmetric secret protecting the backup of one view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupSecret(Secret<BACKUP_SECRET_SIZE>);

impl BackupSecret {
    pub fn from_rng(rng: &Rng) -> Result<Self, RngError> {
        Ok(Self(Secret::from_bytes(rng.random_array()?)))
    }

    pub fn from_bytes(bytes: [u8; BACKUP_SECRET_SIZE]) -> Self {
        Self(Secret::from_bytes(bytes))
    }

    pub fn id(&self) -> BackupSecretId {
        sha2_256(&[self.0.as_bytes()])
    }

    pub fn as_bytes(&self) -> &[u8; BACKUP_SECRET_SIZE] {
        self.0.as_bytes()
    }
}

/// Secret wrapped for one recipient key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedSecret {
    key_fingerprint: KeyFingerprint,
    ciphertext: HpkeCiphertext,
}

impl WrappedSecret {
    fn seal(
        secret: &BackupSecret,
        public_key: &x25519::PublicKey,
        aad: &[u8],
    ) -> Result<Self, KeyBagError> {
        let ciphertext = hpke::wrap(public_key, BACKUP_SLICE_INFO, aad, secret.as_bytes())?;
        Ok(Self {
            key_fingerprint: public_key.fingerprint(),
            ciphertext,
        })
    }

    fn open(
        &self,
        secret_key: &x25519::SecretKey,
        aad: &[u8],
    ) -> Result<BackupSecret, KeyBagError> {
        if secret_key.public_key().fingerprint() != self.key_fingerprint {
            return Err(KeyBagError::WrongKey);
        }
        let plaintext = hpke::unwrap(&self.ciphertext, secret_key, BACKUP_SLICE_INFO, aad)?;
        let bytes: [u8; BACKUP_SECRET_SIZE] = plaintext
            .try_into()
            .map_err(|_| KeyBagError::InvalidSecretSize)?;
        Ok(BackupSecret::from_bytes(bytes))
    }

    pub fn key_fingerprint(&self) -> &KeyFingerprint {
        &self.key_fingerprint
    }
}

/// Backup secret of one view, wrapped for every eligible device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSliceKeyBag {
    view: ViewName,
    #[serde(with = "serde_bytes")]
    secret_id: BackupSecretId,
    wrapped: BTreeMap<PeerId, WrappedSecret>,
    recovery: Option<WrappedSecret>,
}

fn peer_aad(view: &ViewName, peer_id: &PeerId) -> Vec<u8> {
    [view.as_str().as_bytes(), b"/", peer_id.as_str().as_bytes()].concat()
}

fn recovery_aad(view: &ViewName) -> Vec<u8> {
    [view.as_str().as_bytes(), b"/", RECOVERY_RECIPIENT].concat()
}

impl BackupSliceKeyBag {
    /// Wraps `secret` for every given peer and the recovery key.
    pub fn create(
        view: ViewName,
        secret: &BackupSecret,
        peers: &BTreeMap<PeerId, x25519::PublicKey>,
        recovery_key: Option<&x25519::PublicKey>,
    ) -> Result<Self, KeyBagError> {
        let mut wrapped = BTreeMap::new();
        for (peer_id, public_key) in peers {
            let slice = WrappedSecret::seal(secret, public_key, &peer_aad(&view, peer_id))?;
            wrapped.insert(peer_id.clone(), slice);
        }

        let recovery = match recovery_key {
            Some(public_key) => Some(WrappedSecret::seal(
                secret,
                public_key,
                &recovery_aad(&view),
            )?),
            None => None,
        };

        Ok(Self {
            view,
            secret_id: secret.id(),
            wrapped,
            recovery,
        })
    }

    pub fn view(&self) -> &ViewName {
        &self.view
    }

    pub fn secret_id(&self) -> &BackupSecretId {
        &self.secret_id
    }

    pub fn wrapped(&self) -> &BTreeMap<PeerId, WrappedSecret> {
        &self.wrapped
    }

    pub fn has_recovery(&self) -> bool {
        self.recovery.is_some()
    }

    /// Unwraps the secret with the backup key of the given peer.
    pub fn open(
        &self,
        peer_id: &PeerId,
        secret_key: &x25519::SecretKey,
    ) -> Result<BackupSecret, KeyBagError> {
        let slice = self
            .wrapped
            .get(peer_id)
            .ok_or_else(|| KeyBagError::NotARecipient(peer_id.clone()))?;
        let secret = slice.open(secret_key, &peer_aad(&self.view, peer_id))?;
        self.check(secret)
    }

    /// Unwraps the secret with the recovery key.
    pub fn open_with_recovery(
        &self,
        recovery_secret: &x25519::SecretKey,
    ) -> Result<BackupSecret, KeyBagError> {
        let slice = self.recovery.as_ref().ok_or(KeyBagError::NoRecoverySlice)?;
        let secret = slice.open(recovery_secret, &recovery_aad(&self.view))?;
        self.check(secret)
    }

    fn check(&self, secret: BackupSecret) -> Result<BackupSecret, KeyBagError> {
        if secret.id() != self.secret_id {
            return Err(KeyBagError::SecretMismatch);
        }
        Ok(secret)
    }

    /// Returns true if the bag doesn't match the set of eligible peers and the recovery key.
    ///
    /// This is the case when an eligible peer has no slice, a slice was made for an outdated key,
    /// a peer holds a slice without being eligible anymore or the recovery slice is missing,
    /// outdated or superfluous.
    pub fn needs_fix(
        &self,
        eligible: &BTreeMap<PeerId, x25519::PublicKey>,
        recovery_key: Option<&x25519::PublicKey>,
    ) -> bool {
        if eligible.len() != self.wrapped.len() {
            return true;
        }

        let peers_match = eligible.iter().all(|(peer_id, public_key)| {
            self.wrapped
                .get(peer_id)
                .is_some_and(|slice| slice.key_fingerprint == public_key.fingerprint())
        });
        if !peers_match {
            return true;
        }

        match (recovery_key, &self.recovery) {
            (None, None) => false,
            (Some(public_key), Some(slice)) => slice.key_fingerprint != public_key.fingerprint(),
            _ => true,
        }
    }

    /// Returns true if the secret of this bag can be kept when re-wrapping for `eligible`.
    ///
    /// This is the case if every peer holding a slice is still eligible with the same key and
    /// the recovery key holding a slice (if any) is still the current one. Otherwise someone
    /// lost access and the secret needs to be rotated.
    pub fn can_keep_secret(
        &self,
        eligible: &BTreeMap<PeerId, x25519::PublicKey>,
        recovery_key: Option<&x25519::PublicKey>,
    ) -> bool {
        let peers_kept = self.wrapped.iter().all(|(peer_id, slice)| {
            eligible
                .get(peer_id)
                .is_some_and(|public_key| slice.key_fingerprint == public_key.fingerprint())
        });

        let recovery_kept = match (&self.recovery, recovery_key) {
            (None, _) => true,
            (Some(slice), Some(public_key)) => slice.key_fingerprint == public_key.fingerprint(),
            (Some(_), None) => false,
        };

        peers_kept && recovery_kept
    }
}

/// Announces the recovery key of the group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryKeyBag {
    recovery_key: Option<x25519::PublicKey>,
    created_at: Timestamp,
}

impl RecoveryKeyBag {
    pub fn new(recovery_key: Option<x25519::PublicKey>, created_at: Timestamp) -> Self {
        Self {
            recovery_key,
            created_at,
        }
    }

    pub fn recovery_key(&self) -> Option<&x25519::PublicKey> {
        self.recovery_key.as_ref()
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn fingerprint(&self) -> Option<KeyFingerprint> {
        self.recovery_key.as_ref().map(x25519::PublicKey::fingerprint)
    }
}

#[derive(Debug, Error)]
pub enum KeyBagError {
    #[error("peer {0} holds no slice in this key bag")]
    NotARecipient(PeerId),

    #[error("key bag holds no slice for the recovery key")]
    NoRecoverySlice,

    #[error("slice was wrapped for a different key")]
    WrongKey,

    #[error("unwrapped secret has invalid size")]
    InvalidSecretSize,

    #[error("unwrapped secret does not match the key bag")]
    SecretMismatch,

    #[error(transparent)]
    Hpke(#[from] HpkeError),

    #[error(transparent)]
    Rng(#[from] RngError),
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use assert_matches::assert_matches;

    use crate::crypto::Rng;
    use crate::crypto::x25519::SecretKey;
    use crate::identity::{PeerId, PrivateKey};

    use super::{BackupSecret, BackupSliceKeyBag, KeyBagError};

    fn peer(rng: &Rng) -> (PeerId, SecretKey) {
        let peer_id = PeerId::from(&PrivateKey::from_rng(rng).unwrap().public_key());
        (peer_id, SecretKey::from_rng(rng).unwrap())
    }

    #[test]
    fn every_recipient_can_open() {
        let rng = Rng::from_seed([1; 32]);
        let (alice, alice_key) = peer(&rng);
        let (bob, bob_key) = peer(&rng);
        let (charlie, charlie_key) = peer(&rng);
        let recovery_key = SecretKey::from_rng(&rng).unwrap();

        let eligible = BTreeMap::from([
            (alice.clone(), alice_key.public_key()),
            (bob.clone(), bob_key.public_key()),
        ]);
        let secret = BackupSecret::from_rng(&rng).unwrap();
        let bag = BackupSliceKeyBag::create(
            "passwords".into(),
            &secret,
            &eligible,
            Some(&recovery_key.public_key()),
        )
        .unwrap();

        assert_eq!(bag.open(&alice, &alice_key).unwrap(), secret);
        assert_eq!(bag.open(&bob, &bob_key).unwrap(), secret);
        assert_eq!(bag.open_with_recovery(&recovery_key).unwrap(), secret);

        assert_matches!(
            bag.open(&charlie, &charlie_key),
            Err(KeyBagError::NotARecipient(_))
        );
        assert_matches!(bag.open(&alice, &bob_key), Err(KeyBagError::WrongKey));
    }

    #[test]
    fn needs_fix_follows_eligibility() {
        let rng = Rng::from_seed([2; 32]);
        let (alice, alice_key) = peer(&rng);
        let (bob, bob_key) = peer(&rng);
        let recovery_key = SecretKey::from_rng(&rng).unwrap().public_key();

        let mut eligible = BTreeMap::from([(alice.clone(), alice_key.public_key())]);
        let secret = BackupSecret::from_rng(&rng).unwrap();
        let bag = BackupSliceKeyBag::create("passwords".into(), &secret, &eligible, None).unwrap();
        assert!(!bag.needs_fix(&eligible, None));

        // Recovery key got added.
        assert!(bag.needs_fix(&eligible, Some(&recovery_key)));

        // Bob added a backup key.
        eligible.insert(bob.clone(), bob_key.public_key());
        assert!(bag.needs_fix(&eligible, None));
        assert!(bag.can_keep_secret(&eligible, Some(&recovery_key)));

        // Alice rotated her backup key.
        let new_key = SecretKey::from_rng(&rng).unwrap();
        eligible.insert(alice.clone(), new_key.public_key());
        eligible.remove(&bob);
        assert!(bag.needs_fix(&eligible, None));
        assert!(!bag.can_keep_secret(&eligible, None));

        // Alice left.
        assert!(bag.needs_fix(&BTreeMap::new(), None));
    }
}
