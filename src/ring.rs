// SPDX-License-Identifier: MIT OR Apache-2.0

//! Rings: generation-numbered, multiply-signed containers of peer ids and a typed payload.
//!
//! Rings follow the signing and versioning discipline of the circle, but only list peer ids and
//! carry a payload whose meaning depends on the ring type: backup key bags, the recovery key bag
//! or plain view membership.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cbor::{EncodeError, encode_cbor};
use crate::concordance::Concordant;
use crate::crypto::x25519;
use crate::identity::{PeerId, PrivateKey, PublicKey};
use crate::keybag::{BackupSliceKeyBag, KeyBagError, RecoveryKeyBag};
use crate::signed::{Generation, GenerationOverflow, Signatures};
use crate::view::{ViewName, ViewSet};

const BACKUP_PREFIX: &str = "backup-";
const MEMBERSHIP_PREFIX: &str = "view-";
const RECOVERY_NAME: &str = "recovery";

/// Name a ring is published under.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RingName(String);

impl RingName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Ring distributing the backup secret of a view.
    pub fn backup(view: &ViewName) -> Self {
        Self(format!("{BACKUP_PREFIX}{view}"))
    }

    /// Ring listing the devices syncing a view.
    pub fn membership(view: &ViewName) -> Self {
        Self(format!("{MEMBERSHIP_PREFIX}{view}"))
    }

    pub fn recovery() -> Self {
        Self(RECOVERY_NAME.to_string())
    }

    /// Returns true if a ring of the given type may be published under this name.
    ///
    /// Backup rings live under backup names only and the recovery ring under the recovery name,
    /// every other name holds view membership.
    pub fn allows(&self, ring_type: RingType) -> bool {
        let is_backup = self.0.starts_with(BACKUP_PREFIX);
        let is_recovery = self.0 == RECOVERY_NAME;
        match ring_type {
            RingType::Backup => is_backup,
            RingType::Recovery => is_recovery,
            RingType::Base | RingType::EntropyKeyed => !is_backup && !is_recovery,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RingName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a ring, fixed when the ring is created.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RingType {
    Base,
    Backup,
    Recovery,
    EntropyKeyed,
}

/// Devices syncing a set of views.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewMembership {
    views: ViewSet,
}

impl ViewMembership {
    pub fn new(views: ViewSet) -> Self {
        Self { views }
    }

    pub fn views(&self) -> &ViewSet {
        &self.views
    }
}

/// Payload of a ring, decoded once together with the ring.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RingPayload {
    BackupKeyBag(BackupSliceKeyBag),
    RecoveryKeyBag(RecoveryKeyBag),
    ViewMembership(ViewMembership),
}

impl RingPayload {
    /// Returns true if this payload is what the given ring type carries.
    pub fn fits(&self, ring_type: RingType) -> bool {
        matches!(
            (self, ring_type),
            (RingPayload::BackupKeyBag(_), RingType::Backup)
                | (RingPayload::RecoveryKeyBag(_), RingType::Recovery)
                | (RingPayload::ViewMembership(_), RingType::Base)
                | (RingPayload::ViewMembership(_), RingType::EntropyKeyed)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ring {
    name: RingName,
    ring_type: RingType,
    generation: Generation,
    member_ids: BTreeSet<PeerId>,
    payload: RingPayload,
    signatures: Signatures,
}

impl Ring {
    /// Unsigned ring at generation zero.
    pub fn new(
        name: RingName,
        ring_type: RingType,
        member_ids: BTreeSet<PeerId>,
        payload: RingPayload,
    ) -> Result<Self, RingError> {
        if !payload.fits(ring_type) {
            return Err(RingError::PayloadMismatch(ring_type));
        }
        Ok(Self {
            name,
            ring_type,
            generation: Generation::default(),
            member_ids,
            payload,
            signatures: Signatures::default(),
        })
    }

    pub fn name(&self) -> &RingName {
        &self.name
    }

    pub fn ring_type(&self) -> RingType {
        self.ring_type
    }

    pub fn member_ids(&self) -> &BTreeSet<PeerId> {
        &self.member_ids
    }

    pub fn payload(&self) -> &RingPayload {
        &self.payload
    }

    pub fn key_bag(&self) -> Option<&BackupSliceKeyBag> {
        match &self.payload {
            RingPayload::BackupKeyBag(bag) => Some(bag),
            _ => None,
        }
    }

    pub fn recovery_bag(&self) -> Option<&RecoveryKeyBag> {
        match &self.payload {
            RingPayload::RecoveryKeyBag(bag) => Some(bag),
            _ => None,
        }
    }

    /// Copy of this ring with new contents, at the same generation and without signatures.
    ///
    /// The ring type can't be changed.
    pub fn with_contents(
        &self,
        member_ids: BTreeSet<PeerId>,
        payload: RingPayload,
    ) -> Result<Self, RingError> {
        if !payload.fits(self.ring_type) {
            return Err(RingError::PayloadMismatch(self.ring_type));
        }
        Ok(Self {
            name: self.name.clone(),
            ring_type: self.ring_type,
            generation: self.generation,
            member_ids,
            payload,
            signatures: Signatures::default(),
        })
    }

    /// Returns true if a backup ring does not cover the eligible peers and recovery key.
    ///
    /// Rings of other types never need fixing this way.
    pub fn needs_fix(
        &self,
        eligible: &BTreeMap<PeerId, x25519::PublicKey>,
        recovery_key: Option<&x25519::PublicKey>,
    ) -> bool {
        match &self.payload {
            RingPayload::BackupKeyBag(bag) => {
                bag.needs_fix(eligible, recovery_key)
                    || !self.member_ids.iter().eq(eligible.keys())
            }
            _ => false,
        }
    }

    pub fn same_content(&self, other: &Ring) -> bool {
        self.name == other.name
            && self.ring_type == other.ring_type
            && self.generation == other.generation
            && self.member_ids == other.member_ids
            && self.payload == other.payload
    }

    /// Moves to the next generation and signs it with the anchor and, if the local device is
    /// listed, with the device key.
    pub fn generation_sign(
        &mut self,
        anchor: Option<&PrivateKey>,
        peer_id: &PeerId,
        private_key: &PrivateKey,
    ) -> Result<(), RingError> {
        self.generation = self.generation.next()?;
        self.signatures.clear();
        let bytes = self.signing_bytes()?;
        if let Some(anchor) = anchor {
            self.signatures.sign_anchor(anchor, &bytes);
        }
        if self.member_ids.contains(peer_id) {
            self.signatures
                .sign_member(peer_id.clone(), private_key, &bytes);
        }
        Ok(())
    }

    /// Adds the countersignature of the local device.
    pub fn concordance_sign(
        &mut self,
        peer_id: &PeerId,
        private_key: &PrivateKey,
    ) -> Result<(), RingError> {
        if !self.member_ids.contains(peer_id) {
            return Err(RingError::NotAMember(peer_id.clone()));
        }
        let bytes = self.signing_bytes()?;
        self.signatures
            .sign_member(peer_id.clone(), private_key, &bytes);
        Ok(())
    }

    /// Takes over valid signatures of another copy of the same generation.
    pub fn merge_signatures(
        &mut self,
        other: &Ring,
        anchor: Option<&PublicKey>,
        keys: &BTreeMap<PeerId, PublicKey>,
    ) -> Result<bool, RingError> {
        if !self.same_content(other) {
            return Ok(false);
        }
        let bytes = self.signing_bytes()?;
        let member_ids = &self.member_ids;
        Ok(self
            .signatures
            .merge(&other.signatures, &bytes, anchor, |peer_id| {
                if member_ids.contains(peer_id) {
                    keys.get(peer_id).copied()
                } else {
                    None
                }
            }))
    }

    /// Checks that the name and payload fit the ring type, that a backup bag covers exactly the
    /// listed peers and that no retired peer is listed.
    pub fn check_structure(&self, retired: &BTreeSet<PeerId>) -> Result<(), RingError> {
        if !self.payload.fits(self.ring_type) {
            return Err(RingError::PayloadMismatch(self.ring_type));
        }

        if !self.name.allows(self.ring_type) {
            return Err(RingError::NameMismatch(self.name.clone(), self.ring_type));
        }

        if let RingPayload::BackupKeyBag(bag) = &self.payload {
            if !self.member_ids.iter().eq(bag.wrapped().keys()) {
                return Err(RingError::BagMismatch);
            }
        }

        if let Some(peer_id) = self.member_ids.iter().find(|id| retired.contains(id)) {
            return Err(RingError::Retired(peer_id.clone()));
        }

        Ok(())
    }
}

impl Concordant for Ring {
    fn generation(&self) -> Generation {
        self.generation
    }

    fn signing_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        encode_cbor(&(
            "ring",
            &self.name,
            self.ring_type,
            self.generation,
            &self.member_ids,
            &self.payload,
        ))
    }

    fn signatures(&self) -> &Signatures {
        &self.signatures
    }

    fn signer_ids(&self) -> BTreeSet<PeerId> {
        self.member_ids.clone()
    }

    fn is_reset(&self) -> bool {
        self.member_ids.is_empty()
    }

    fn is_well_formed(&self, retired: &BTreeSet<PeerId>) -> bool {
        self.check_structure(retired).is_ok()
    }
}

#[derive(Debug, Error)]
pub enum RingError {
    #[error("payload does not fit ring type {0:?}")]
    PayloadMismatch(RingType),

    #[error("ring type can't change from {0:?} to {1:?}")]
    TypeChanged(RingType, RingType),

    #[error("ring {0} can't be of type {1:?}")]
    NameMismatch(RingName, RingType),

    #[error("backup key bag does not match the ring members")]
    BagMismatch,

    #[error("peer {0} is not a member of the ring")]
    NotAMember(PeerId),

    #[error("retired peer {0} is listed in the ring")]
    Retired(PeerId),

    #[error(transparent)]
    KeyBag(#[from] KeyBagError),

    #[error(transparent)]
    Generation(#[from] GenerationOverflow),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}
