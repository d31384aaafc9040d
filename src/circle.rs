// SPDX-License-Identifier: MIT OR Apache-2.0

//! The circle: signed, generation-numbered membership of a device group.
//!
//! A circle lists admitted members, pending applicants and rejected devices. Every accepted
//! change produces a new generation which is signed by the anchor key (if available locally) and
//! countersigned by members. Circles are values: changes are made on a copy of the accepted
//! circle which is then proposed through the concordance rules, the accepted circle itself is
//! only ever replaced as a whole.
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cbor::{EncodeError, encode_cbor};
use crate::concordance::{Concordant, Trust, Verdict};
use crate::identity::{PeerId, PrivateKey, PublicKey};
use crate::peer::{PeerInfo, PeerInfoError};
use crate::signed::{Generation, GenerationOverflow, Signatures};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Circle {
    name: String,
    generation: Generation,
    members: BTreeMap<PeerId, PeerInfo>,
    applicants: BTreeMap<PeerId, PeerInfo>,
    rejected: BTreeMap<PeerId, PeerInfo>,
    signatures: Signatures,
}

impl Circle {
    /// Empty, unsigned circle at generation zero.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            generation: Generation::default(),
            members: BTreeMap::new(),
            applicants: BTreeMap::new(),
            rejected: BTreeMap::new(),
            signatures: Signatures::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &BTreeMap<PeerId, PeerInfo> {
        &self.members
    }

    pub fn applicants(&self) -> &BTreeMap<PeerId, PeerInfo> {
        &self.applicants
    }

    pub fn rejected(&self) -> &BTreeMap<PeerId, PeerInfo> {
        &self.rejected
    }

    pub fn is_member(&self, peer_id: &PeerId) -> bool {
        self.members.contains_key(peer_id)
    }

    pub fn is_applicant(&self, peer_id: &PeerId) -> bool {
        self.applicants.contains_key(peer_id)
    }

    pub fn is_rejected(&self, peer_id: &PeerId) -> bool {
        self.rejected.contains_key(peer_id)
    }

    /// Returns true if the peer shows up in any of the sets.
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.is_member(peer_id) || self.is_applicant(peer_id) || self.is_rejected(peer_id)
    }

    /// Finds the record of a peer in any of the sets.
    pub fn find(&self, peer_id: &PeerId) -> Option<&PeerInfo> {
        self.members
            .get(peer_id)
            .or_else(|| self.applicants.get(peer_id))
            .or_else(|| self.rejected.get(peer_id))
    }

    /// Returns true if the circle has no members, which is the valid "reset" state.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Public keys of all members.
    pub fn member_keys(&self) -> BTreeMap<PeerId, PublicKey> {
        self.members
            .iter()
            .map(|(peer_id, info)| (peer_id.clone(), *info.public_key()))
            .collect()
    }

    /// Returns true if both circles describe the same state, regardless of signatures.
    pub fn same_content(&self, other: &Circle) -> bool {
        self.name == other.name
            && self.generation == other.generation
            && self.members == other.members
            && self.applicants == other.applicants
            && self.rejected == other.rejected
    }

    /// Adds an applicant.
    ///
    /// The application needs to be signed by the anchor and the device must not already be known
    /// to this circle.
    pub fn request_admission(
        &mut self,
        anchor: &PublicKey,
        applicant: PeerInfo,
    ) -> Result<(), CircleError> {
        let peer_id = applicant.peer_id().clone();
        if self.contains(&peer_id) {
            return Err(CircleError::AlreadyPresent(peer_id));
        }
        if applicant.is_retired() {
            return Err(CircleError::Retired(peer_id));
        }
        applicant.verify()?;
        applicant.verify_application(anchor)?;
        self.applicants.insert(peer_id, applicant);
        Ok(())
    }

    /// Removes an application, initiated by the applicant itself.
    pub fn withdraw(&mut self, peer_id: &PeerId) -> Result<PeerInfo, CircleError> {
        self.applicants
            .remove(peer_id)
            .ok_or_else(|| CircleError::NotApplicant(peer_id.clone()))
    }

    /// Moves an applicant into the member set.
    pub fn accept_applicant(&mut self, peer_id: &PeerId) -> Result<(), CircleError> {
        let info = self
            .applicants
            .remove(peer_id)
            .ok_or_else(|| CircleError::NotApplicant(peer_id.clone()))?;
        self.members.insert(peer_id.clone(), info);
        Ok(())
    }

    /// Moves an applicant into the rejected set.
    pub fn reject_applicant(&mut self, peer_id: &PeerId) -> Result<(), CircleError> {
        let info = self
            .applicants
            .remove(peer_id)
            .ok_or_else(|| CircleError::NotApplicant(peer_id.clone()))?;
        self.rejected.insert(peer_id.clone(), info);
        Ok(())
    }

    /// Forgets an earlier rejection so the peer can apply again.
    pub fn clear_rejection(&mut self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.rejected.remove(peer_id)
    }

    /// Drops a peer from members and applicants.
    pub fn remove_peer(&mut self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.members
            .remove(peer_id)
            .or_else(|| self.applicants.remove(peer_id))
    }

    /// Replaces the record of a peer with a newer version of it, in whichever set it is in.
    ///
    /// Returns false if the peer is unknown or the given record is not newer.
    pub fn update_peer(&mut self, info: PeerInfo) -> Result<bool, CircleError> {
        info.verify()?;
        let peer_id = info.peer_id().clone();
        for set in [&mut self.members, &mut self.applicants, &mut self.rejected] {
            if let Some(current) = set.get_mut(&peer_id) {
                if !info.supersedes(current) {
                    return Ok(false);
                }
                *current = info;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Turns this circle into one containing only the given device.
    ///
    /// The generation is kept, signing afterwards moves it forward.
    pub fn reset_to_offering(&mut self, me: PeerInfo) {
        self.reset_to_empty();
        self.members.insert(me.peer_id().clone(), me);
    }

    /// Removes everyone from the circle.
    pub fn reset_to_empty(&mut self) {
        self.members.clear();
        self.applicants.clear();
        self.rejected.clear();
        self.signatures.clear();
    }

    /// Moves to the next generation and signs it.
    ///
    /// All previous signatures are dropped. The anchor signs if its private key is known, the
    /// local device countersigns if it is a member.
    pub fn generation_sign(
        &mut self,
        anchor: Option<&PrivateKey>,
        peer_id: &PeerId,
        private_key: &PrivateKey,
    ) -> Result<(), CircleError> {
        self.generation = self.generation.next()?;
        self.signatures.clear();
        let bytes = self.signing_bytes()?;
        if let Some(anchor) = anchor {
            self.signatures.sign_anchor(anchor, &bytes);
        }
        if self.is_member(peer_id) {
            self.signatures
                .sign_member(peer_id.clone(), private_key, &bytes);
        }
        Ok(())
    }

    /// Adds the countersignature of the local device to the current generation.
    pub fn concordance_sign(
        &mut self,
        peer_id: &PeerId,
        private_key: &PrivateKey,
    ) -> Result<(), CircleError> {
        if !self.is_member(peer_id) {
            return Err(CircleError::NotAMember(peer_id.clone()));
        }
        let bytes = self.signing_bytes()?;
        self.signatures
            .sign_member(peer_id.clone(), private_key, &bytes);
        Ok(())
    }

    /// Takes over valid signatures of another copy of the same generation.
    ///
    /// Returns true if any signature was added.
    pub fn merge_signatures(
        &mut self,
        other: &Circle,
        anchor: Option<&PublicKey>,
    ) -> Result<bool, CircleError> {
        if !self.same_content(other) {
            return Ok(false);
        }
        let bytes = self.signing_bytes()?;
        let keys = self.member_keys();
        Ok(self
            .signatures
            .merge(&other.signatures, &bytes, anchor, |peer_id| {
                keys.get(peer_id).copied()
            }))
    }

    /// Checks that the sets are disjoint, that every record is keyed by its own id and correctly
    /// self-signed, and that no retired device is a member or applicant.
    pub fn check_structure(&self, retired: &BTreeSet<PeerId>) -> Result<(), CircleError> {
        let mut seen = BTreeSet::new();
        for set in [&self.members, &self.applicants, &self.rejected] {
            for (peer_id, info) in set {
                if info.peer_id() != peer_id {
                    return Err(CircleError::KeyMismatch(peer_id.clone()));
                }
                if !seen.insert(peer_id) {
                    return Err(CircleError::Overlap(peer_id.clone()));
                }
                info.verify()?;
            }
        }

        for (peer_id, info) in self.members.iter().chain(self.applicants.iter()) {
            if info.is_retired() || retired.contains(peer_id) {
                return Err(CircleError::Retired(peer_id.clone()));
            }
        }

        if self.members.is_empty() && !self.signatures.members().is_empty() {
            return Err(CircleError::SignedReset);
        }

        Ok(())
    }
}

#[cfg(test)]
impl Circle {
    pub(crate) fn signatures_mut(&mut self) -> &mut Signatures {
        &mut self.signatures
    }

    pub(crate) fn rejected_mut(&mut self) -> &mut BTreeMap<PeerId, PeerInfo> {
        &mut self.rejected
    }

    pub(crate) fn set_generation(&mut self, generation: Generation) {
        self.generation = generation;
    }
}

impl Concordant for Circle {
    fn generation(&self) -> Generation {
        self.generation
    }

    fn signing_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        encode_cbor(&(
            "circle",
            &self.name,
            self.generation,
            &self.members,
            &self.applicants,
            &self.rejected,
        ))
    }

    fn signatures(&self) -> &Signatures {
        &self.signatures
    }

    fn signer_ids(&self) -> BTreeSet<PeerId> {
        self.members.keys().cloned().collect()
    }

    fn recorded_key(&self, peer_id: &PeerId) -> Option<PublicKey> {
        self.members.get(peer_id).map(|info| *info.public_key())
    }

    fn is_reset(&self) -> bool {
        self.members.is_empty()
    }

    fn is_well_formed(&self, retired: &BTreeSet<PeerId>) -> bool {
        self.check_structure(retired).is_ok()
    }

    fn local_standing(&self, old: Option<&Self>, trust: &Trust<'_>) -> Option<Verdict> {
        let local = trust.local_record?;

        // A retired device does not try to get back in.
        if local.is_retired() {
            return None;
        }

        let was_member = old.is_some_and(|old| old.is_member(trust.local_peer));
        if was_member && !self.contains(trust.local_peer) {
            return Some(Verdict::MissingMe);
        }

        match self.find(trust.local_peer) {
            Some(info) if info.version_tag() < local.version_tag() => Some(Verdict::NotWorthy),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CircleError {
    #[error("peer {0} is already part of the circle")]
    AlreadyPresent(PeerId),

    #[error("peer {0} is not an applicant")]
    NotApplicant(PeerId),

    #[error("peer {0} is not a member")]
    NotAMember(PeerId),

    #[error("peer {0} is retired")]
    Retired(PeerId),

    #[error("peer {0} is listed in more than one set")]
    Overlap(PeerId),

    #[error("record listed under {0} belongs to another peer")]
    KeyMismatch(PeerId),

    #[error("empty circle carries member signatures")]
    SignedReset,

    #[error(transparent)]
    PeerInfo(#[from] PeerInfoError),

    #[error(transparent)]
    Generation(#[from] GenerationOverflow),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}
