// SPDX-License-Identifier: MIT OR Apache-2.0

//! Versioning and signing discipline shared by circles and rings.
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::{PeerId, PrivateKey, PublicKey, Signature};

/// Monotonically increasing version counter of a circle or ring.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(u64);

impl Generation {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Following generation, or an error if the counter is exhausted.
    pub fn next(&self) -> Result<Self, GenerationOverflow> {
        self.0.checked_add(1).map(Self).ok_or(GenerationOverflow)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
#[error("generation counter is exhausted")]
pub struct GenerationOverflow;

/// Signatures over the signing bytes of one generation.
///
/// The anchor signature vouches for a state on behalf of the whole group, member signatures are
/// the countersignatures of individual devices.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signatures {
    anchor: Option<Signature>,
    members: BTreeMap<PeerId, Signature>,
}

impl Signatures {
    pub fn anchor(&self) -> Option<&Signature> {
        self.anchor.as_ref()
    }

    pub fn members(&self) -> &BTreeMap<PeerId, Signature> {
        &self.members
    }

    pub fn member(&self, peer_id: &PeerId) -> Option<&Signature> {
        self.members.get(peer_id)
    }

    pub fn has_member(&self, peer_id: &PeerId) -> bool {
        self.members.contains_key(peer_id)
    }

    pub(crate) fn sign_anchor(&mut self, anchor: &PrivateKey, bytes: &[u8]) {
        self.anchor = Some(anchor.sign(bytes));
    }

    pub(crate) fn sign_member(&mut self, peer_id: PeerId, private_key: &PrivateKey, bytes: &[u8]) {
        self.members.insert(peer_id, private_key.sign(bytes));
    }

    pub(crate) fn clear(&mut self) {
        self.anchor = None;
        self.members.clear();
    }

    /// Takes over all signatures of `other` which verify over `bytes` and are missing here.
    ///
    /// `key_of` resolves the public keys of signing members. Returns true if anything was added.
    pub(crate) fn merge<F>(
        &mut self,
        other: &Signatures,
        bytes: &[u8],
        anchor: Option<&PublicKey>,
        key_of: F,
    ) -> bool
    where
        F: Fn(&PeerId) -> Option<PublicKey>,
    {
        let mut changed = false;

        if let (None, Some(signature), Some(anchor)) = (self.anchor, other.anchor, anchor) {
            if anchor.verify(bytes, &signature).is_ok() {
                self.anchor = Some(signature);
                changed = true;
            }
        }

        for (peer_id, signature) in &other.members {
            if self.members.contains_key(peer_id) {
                continue;
            }
            let Some(public_key) = key_of(peer_id) else {
                continue;
            };
            if public_key.verify(bytes, signature).is_ok() {
                self.members.insert(peer_id.clone(), *signature);
                changed = true;
            }
        }

        changed
    }
}

#[cfg(test)]
impl Signatures {
    pub(crate) fn replace_anchor(&mut self, signature: Signature) {
        self.anchor = Some(signature);
    }

    pub(crate) fn replace_member(&mut self, peer_id: PeerId, signature: Signature) {
        self.members.insert(peer_id, signature);
    }
}
