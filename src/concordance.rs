// SPDX-License-Identifier: MIT OR Apache-2.0

//! Classifies a proposed circle or ring against the previously accepted one.
//!
//! Evaluation is pure: it looks at generations, signatures and structure of both states and
//! returns a [`Verdict`], it never changes any state. What to do with a verdict is decided by
//! [`Action::for_verdict`](crate::action::Action::for_verdict).
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::cbor::EncodeError;
use crate::crypto::sha2::sha2_256;
use crate::identity::{PeerId, PublicKey};
use crate::peer::PeerInfo;
use crate::signed::{Generation, Signatures};

/// Outcome of comparing a proposed state with the accepted one.
///
/// When several conditions hold, the first one in this order is reported: `NoUserKey`,
/// `GenerationOld`, `BadUserSignature`, `BadPeerSignature`, `NoUserSignature`,
/// `InvalidMembership`, `NoPeerLeft`, `NoPeerSignature`, `MissingMe`, `NotWorthy` and finally
/// `Trusted`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    /// Proposal is newer, correctly signed and countersigned by a trusted member (or vouched for
    /// by the anchor alone when nobody is trusted yet).
    Trusted,

    /// Proposal is older than the accepted state, or loses the tie-break against a concurrent
    /// state of the same generation.
    GenerationOld,

    /// Anchor signature is present but invalid.
    BadUserSignature,

    /// Signature of a known peer is present but invalid.
    BadPeerSignature,

    /// Anchor signature is missing, or was made with a rotated-out anchor key.
    NoUserSignature,

    /// No trusted member countersigned the proposal yet.
    NoPeerSignature,

    /// None of the trusted members remains in the proposal.
    NoPeerLeft,

    /// No anchor key is known locally.
    NoUserKey,

    /// Local peer was an active member and got dropped from the proposal.
    MissingMe,

    /// Local peer's record in the proposal is older than the one the local device asserts.
    NotWorthy,

    /// Proposal violates structural invariants.
    InvalidMembership,
}

/// Common surface of circles and rings the concordance rules operate on.
pub trait Concordant {
    fn generation(&self) -> Generation;

    /// Canonical bytes all signatures are computed over.
    fn signing_bytes(&self) -> Result<Vec<u8>, EncodeError>;

    fn signatures(&self) -> &Signatures;

    /// Peers which are expected to countersign this state.
    fn signer_ids(&self) -> BTreeSet<PeerId>;

    /// Public key of a peer as recorded inside this state, if the state carries peer records.
    fn recorded_key(&self, _peer_id: &PeerId) -> Option<PublicKey> {
        None
    }

    /// Returns true if this is an empty reset state.
    fn is_reset(&self) -> bool;

    /// Checks structural invariants. `retired` peers must not appear as active participants.
    fn is_well_formed(&self, retired: &BTreeSet<PeerId>) -> bool;

    /// Reports problems with the local peer's own standing in this state.
    fn local_standing(&self, _old: Option<&Self>, _trust: &Trust<'_>) -> Option<Verdict> {
        None
    }

    /// SHA256 digest of the signing bytes, used to order concurrent states of one generation.
    fn digest(&self) -> Result<[u8; 32], EncodeError> {
        Ok(sha2_256(&[&self.signing_bytes()?]))
    }
}

/// Everything the local device knows about trust when evaluating a proposal.
#[derive(Clone, Debug)]
pub struct Trust<'a> {
    /// Id of the local device.
    pub local_peer: &'a PeerId,

    /// Current record of the local device.
    pub local_record: Option<&'a PeerInfo>,

    /// Current anchor key.
    pub anchor: Option<&'a PublicKey>,

    /// Anchor key which was replaced by the current one.
    pub previous_anchor: Option<&'a PublicKey>,

    /// Members whose countersignature counts for the proposal.
    pub trusted: &'a BTreeMap<PeerId, PublicKey>,

    /// Further known keys which are used to check signatures.
    pub directory: &'a BTreeMap<PeerId, PublicKey>,

    /// Peers which retired.
    pub retired: &'a BTreeSet<PeerId>,
}

impl Trust<'_> {
    fn key_of<T: Concordant>(&self, state: &T, peer_id: &PeerId) -> Option<PublicKey> {
        self.trusted
            .get(peer_id)
            .or_else(|| self.directory.get(peer_id))
            .copied()
            .or_else(|| state.recorded_key(peer_id))
    }
}

enum AnchorSignature {
    Valid,
    Previous,
    Missing,
    Invalid,
}

/// Classifies `new` against the previously accepted state `old`.
pub fn evaluate<T: Concordant>(old: Option<&T>, new: &T, trust: &Trust<'_>) -> Verdict {
    let Some(anchor) = trust.anchor else {
        return Verdict::NoUserKey;
    };

    let Ok(bytes) = new.signing_bytes() else {
        return Verdict::InvalidMembership;
    };

    if let Some(old) = old {
        if new.generation() < old.generation() {
            return Verdict::GenerationOld;
        }

        // Concurrent proposals of the same generation: the higher digest wins on every device.
        if new.generation() == old.generation() {
            match (old.signing_bytes(), new.digest(), old.digest()) {
                (Ok(old_bytes), Ok(new_digest), Ok(old_digest)) => {
                    if old_bytes != bytes && new_digest < old_digest {
                        return Verdict::GenerationOld;
                    }
                }
                _ => return Verdict::InvalidMembership,
            }
        }
    }

    let anchor_signature = match new.signatures().anchor() {
        None => AnchorSignature::Missing,
        Some(signature) if anchor.verify(&bytes, signature).is_ok() => AnchorSignature::Valid,
        Some(signature)
            if trust
                .previous_anchor
                .is_some_and(|previous| previous.verify(&bytes, signature).is_ok()) =>
        {
            AnchorSignature::Previous
        }
        Some(_) => AnchorSignature::Invalid,
    };

    if matches!(anchor_signature, AnchorSignature::Invalid) {
        return Verdict::BadUserSignature;
    }

    let mut valid_signers = BTreeSet::new();
    for (peer_id, signature) in new.signatures().members() {
        // Signatures of unknown peers can't be checked and don't count.
        let Some(public_key) = trust.key_of(new, peer_id) else {
            continue;
        };
        if public_key.verify(&bytes, signature).is_err() {
            return Verdict::BadPeerSignature;
        }
        valid_signers.insert(peer_id.clone());
    }

    if !matches!(anchor_signature, AnchorSignature::Valid) {
        return Verdict::NoUserSignature;
    }

    if !new.is_well_formed(trust.retired) {
        return Verdict::InvalidMembership;
    }

    if new.is_reset() {
        return if new.signatures().members().is_empty() {
            Verdict::Trusted
        } else {
            Verdict::InvalidMembership
        };
    }

    // Without any trusted members the anchor signature alone vouches for the proposal.
    if !trust.trusted.is_empty() {
        let signers = new.signer_ids();
        if !trust.trusted.keys().any(|peer_id| signers.contains(peer_id)) {
            return Verdict::NoPeerLeft;
        }

        if !trust
            .trusted
            .keys()
            .any(|peer_id| valid_signers.contains(peer_id))
        {
            return Verdict::NoPeerSignature;
        }
    }

    if let Some(verdict) = new.local_standing(old, trust) {
        return verdict;
    }

    Verdict::Trusted
}

/// Returns true if the state carries a valid signature of the current anchor or of a trusted
/// member.
pub fn is_vouched<T: Concordant>(state: &T, trust: &Trust<'_>) -> bool {
    let Ok(bytes) = state.signing_bytes() else {
        return false;
    };

    let by_anchor = match (trust.anchor, state.signatures().anchor()) {
        (Some(anchor), Some(signature)) => anchor.verify(&bytes, signature).is_ok(),
        _ => false,
    };

    by_anchor
        || state
            .signatures()
            .members()
            .iter()
            .any(|(peer_id, signature)| match trust.trusted.get(peer_id) {
                Some(public_key) => public_key.verify(&bytes, signature).is_ok(),
                None => false,
            })
}

/// Returns true if the accepted state itself verifies under the current anchor.
pub fn is_locally_trusted<T: Concordant>(old: Option<&T>, trust: &Trust<'_>) -> bool {
    let (Some(old), Some(anchor)) = (old, trust.anchor) else {
        return false;
    };
    let (Ok(bytes), Some(signature)) = (old.signing_bytes(), old.signatures().anchor()) else {
        return false;
    };
    anchor.verify(&bytes, signature).is_ok()
}
