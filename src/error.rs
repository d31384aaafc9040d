// SPDX-License-Identifier: MIT OR Apache-2.0

use thiserror::Error;

use crate::cbor::{DecodeError, EncodeError};
use crate::circle::CircleError;
use crate::crypto::RngError;
use crate::identity::PeerId;
use crate::keybag::KeyBagError;
use crate::peer::PeerInfoError;
use crate::ring::RingError;
use crate::transport::TransportError;

/// Errors surfaced by the account.
#[derive(Debug, Error)]
pub enum AccountError {
    /// No anchor key is established locally, or only its public half where signing is needed.
    #[error("no trust anchor available")]
    NoTrustAnchor,

    #[error("no circle exists yet")]
    NoGroup,

    #[error("peer {0} is not a member of the circle")]
    NotAMember(PeerId),

    #[error("peer {0} is not an applicant of the circle")]
    NotApplicant(PeerId),

    #[error("proposal is older than the accepted state")]
    StaleProposal,

    #[error("signature on proposal is invalid")]
    SignatureInvalid,

    #[error("received container is malformed: {0}")]
    MalformedContainer(String),

    /// None of the trusted members is left, the device group needs to be reset or rejoined.
    #[error("no trusted member is left in the circle")]
    QuorumLost,

    #[error("peer {0} is retired")]
    Retired(PeerId),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    Circle(#[from] CircleError),

    #[error(transparent)]
    Ring(#[from] RingError),

    #[error(transparent)]
    KeyBag(#[from] KeyBagError),

    #[error(transparent)]
    PeerInfo(#[from] PeerInfoError),
}
