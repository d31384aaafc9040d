// SPDX-License-Identifier: MIT OR Apache-2.0

//! Boundary to the external store-and-forward or push transport.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cbor::{DecodeError, EncodeError, decode_cbor, encode_cbor};
use crate::circle::Circle;
use crate::peer::PeerInfo;
use crate::ring::Ring;

const RETIREMENT_PREFIX: &str = "retirement-";

/// Interface for publishing signed containers under their name.
pub trait Transport {
    /// Publish the encoded container, replacing whatever was published under this name before.
    fn publish(&self, name: &str, bytes: Vec<u8>) -> impl Future<Output = Result<(), TransportError>>;
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not reachable: {0}")]
    Unreachable(String),

    #[error("transport rejected publication of {0}")]
    Rejected(String),
}

/// Container as it travels over the transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    Circle(Circle),
    Ring(Ring),

    /// Retirement ticket of a device.
    Retirement(PeerInfo),
}

impl Envelope {
    /// Name the container is published under.
    pub fn name(&self) -> String {
        match self {
            Envelope::Circle(circle) => circle.name().to_string(),
            Envelope::Ring(ring) => ring.name().to_string(),
            Envelope::Retirement(ticket) => retirement_name(ticket),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        encode_cbor(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode_cbor(bytes)
    }
}

/// Name a device's retirement ticket is published under.
pub fn retirement_name(ticket: &PeerInfo) -> String {
    format!("{RETIREMENT_PREFIX}{}", ticket.peer_id())
}
