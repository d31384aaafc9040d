// SPDX-License-Identifier: MIT OR Apache-2.0

//! Versioned persistence of the account state.
//!
//! State is encoded as a CBOR sequence starting with its format version. Older versions carry
//! fewer fields, missing ones are filled with defaults when reading them:
//!
//! - `6`: local peer, circle and retirees
//! - `7`: adds rings and the departure reason
//! - `8`: adds the previous circle and the expansion store
//!
//! The anchor key is never persisted, it has to be installed again after loading.
use std::collections::BTreeMap;
use std::fmt;

use serde::de::{Error as SerdeError, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use tracing::debug;

use crate::cbor::{decode_cbor, encode_cbor};
use crate::circle::Circle;
use crate::config::Config;
use crate::crypto::Rng;
use crate::error::AccountError;
use crate::event::Notifier;
use crate::identity::Credentials;
use crate::peer::PeerInfo;
use crate::ring::{Ring, RingPayload};
use crate::transport::Transport;

use super::{Account, DepartureReason, RecoveryHandle, Retiree};

pub const CURRENT_VERSION: u64 = 8;

const SUPPORTED_VERSIONS: [u64; 3] = [6, 7, CURRENT_VERSION];

#[derive(Clone, Debug, PartialEq)]
pub(super) struct PersistedState {
    version: u64,
    local_peer: PeerInfo,
    circle: Option<Circle>,
    previous_circle: Option<Circle>,
    retirees: Vec<Retiree>,
    rings: Vec<Ring>,
    departure: DepartureReason,
    expansion: BTreeMap<String, ByteBuf>,
}

impl PersistedState {
    fn field_count(&self) -> usize {
        match self.version {
            6 => 4,
            7 => 6,
            _ => 8,
        }
    }
}

impl Serialize for PersistedState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(self.field_count()))?;
        seq.serialize_element(&self.version)?;
        seq.serialize_element(&self.local_peer)?;
        seq.serialize_element(&self.circle)?;

        if self.version >= 8 {
            seq.serialize_element(&self.previous_circle)?;
        }

        seq.serialize_element(&self.retirees)?;

        if self.version >= 7 {
            seq.serialize_element(&self.rings)?;
            seq.serialize_element(&self.departure)?;
        }

        if self.version >= 8 {
            seq.serialize_element(&self.expansion)?;
        }

        seq.end()
    }
}

impl<'de> Deserialize<'de> for PersistedState {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct PersistedStateVisitor;

        impl<'de> Visitor<'de> for PersistedStateVisitor {
            type Value = PersistedState;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("account state encoded as a sequence")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let version: u64 = seq
                    .next_element()
                    .map_err(|_| SerdeError::custom("invalid version, expected u64"))?
                    .ok_or(SerdeError::custom("version missing"))?;

                if !SUPPORTED_VERSIONS.contains(&version) {
                    return Err(SerdeError::custom(format!(
                        "unsupported state version {version}"
                    )));
                }

                let local_peer: PeerInfo = seq
                    .next_element()
                    .map_err(|err| SerdeError::custom(format!("invalid local peer: {err}")))?
                    .ok_or(SerdeError::custom("local peer missing"))?;

                let circle: Option<Circle> = seq
                    .next_element()
                    .map_err(|err| SerdeError::custom(format!("invalid circle: {err}")))?
                    .ok_or(SerdeError::custom("circle missing"))?;

                let previous_circle: Option<Circle> = if version >= 8 {
                    seq.next_element()
                        .map_err(|err| {
                            SerdeError::custom(format!("invalid previous circle: {err}"))
                        })?
                        .ok_or(SerdeError::custom("previous circle missing"))?
                } else {
                    None
                };

                let retirees: Vec<Retiree> = seq
                    .next_element()
                    .map_err(|err| SerdeError::custom(format!("invalid retirees: {err}")))?
                    .ok_or(SerdeError::custom("retirees missing"))?;

                let (rings, departure) = if version >= 7 {
                    let rings: Vec<Ring> = seq
                        .next_element()
                        .map_err(|err| SerdeError::custom(format!("invalid rings: {err}")))?
                        .ok_or(SerdeError::custom("rings missing"))?;
                    let departure: DepartureReason = seq
                        .next_element()
                        .map_err(|_| SerdeError::custom("invalid departure reason"))?
                        .ok_or(SerdeError::custom("departure reason missing"))?;
                    (rings, departure)
                } else {
                    (Vec::new(), DepartureReason::default())
                };

                let expansion: BTreeMap<String, ByteBuf> = if version >= 8 {
                    seq.next_element()
                        .map_err(|_| SerdeError::custom("invalid expansion, expected map"))?
                        .ok_or(SerdeError::custom("expansion missing"))?
                } else {
                    BTreeMap::new()
                };

                Ok(PersistedState {
                    version,
                    local_peer,
                    circle,
                    previous_circle,
                    retirees,
                    rings,
                    departure,
                    expansion,
                })
            }
        }

        deserializer.deserialize_seq(PersistedStateVisitor)
    }
}

impl<T, N> Account<T, N>
where
    T: Transport,
    N: Notifier,
{
    fn to_persisted(&self) -> PersistedState {
        PersistedState {
            version: CURRENT_VERSION,
            local_peer: self.local_peer.clone(),
            circle: self.circle.clone(),
            previous_circle: self.previous_circle.clone(),
            retirees: self.retirees.values().cloned().collect(),
            rings: self.rings.values().cloned().collect(),
            departure: self.departure,
            expansion: self.expansion.clone(),
        }
    }

    /// Encodes the account state in the current format.
    pub fn serialize(&self) -> Result<Vec<u8>, AccountError> {
        Ok(encode_cbor(&self.to_persisted())?)
    }

    /// Restores an account from state written by [`Account::serialize`] or an older format.
    ///
    /// The stored local peer has to belong to the given credentials.
    pub fn deserialize(
        bytes: &[u8],
        config: Config,
        credentials: Credentials,
        rng: Rng,
        transport: T,
        notifier: N,
    ) -> Result<Self, AccountError> {
        let state: PersistedState = decode_cbor(bytes)?;
        Self::from_persisted(state, config, credentials, rng, transport, notifier)
    }

    fn from_persisted(
        state: PersistedState,
        config: Config,
        credentials: Credentials,
        rng: Rng,
        transport: T,
        notifier: N,
    ) -> Result<Self, AccountError> {
        state.local_peer.verify()?;
        if *state.local_peer.public_key() != credentials.public_key() {
            return Err(AccountError::MalformedContainer(
                "stored state belongs to another device".to_string(),
            ));
        }

        let mut account = Self::from_parts(
            config,
            credentials,
            rng,
            state.local_peer,
            transport,
            notifier,
        );
        account.circle = state.circle;
        account.previous_circle = state.previous_circle;
        account.retirees = state
            .retirees
            .into_iter()
            .map(|retiree| (retiree.ticket().peer_id().clone(), retiree))
            .collect();
        account.rings = state
            .rings
            .into_iter()
            .map(|ring| (ring.name().clone(), ring))
            .collect();
        account.expansion = state.expansion;

        account.departure = if state.version >= 7 {
            state.departure
        } else if account.status() == super::CircleStatus::InCircle {
            DepartureReason::InCircle
        } else {
            DepartureReason::default()
        };

        account.recovery = account.rings.values().find_map(|ring| match ring.payload() {
            RingPayload::RecoveryKeyBag(bag) => bag.recovery_key().copied().map(RecoveryHandle::new),
            _ => None,
        });
        account.update_progress();

        debug!(
            version = state.version,
            rings = account.rings.len(),
            retirees = account.retirees.len(),
            "restored account state"
        );
        Ok(account)
    }
}

#[cfg(test)]
impl PersistedState {
    /// Same state written in an older format.
    pub(super) fn downgrade(mut self, version: u64) -> Self {
        self.version = version;
        self
    }
}

#[cfg(test)]
impl<T, N> Account<T, N>
where
    T: Transport,
    N: Notifier,
{
    pub(super) fn serialize_as(&self, version: u64) -> Vec<u8> {
        encode_cbor(&self.to_persisted().downgrade(version)).unwrap()
    }
}
