// SPDX-License-Identifier: MIT OR Apache-2.0

//! Self-attested description of one device in a circle.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cbor::{EncodeError, encode_cbor};
use crate::crypto::x25519;
use crate::identity::{PeerId, PrivateKey, PublicKey, Signature, SignatureError};
use crate::timestamp::Timestamp;
use crate::view::{ViewName, ViewSet};

/// Display attributes of a device.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceGestalt {
    pub name: String,
    pub model: String,

    /// Hardware serial number, if the platform exposes one. Used to spot duplicate enrollments
    /// of the same device.
    pub serial_number: Option<String>,
}

impl DeviceGestalt {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            serial_number: None,
        }
    }

    pub fn with_serial_number(mut self, serial_number: impl Into<String>) -> Self {
        self.serial_number = Some(serial_number.into());
        self
    }
}

/// Record describing one device enrollment.
///
/// Peer records can only be changed by their owning device: every change bumps the version tag
/// and is covered by a new self-signature. The anchor key additionally signs the identity of the
/// device when it applies to a circle, which is what makes a record admissible.
///
/// A retired record is a terminal tombstone and serves as the device's retirement ticket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    peer_id: PeerId,
    public_key: PublicKey,
    gestalt: DeviceGestalt,
    enabled_views: ViewSet,
    permitted_views: ViewSet,
    backup_public_key: Option<x25519::PublicKey>,
    retired_at: Option<Timestamp>,
    version_tag: u64,
    application_signature: Option<Signature>,
    signature: Signature,
}

impl PeerInfo {
    /// Creates and self-signs the first record of a device.
    pub fn new(
        private_key: &PrivateKey,
        gestalt: DeviceGestalt,
        enabled_views: ViewSet,
        permitted_views: ViewSet,
    ) -> Result<Self, PeerInfoError> {
        let public_key = private_key.public_key();
        let enabled_views = enabled_views
            .intersection(&permitted_views)
            .cloned()
            .collect();
        let mut info = Self {
            peer_id: PeerId::from(&public_key),
            public_key,
            gestalt,
            enabled_views,
            permitted_views,
            backup_public_key: None,
            retired_at: None,
            version_tag: 1,
            application_signature: None,
            // Placeholder, replaced right below.
            signature: Signature::from_bytes([0; 64]),
        };
        info.signature = private_key.sign(&info.signing_bytes()?);
        Ok(info)
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn gestalt(&self) -> &DeviceGestalt {
        &self.gestalt
    }

    pub fn enabled_views(&self) -> &ViewSet {
        &self.enabled_views
    }

    pub fn permitted_views(&self) -> &ViewSet {
        &self.permitted_views
    }

    pub fn has_view(&self, view: &ViewName) -> bool {
        self.enabled_views.contains(view)
    }

    pub fn backup_public_key(&self) -> Option<&x25519::PublicKey> {
        self.backup_public_key.as_ref()
    }

    /// Returns the backup key of this peer if it should hold a slice of the given view's backup
    /// secret.
    pub fn backup_key_for(&self, view: &ViewName) -> Option<&x25519::PublicKey> {
        if self.is_retired() || !self.has_view(view) {
            return None;
        }
        self.backup_public_key.as_ref()
    }

    pub fn is_retired(&self) -> bool {
        self.retired_at.is_some()
    }

    pub fn retired_at(&self) -> Option<Timestamp> {
        self.retired_at
    }

    pub fn version_tag(&self) -> u64 {
        self.version_tag
    }

    pub fn has_application_signature(&self) -> bool {
        self.application_signature.is_some()
    }

    /// Returns true if both records are enrollments of the same physical device.
    ///
    /// This is only a heuristic based on the serial number and never proves anything.
    pub fn is_ghost_of(&self, other: &PeerInfo) -> bool {
        if self.peer_id == other.peer_id {
            return false;
        }
        match (&self.gestalt.serial_number, &other.gestalt.serial_number) {
            (Some(a), Some(b)) => !a.is_empty() && a == b,
            _ => false,
        }
    }

    /// Bytes covered by the self-signature.
    fn signing_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        encode_cbor(&(
            &self.peer_id,
            &self.public_key,
            &self.gestalt,
            &self.enabled_views,
            &self.permitted_views,
            &self.backup_public_key,
            &self.retired_at,
            self.version_tag,
        ))
    }

    /// Bytes covered by the anchor's application signature.
    ///
    /// Only the identity of the device is covered, so the owner can keep changing its attributes
    /// without having to re-apply.
    fn application_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        encode_cbor(&("application", &self.peer_id, &self.public_key))
    }

    /// Checks the binding between id and key and the self-signature.
    pub fn verify(&self) -> Result<(), PeerInfoError> {
        if PeerId::from(&self.public_key) != self.peer_id {
            return Err(PeerInfoError::PeerIdMismatch(self.peer_id.clone()));
        }
        self.public_key
            .verify(&self.signing_bytes()?, &self.signature)
            .map_err(PeerInfoError::InvalidSelfSignature)
    }

    /// Checks that the anchor admitted this device to apply.
    pub fn verify_application(&self, anchor: &PublicKey) -> Result<(), PeerInfoError> {
        let signature = self
            .application_signature
            .as_ref()
            .ok_or(PeerInfoError::MissingApplicationSignature)?;
        anchor
            .verify(&self.application_bytes()?, signature)
            .map_err(PeerInfoError::InvalidApplicationSignature)
    }

    /// Signs the device's identity with the anchor key, turning the record into a valid
    /// application.
    pub fn sign_application(&mut self, anchor: &PrivateKey) -> Result<(), PeerInfoError> {
        self.application_signature = Some(anchor.sign(&self.application_bytes()?));
        Ok(())
    }

    /// Applies a change made by the owning device, bumps the version tag and re-signs.
    fn update<F>(&self, private_key: &PrivateKey, change: F) -> Result<Self, PeerInfoError>
    where
        F: FnOnce(&mut Self),
    {
        if private_key.public_key() != self.public_key {
            return Err(PeerInfoError::NotOwner(self.peer_id.clone()));
        }
        if self.is_retired() {
            return Err(PeerInfoError::Retired(self.peer_id.clone()));
        }
        let mut info = self.clone();
        change(&mut info);
        info.version_tag += 1;
        info.signature = private_key.sign(&info.signing_bytes()?);
        Ok(info)
    }

    /// Enables and disables views. Views not permitted for this device are ignored.
    pub fn with_views(
        &self,
        private_key: &PrivateKey,
        enable: &ViewSet,
        disable: &ViewSet,
    ) -> Result<Self, PeerInfoError> {
        self.update(private_key, |info| {
            let permitted = enable.intersection(&info.permitted_views);
            let permitted: Vec<ViewName> = permitted.cloned().collect();
            info.enabled_views.extend(permitted);
            for view in disable {
                info.enabled_views.remove(view);
            }
        })
    }

    pub fn with_backup_public_key(
        &self,
        private_key: &PrivateKey,
        backup_public_key: Option<x25519::PublicKey>,
    ) -> Result<Self, PeerInfoError> {
        self.update(private_key, |info| {
            info.backup_public_key = backup_public_key;
        })
    }

    pub fn with_gestalt(
        &self,
        private_key: &PrivateKey,
        gestalt: DeviceGestalt,
    ) -> Result<Self, PeerInfoError> {
        self.update(private_key, |info| {
            info.gestalt = gestalt;
        })
    }

    /// Creates the retirement ticket of this device.
    ///
    /// The ticket is the final version of the record: it can't be changed afterwards.
    pub fn retire(&self, private_key: &PrivateKey, at: Timestamp) -> Result<Self, PeerInfoError> {
        self.update(private_key, |info| {
            info.retired_at = Some(at);
        })
    }

    /// Returns true if this is a different, newer version of the same record.
    pub fn supersedes(&self, other: &PeerInfo) -> bool {
        self.peer_id == other.peer_id && self.version_tag > other.version_tag
    }
}

#[derive(Debug, Error)]
pub enum PeerInfoError {
    #[error("peer id {0} does not match its public key")]
    PeerIdMismatch(PeerId),

    #[error("invalid self-signature on peer record: {0}")]
    InvalidSelfSignature(SignatureError),

    #[error("peer record has no application signature")]
    MissingApplicationSignature,

    #[error("invalid application signature on peer record: {0}")]
    InvalidApplicationSignature(SignatureError),

    #[error("peer record of {0} can only be changed by its owner")]
    NotOwner(PeerId),

    #[error("peer {0} is retired and its record can't be changed anymore")]
    Retired(PeerId),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::crypto::Rng;
    use crate::crypto::x25519;
    use crate::identity::{AnchorKey, PrivateKey};
    use crate::timestamp::Timestamp;
    use crate::view::{ViewSet, view_set};

    use super::{DeviceGestalt, PeerInfo, PeerInfoError};

    fn peer(rng: &Rng, serial: Option<&str>) -> (PrivateKey, PeerInfo) {
        let private_key = PrivateKey::from_rng(rng).unwrap();
        let mut gestalt = DeviceGestalt::new("laptop", "thinkpad");
        gestalt.serial_number = serial.map(ToString::to_string);
        let info = PeerInfo::new(
            &private_key,
            gestalt,
            view_set(["passwords", "photos"]),
            view_set(["passwords", "contacts"]),
        )
        .unwrap();
        (private_key, info)
    }

    #[test]
    fn enabled_views_are_permitted() {
        let rng = Rng::from_seed([1; 32]);
        let (private_key, info) = peer(&rng, None);

        assert!(info.verify().is_ok());
        assert_eq!(info.enabled_views(), &view_set(["passwords"]));

        let info = info
            .with_views(&private_key, &view_set(["contacts", "music"]), &view_set(["passwords"]))
            .unwrap();
        assert_eq!(info.enabled_views(), &view_set(["contacts"]));
        assert_eq!(info.version_tag(), 2);
        assert!(info.verify().is_ok());
    }

    #[test]
    fn only_owner_can_change_record() {
        let rng = Rng::from_seed([2; 32]);
        let (_, info) = peer(&rng, None);
        let (other_key, _) = peer(&rng, None);

        assert_matches!(
            info.with_backup_public_key(&other_key, None),
            Err(PeerInfoError::NotOwner(_))
        );
    }

    #[test]
    fn tampering_breaks_self_signature() {
        let rng = Rng::from_seed([3; 32]);
        let (private_key, info) = peer(&rng, None);
        let backup_key = x25519::SecretKey::from_rng(&rng).unwrap().public_key();

        let mut tampered = info.clone();
        tampered.backup_public_key = Some(backup_key);
        assert_matches!(
            tampered.verify(),
            Err(PeerInfoError::InvalidSelfSignature(_))
        );

        let updated = info
            .with_backup_public_key(&private_key, Some(backup_key))
            .unwrap();
        assert!(updated.verify().is_ok());
        assert!(updated.supersedes(&info));
        assert_eq!(
            updated.backup_key_for(&"passwords".into()),
            Some(&backup_key)
        );
        assert_eq!(updated.backup_key_for(&"contacts".into()), None);
    }

    #[test]
    fn application_survives_owner_updates() {
        let rng = Rng::from_seed([4; 32]);
        let anchor = AnchorKey::derive(b"passphrase", b"salt").unwrap();
        let (private_key, mut info) = peer(&rng, None);

        assert_matches!(
            info.verify_application(anchor.public_key()),
            Err(PeerInfoError::MissingApplicationSignature)
        );

        info.sign_application(anchor.private_key().unwrap()).unwrap();
        assert!(info.verify_application(anchor.public_key()).is_ok());

        let info = info
            .with_gestalt(&private_key, DeviceGestalt::new("desktop", "framework"))
            .unwrap();
        assert!(info.verify_application(anchor.public_key()).is_ok());

        let other_anchor = AnchorKey::derive(b"other", b"salt").unwrap();
        assert_matches!(
            info.verify_application(other_anchor.public_key()),
            Err(PeerInfoError::InvalidApplicationSignature(_))
        );
    }

    #[test]
    fn retired_records_are_final() {
        let rng = Rng::from_seed([5; 32]);
        let (private_key, info) = peer(&rng, None);

        let ticket = info.retire(&private_key, Timestamp::new(100)).unwrap();
        assert!(ticket.is_retired());
        assert!(ticket.verify().is_ok());
        assert_eq!(ticket.backup_key_for(&"passwords".into()), None);
        assert_matches!(
            ticket.with_views(&private_key, &view_set(["contacts"]), &ViewSet::new()),
            Err(PeerInfoError::Retired(_))
        );
    }

    #[test]
    fn ghosts_share_serial_number() {
        let rng = Rng::from_seed([6; 32]);
        let (_, info_1) = peer(&rng, Some("C02XYZ"));
        let (_, info_2) = peer(&rng, Some("C02XYZ"));
        let (_, info_3) = peer(&rng, None);
        let (_, info_4) = peer(&rng, Some(""));
        let (_, info_5) = peer(&rng, Some(""));

        assert!(info_1.is_ghost_of(&info_2));
        assert!(!info_1.is_ghost_of(&info_1));
        assert!(!info_1.is_ghost_of(&info_3));
        assert!(!info_4.is_ghost_of(&info_5));
    }
}
