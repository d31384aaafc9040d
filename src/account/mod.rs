// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lifecycle controller of one device's membership in a circle.
//!
//! The [`Account`] exclusively owns the accepted circle, all rings and the retirement log of the
//! local device. Every external event (a container delivered by the transport, a local
//! membership command or periodic maintenance) is handled by one `&mut self` method, so
//! evaluating a proposal and applying the resulting state transition happen atomically. Wrap the
//! account in an [`AccountHandle`](crate::AccountHandle) to share it between tasks.
//!
//! State transitions are applied in a fixed order: the accepted state is replaced, dependent
//! subsystems are notified about membership changes, ring maintenance is scheduled, the new state
//! is published and finally rings are regenerated if needed.
mod backup;
mod circle;
mod persist;
mod retirement;
mod ring;
#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::circle::Circle;
use crate::concordance::Concordant;
use crate::config::Config;
use crate::crypto::Rng;
use crate::crypto::x25519::{self, KeyFingerprint};
use crate::error::AccountError;
use crate::event::{MembershipChange, Notifier};
use crate::identity::{AnchorKey, Credentials, PeerId, PrivateKey, PublicKey};
use crate::peer::{DeviceGestalt, PeerInfo};
use crate::ring::{Ring, RingName};
use crate::sync::{SyncProgress, SyncWaiter};
use crate::transport::{Envelope, Transport};
use crate::view::{ViewName, ViewSet};

pub use retirement::Retiree;

/// Why the local device is not (or not anymore) a member of the circle.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepartureReason {
    /// Device never applied to a circle.
    #[default]
    NeverApplied,

    /// Device is a member, nothing departed.
    InCircle,

    /// Device withdrew its application.
    Withdrew,

    /// Device retired itself.
    Retired,

    /// Another member removed the device.
    MembershipRevoked,

    /// Application was rejected.
    Rejected,

    /// None of the members the device trusted remained in the circle.
    LeftUntrustedCircle,

    /// Circle was reset to an empty state.
    CircleReset,

    /// Device learned about its own retirement from a ticket it signed earlier.
    DiscoveredRetirement,
}

impl DepartureReason {
    /// Returns true if the device was part of a circle and left it.
    pub fn has_departed(&self) -> bool {
        !matches!(
            self,
            DepartureReason::NeverApplied | DepartureReason::InCircle
        )
    }
}

/// Role of the local device in the circle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CircleStatus {
    InCircle,
    Applicant,
    NotInCircle,
    NoGroup,
}

/// Locally cached recovery key, derived from the accepted recovery ring.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RecoveryHandle {
    public_key: x25519::PublicKey,
    fingerprint: KeyFingerprint,
}

impl RecoveryHandle {
    fn new(public_key: x25519::PublicKey) -> Self {
        Self {
            fingerprint: public_key.fingerprint(),
            public_key,
        }
    }

    pub fn public_key(&self) -> &x25519::PublicKey {
        &self.public_key
    }

    pub fn fingerprint(&self) -> &KeyFingerprint {
        &self.fingerprint
    }
}

/// Membership state of one device in a device group.
#[derive(Debug)]
pub struct Account<T, N> {
    config: Config,
    credentials: Credentials,
    rng: Rng,
    anchor: Option<AnchorKey>,
    previous_anchor: Option<PublicKey>,
    local_peer: PeerInfo,
    circle: Option<Circle>,
    previous_circle: Option<Circle>,
    rings: BTreeMap<RingName, Ring>,
    retirees: BTreeMap<PeerId, Retiree>,
    departure: DepartureReason,
    expansion: BTreeMap<String, ByteBuf>,
    recovery: Option<RecoveryHandle>,
    synced: BTreeMap<PeerId, ViewSet>,
    progress: watch::Sender<SyncProgress>,
    ring_refresh_needed: bool,
    transport: T,
    notifier: N,
}

impl<T, N> Account<T, N>
where
    T: Transport,
    N: Notifier,
{
    /// Enrolls a new device which is not part of any circle yet.
    pub fn new(
        config: Config,
        credentials: Credentials,
        gestalt: DeviceGestalt,
        rng: Rng,
        transport: T,
        notifier: N,
    ) -> Result<Self, AccountError> {
        let local_peer = PeerInfo::new(
            credentials.private_key(),
            gestalt,
            config.default_views().clone(),
            config.known_views().clone(),
        )?;
        debug!(peer_id = %local_peer.peer_id(), "enrolled local device");

        Ok(Self::from_parts(
            config,
            credentials,
            rng,
            local_peer,
            transport,
            notifier,
        ))
    }

    fn from_parts(
        config: Config,
        credentials: Credentials,
        rng: Rng,
        local_peer: PeerInfo,
        transport: T,
        notifier: N,
    ) -> Self {
        let (progress, _) = watch::channel(SyncProgress::default());
        let account = Self {
            config,
            credentials,
            rng,
            anchor: None,
            previous_anchor: None,
            local_peer,
            circle: None,
            previous_circle: None,
            rings: BTreeMap::new(),
            retirees: BTreeMap::new(),
            departure: DepartureReason::default(),
            expansion: BTreeMap::new(),
            recovery: None,
            synced: BTreeMap::new(),
            progress,
            ring_refresh_needed: false,
            transport,
            notifier,
        };
        account.update_progress();
        account
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Id of the local device.
    pub fn peer_id(&self) -> &PeerId {
        self.local_peer.peer_id()
    }

    /// Current record of the local device.
    pub fn local_peer(&self) -> &PeerInfo {
        &self.local_peer
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    pub fn status(&self) -> CircleStatus {
        match &self.circle {
            None => CircleStatus::NoGroup,
            Some(circle) if circle.is_member(self.peer_id()) => CircleStatus::InCircle,
            Some(circle) if circle.is_applicant(self.peer_id()) => CircleStatus::Applicant,
            Some(_) => CircleStatus::NotInCircle,
        }
    }

    /// Copy of the accepted circle.
    pub fn circle(&self) -> Option<Circle> {
        self.circle.clone()
    }

    /// Copy of the circle which was accepted before the current one.
    pub fn previous_circle(&self) -> Option<Circle> {
        self.previous_circle.clone()
    }

    /// Copy of an accepted ring.
    pub fn ring(&self, name: &RingName) -> Option<Ring> {
        self.rings.get(name).cloned()
    }

    /// Records of all active members.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.circle
            .iter()
            .flat_map(|circle| circle.members().values())
            .filter(|info| !self.is_retired(info.peer_id()))
            .cloned()
            .collect()
    }

    /// Records of all pending applicants.
    pub fn applicants(&self) -> Vec<PeerInfo> {
        self.circle
            .iter()
            .flat_map(|circle| circle.applicants().values())
            .cloned()
            .collect()
    }

    /// Other active members syncing the given view.
    pub fn syncing_peers(&self, view: &ViewName) -> BTreeSet<PeerId> {
        self.peers()
            .into_iter()
            .filter(|info| info.peer_id() != self.peer_id() && info.has_view(view))
            .map(|info| info.peer_id().clone())
            .collect()
    }

    /// Peers holding a slice of the given view's backup secret.
    pub fn backup_peers(&self, view: &ViewName) -> BTreeSet<PeerId> {
        self.rings
            .get(&RingName::backup(view))
            .map(|ring| ring.member_ids().clone())
            .unwrap_or_default()
    }

    pub fn departure_reason(&self) -> DepartureReason {
        self.departure
    }

    /// Retirement tickets received so far.
    pub fn retirees(&self) -> Vec<PeerInfo> {
        self.retirees
            .values()
            .map(|retiree| retiree.ticket().clone())
            .collect()
    }

    pub fn recovery(&self) -> Option<&RecoveryHandle> {
        self.recovery.as_ref()
    }

    pub fn expansion(&self, key: &str) -> Option<&[u8]> {
        self.expansion.get(key).map(|value| value.as_slice())
    }

    /// Stores a value which is persisted together with the account.
    pub fn set_expansion(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.expansion.insert(key.into(), ByteBuf::from(value));
    }

    /// Installs or rotates the anchor key.
    ///
    /// The public half of a replaced anchor is kept, so states signed by it can be told apart
    /// from forged ones. If the new anchor can sign and the local device is a member, the circle
    /// is re-signed and published.
    pub async fn set_anchor(&mut self, anchor: AnchorKey) -> Result<(), AccountError> {
        let rotated = match &self.anchor {
            Some(current) if current.public_key() != anchor.public_key() => {
                self.previous_anchor = Some(*current.public_key());
                true
            }
            _ => false,
        };
        self.anchor = Some(anchor);

        if !rotated {
            return Ok(());
        }
        info!(peer_id = %self.peer_id(), "rotated anchor key");

        if self.status() == CircleStatus::InCircle && self.anchor_private_key().is_ok() {
            self.resign_circle().await?;
            self.resign_rings().await?;
        }
        Ok(())
    }

    pub fn anchor(&self) -> Option<&AnchorKey> {
        self.anchor.as_ref()
    }

    /// Records that a peer finished syncing the given views.
    pub fn peer_synced(&mut self, peer_id: PeerId, views: ViewSet) {
        self.synced.entry(peer_id).or_default().extend(views);
        self.update_progress();
    }

    /// Returns a waiter which resolves once enough other members synced all of `views`.
    pub fn wait_for_views(&self, views: ViewSet) -> SyncWaiter {
        SyncWaiter::new(views, self.progress.subscribe())
    }

    /// Decodes and handles a container received from the transport.
    ///
    /// Failures are logged and dropped, they never affect the accepted state.
    pub async fn deliver(&mut self, name: &str, bytes: &[u8]) {
        if let Err(err) = self.process(name, bytes).await {
            warn!(%name, %err, "dropped delivered container");
        }
    }

    /// Decodes and handles a container received from the transport, returning failures.
    ///
    /// Returns true if the accepted state changed.
    pub async fn process(&mut self, name: &str, bytes: &[u8]) -> Result<bool, AccountError> {
        let envelope = Envelope::from_bytes(bytes)
            .map_err(|err| AccountError::MalformedContainer(err.to_string()))?;

        if envelope.name() != name {
            return Err(AccountError::MalformedContainer(format!(
                "container {} delivered under name {name}",
                envelope.name()
            )));
        }

        match envelope {
            Envelope::Circle(circle) => self.handle_update(circle, false).await,
            Envelope::Ring(ring) => self.handle_ring_update(ring, false).await,
            Envelope::Retirement(ticket) => self.handle_retirement(ticket).await,
        }
    }

    /// Periodic maintenance.
    ///
    /// Finalizes retirements past the finalization delay, strips retired peers from the circle,
    /// removes duplicate enrollments of the local device and regenerates rings which need
    /// fixing.
    pub async fn refresh(&mut self) -> Result<(), AccountError> {
        self.finalize_retirements();
        self.purge_retirees().await?;

        if let Err(err) = self.bust_ghosts().await {
            warn!(%err, "ghost cleanup failed");
        }

        self.ring_refresh_needed = true;
        self.refresh_rings_if_needed().await
    }

    fn anchor_public_key(&self) -> Option<PublicKey> {
        self.anchor.as_ref().map(|anchor| *anchor.public_key())
    }

    /// Private anchor key, needed by every operation which changes the circle or a ring.
    fn anchor_private_key(&self) -> Result<PrivateKey, AccountError> {
        self.anchor
            .as_ref()
            .and_then(AnchorKey::private_key)
            .cloned()
            .ok_or(AccountError::NoTrustAnchor)
    }

    fn is_retired(&self, peer_id: &PeerId) -> bool {
        self.retirees.contains_key(peer_id)
    }

    fn retired_ids(&self) -> BTreeSet<PeerId> {
        self.retirees.keys().cloned().collect()
    }

    /// Returns true if the local device is an active member of the accepted circle.
    fn is_active_member(&self) -> bool {
        !self.local_peer.is_retired() && self.status() == CircleStatus::InCircle
    }

    async fn publish(&self, envelope: Envelope) -> Result<(), AccountError> {
        let name = envelope.name();
        let bytes = envelope.to_bytes()?;
        if let Err(err) = self.transport.publish(&name, bytes).await {
            warn!(%name, %err, "failed publishing container");
            return Err(err.into());
        }
        debug!(%name, "published container");
        Ok(())
    }

    /// Replaces the accepted circle, notifies dependent subsystems and schedules ring
    /// maintenance.
    fn apply_circle(&mut self, circle: Circle) {
        let old = self.circle.replace(circle);
        let change = MembershipChange::between(old.as_ref(), self.circle.as_ref());

        let members_changed = match (&old, &self.circle) {
            (Some(old), Some(new)) => old.members() != new.members(),
            _ => true,
        };

        self.update_departure(old.as_ref());

        // Merged countersignatures don't make a new generation.
        let generation_changed = match (&old, &self.circle) {
            (Some(old), Some(new)) => old.generation() != new.generation(),
            _ => true,
        };
        if old.is_some() && generation_changed {
            self.previous_circle = old;
        }

        if !change.is_empty() {
            info!(
                added = change.added.len(),
                removed = change.removed.len(),
                added_applicants = change.added_applicants.len(),
                removed_applicants = change.removed_applicants.len(),
                "circle membership changed"
            );
            self.notifier.on_membership_changed(&change);
        }

        if members_changed {
            self.ring_refresh_needed = true;
        }

        self.update_progress();
    }

    fn update_departure(&mut self, old: Option<&Circle>) {
        let Some(new) = &self.circle else {
            return;
        };
        let me = self.local_peer.peer_id();
        let was_in = old.is_some_and(|old| old.is_member(me) || old.is_applicant(me));

        if new.is_member(me) {
            self.departure = DepartureReason::InCircle;
        } else if new.is_rejected(me) && !old.is_some_and(|old| old.is_rejected(me)) {
            self.departure = DepartureReason::Rejected;
        } else if new.is_empty() && was_in {
            self.departure = DepartureReason::CircleReset;
        }
    }

    fn update_progress(&self) {
        let me = self.local_peer.peer_id();
        let peers = self
            .peers()
            .into_iter()
            .map(|info| info.peer_id().clone())
            .filter(|peer_id| peer_id != me)
            .collect();

        self.progress.send_replace(SyncProgress {
            peers,
            synced: self.synced.clone(),
            enabled_views: self.local_peer.enabled_views().clone(),
            quorum: self.config.sync_quorum(),
            departed: self.departure.has_departed(),
        });
    }
}
