// SPDX-License-Identifier: MIT OR Apache-2.0

//! Retirement tickets and cleanup of peers which should not be in the circle anymore.
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::circle::Circle;
use crate::concordance::Concordant;
use crate::error::AccountError;
use crate::event::Notifier;
use crate::identity::PeerId;
use crate::peer::PeerInfo;
use crate::timestamp::Timestamp;
use crate::transport::Transport;

use super::{Account, DepartureReason};

/// Entry of the retirement log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retiree {
    ticket: PeerInfo,
    received_at: Timestamp,
    finalized: bool,
}

impl Retiree {
    pub(super) fn new(ticket: PeerInfo, received_at: Timestamp) -> Self {
        Self {
            ticket,
            received_at,
            finalized: false,
        }
    }

    /// Signed retirement ticket of the peer.
    pub fn ticket(&self) -> &PeerInfo {
        &self.ticket
    }

    /// Local time the ticket was first seen.
    pub fn received_at(&self) -> Timestamp {
        self.received_at
    }

    /// Returns true once the finalization delay passed.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}

impl<T, N> Account<T, N>
where
    T: Transport,
    N: Notifier,
{
    /// Records a retirement ticket and removes the retired peer from the circle.
    ///
    /// Returns false if the ticket was seen before.
    pub async fn handle_retirement(&mut self, ticket: PeerInfo) -> Result<bool, AccountError> {
        ticket
            .verify()
            .map_err(|_| AccountError::SignatureInvalid)?;
        if !ticket.is_retired() {
            return Err(AccountError::MalformedContainer(
                "retirement ticket of an active peer".to_string(),
            ));
        }

        let peer_id = ticket.peer_id().clone();
        if self.retirees.contains_key(&peer_id) {
            debug!(%peer_id, "retirement already known");
            return Ok(false);
        }

        if !self.has_seen(&peer_id) && !self.is_admissible(&ticket) {
            debug!(%peer_id, "ignoring retirement of an unknown peer");
            return Ok(false);
        }

        if peer_id == *self.peer_id() && !self.local_peer.is_retired() {
            warn!("found retirement ticket of the local device");
            self.local_peer = ticket.clone();
            self.departure = DepartureReason::DiscoveredRetirement;
        }

        info!(%peer_id, retired_at = ?ticket.retired_at(), "peer retired");
        self.retirees
            .insert(peer_id.clone(), Retiree::new(ticket, Timestamp::now()));
        self.update_progress();

        self.remove_retired(&[peer_id]).await?;
        self.ring_refresh_needed = true;
        self.refresh_rings_if_needed().await?;
        Ok(true)
    }

    /// Returns true if the peer is the local device or listed in the current or previous circle
    /// or in any ring.
    fn has_seen(&self, peer_id: &PeerId) -> bool {
        peer_id == self.peer_id()
            || self
                .circle
                .iter()
                .chain(self.previous_circle.iter())
                .any(|circle| circle.contains(peer_id))
            || self
                .rings
                .values()
                .any(|ring| ring.member_ids().contains(peer_id))
    }

    /// Returns true if the record carries an application signature of the current or previous
    /// anchor.
    fn is_admissible(&self, record: &PeerInfo) -> bool {
        self.anchor_public_key()
            .iter()
            .chain(self.previous_anchor.iter())
            .any(|anchor| record.verify_application(anchor).is_ok())
    }

    /// Marks retirements older than the finalization delay as final.
    pub(super) fn finalize_retirements(&mut self) {
        let delay = self.config.retirement_finalization_delay();
        let now = Timestamp::now();
        for (peer_id, retiree) in self.retirees.iter_mut() {
            if !retiree.finalized && retiree.received_at.has_elapsed(delay, now) {
                debug!(%peer_id, "finalized retirement");
                retiree.finalized = true;
            }
        }
    }

    /// Strips every retired peer which is still listed in the circle.
    pub(super) async fn purge_retirees(&mut self) -> Result<(), AccountError> {
        let Some(circle) = &self.circle else {
            return Ok(());
        };
        let listed: Vec<PeerId> = self
            .retirees
            .keys()
            .filter(|peer_id| circle.is_member(peer_id) || circle.is_applicant(peer_id))
            .cloned()
            .collect();
        if listed.is_empty() {
            return Ok(());
        }
        self.remove_retired(&listed).await
    }

    /// Removes peers from the circle, if the local device is allowed to sign that change.
    async fn remove_retired(&mut self, peer_ids: &[PeerId]) -> Result<(), AccountError> {
        if !self.is_active_member() {
            return Ok(());
        }
        let Ok(anchor) = self.anchor_private_key() else {
            debug!("can't remove retired peers without anchor key");
            return Ok(());
        };
        let Some(mut circle) = self.circle.clone() else {
            return Ok(());
        };

        let removed = peer_ids
            .iter()
            .filter(|peer_id| circle.remove_peer(peer_id).is_some())
            .count();
        if removed == 0 {
            return Ok(());
        }

        let me = self.peer_id().clone();
        circle.generation_sign(Some(&anchor), &me, self.credentials.private_key())?;
        info!(removed, generation = %circle.generation(), "removed retired peers");
        self.commit_circle(circle).await
    }

    /// Other enrollments of the local device which are listed in the circle.
    fn ghosts(&self, circle: &Circle) -> Vec<PeerId> {
        circle
            .members()
            .values()
            .chain(circle.applicants().values())
            .filter(|info| info.is_ghost_of(&self.local_peer))
            .map(|info| info.peer_id().clone())
            .collect()
    }

    /// Removes stale enrollments of the local device, for example after it was restored.
    pub(super) async fn bust_ghosts(&mut self) -> Result<(), AccountError> {
        if !self.config.ghost_busting() || self.anchor_private_key().is_err() {
            return Ok(());
        }
        if self.local_peer.is_retired() {
            return Ok(());
        }
        let Some(circle) = &self.circle else {
            return Ok(());
        };

        let ghosts = self.ghosts(circle);
        if ghosts.is_empty() {
            return Ok(());
        }

        let only_ghost_left =
            circle.members().len() == 1 && circle.members().keys().all(|id| ghosts.contains(id));
        if only_ghost_left {
            info!("only a former enrollment of this device is left, taking over the circle");
            return self.reset_to_offering().await;
        }

        if self.is_active_member() {
            info!(ghosts = ghosts.len(), "removing former enrollments of this device");
            self.remove_peers(&ghosts).await?;
        }
        Ok(())
    }
}
