// SPDX-License-Identifier: MIT OR Apache-2.0

//! Accepting ring proposals and keeping derived rings in line with the circle.
use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, trace, warn};

use crate::action::Action;
use crate::concordance::{Concordant, Trust, evaluate, is_locally_trusted, is_vouched};
use crate::error::AccountError;
use crate::event::Notifier;
use crate::identity::PeerId;
use crate::ring::{Ring, RingError, RingName, RingPayload, RingType, ViewMembership};
use crate::transport::{Envelope, Transport};
use crate::view::{ViewName, view_set};

use super::circle::rejection_error;
use super::{Account, RecoveryHandle};

impl<T, N> Account<T, N>
where
    T: Transport,
    N: Notifier,
{
    /// Evaluates a proposed ring against the accepted ring of the same name.
    ///
    /// Rings are trusted through the circle: the keys of listed peers are looked up in the
    /// accepted circle and the trusted signers are the previous ring's peers which are still
    /// active members.
    pub async fn handle_ring_update(
        &mut self,
        proposal: Ring,
        locally_originated: bool,
    ) -> Result<bool, AccountError> {
        let name = proposal.name().clone();
        let old = self.named_ring(&name).cloned();

        if let Some(old) = &old {
            if old.ring_type() != proposal.ring_type() {
                return Err(
                    RingError::TypeChanged(old.ring_type(), proposal.ring_type()).into(),
                );
            }
            if *old == proposal {
                trace!(%name, "ring already accepted");
                return Ok(false);
            }
        }

        let circle = self.circle.as_ref().ok_or(AccountError::NoGroup)?;
        let me = self.peer_id().clone();
        let anchor = self.anchor_public_key();
        let retired = self.retired_ids();
        let directory = circle.member_keys();
        let trusted: BTreeMap<_, _> = old
            .iter()
            .flat_map(|old| old.member_ids().iter())
            .filter(|peer_id| !retired.contains(*peer_id))
            .filter_map(|peer_id| {
                directory
                    .get(peer_id)
                    .map(|public_key| (peer_id.clone(), *public_key))
            })
            .collect();

        let (verdict, locally_trusted, vouched) = {
            let trust = Trust {
                local_peer: &me,
                local_record: None,
                anchor: anchor.as_ref(),
                previous_anchor: self.previous_anchor.as_ref(),
                trusted: &trusted,
                directory: &directory,
                retired: &retired,
            };
            (
                evaluate(old.as_ref(), &proposal, &trust),
                is_locally_trusted(old.as_ref(), &trust),
                is_vouched(&proposal, &trust),
            )
        };
        let action = Action::for_verdict(verdict, locally_trusted, vouched);

        debug!(
            %name,
            generation = %proposal.generation(),
            ?verdict,
            ?action,
            "evaluated ring proposal"
        );

        match action {
            Action::Accept | Action::Modify => {
                self.adopt_ring(proposal.clone());
                if locally_originated {
                    self.publish(Envelope::Ring(proposal)).await?;
                }
            }
            Action::Countersign => {
                if !self.countersign_ring(proposal, &directory).await? {
                    return Ok(false);
                }
            }
            Action::Leave => {
                // Nobody trusted is left holding this ring, it gets rebuilt from the circle.
                info!(%name, "ring lost all trusted peers");
                self.adopt_ring(proposal);
                self.ring_refresh_needed = true;
            }
            Action::Revert => {
                if let Some(old) = old {
                    info!(%name, "reverting to accepted ring");
                    self.publish(Envelope::Ring(old)).await?;
                }
                return Err(rejection_error(verdict).unwrap_or(AccountError::StaleProposal));
            }
            Action::Ignore => {
                warn!(%name, ?verdict, "ignored ring proposal");
                return match rejection_error(verdict) {
                    Some(err) => Err(err),
                    None => Ok(false),
                };
            }
        }

        self.refresh_rings_if_needed().await?;
        Ok(true)
    }

    async fn countersign_ring(
        &mut self,
        mut proposal: Ring,
        directory: &BTreeMap<PeerId, crate::identity::PublicKey>,
    ) -> Result<bool, AccountError> {
        let me = self.peer_id().clone();
        let anchor = self.anchor_public_key();

        if let Some(current) = self.rings.get(proposal.name()) {
            proposal.merge_signatures(current, anchor.as_ref(), directory)?;
            if *current == proposal {
                return Ok(false);
            }
        }

        let needs_signature = self.is_active_member()
            && proposal.member_ids().contains(&me)
            && !proposal.signatures().has_member(&me);
        if needs_signature {
            proposal.concordance_sign(&me, self.credentials.private_key())?;
            debug!(name = %proposal.name(), "countersigned ring");
        }

        self.adopt_ring(proposal.clone());
        if needs_signature {
            self.publish(Envelope::Ring(proposal)).await?;
        }
        Ok(true)
    }

    /// Accepted ring under `name`, unless it has a type which doesn't belong there.
    pub(super) fn named_ring(&self, name: &RingName) -> Option<&Ring> {
        self.rings
            .get(name)
            .filter(|ring| name.allows(ring.ring_type()))
    }

    /// Replaces the accepted ring and notifies dependent subsystems.
    fn adopt_ring(&mut self, ring: Ring) {
        let name = ring.name().clone();

        match ring.payload() {
            RingPayload::RecoveryKeyBag(bag) => {
                let recovery = bag.recovery_key().copied().map(RecoveryHandle::new);
                if recovery != self.recovery {
                    info!(fingerprint = ?bag.fingerprint(), "recovery key changed");
                    self.recovery = recovery;
                    // Backup bags need a slice for the new recovery key.
                    self.ring_refresh_needed = true;
                }
            }
            RingPayload::BackupKeyBag(bag) => {
                let eligible = self.eligible_backup_peers(bag.view());
                if ring.needs_fix(&eligible, self.recovery_key().as_ref()) {
                    debug!(%name, "accepted backup ring needs to be fixed");
                    self.ring_refresh_needed = true;
                }
            }
            RingPayload::ViewMembership(_) => (),
        }

        self.notifier.on_ring_updated(&name, ring.payload());
        self.rings.insert(name, ring);
    }

    /// Adopts a locally created ring and publishes it.
    pub(super) async fn commit_ring(&mut self, ring: Ring) -> Result<(), AccountError> {
        debug!(name = %ring.name(), generation = %ring.generation(), "committing ring");
        self.adopt_ring(ring.clone());
        self.publish(Envelope::Ring(ring)).await
    }

    /// Regenerates rings if the circle or a ring changed since the last run.
    pub(super) async fn refresh_rings_if_needed(&mut self) -> Result<(), AccountError> {
        if !self.ring_refresh_needed {
            return Ok(());
        }
        self.ring_refresh_needed = false;

        // Only active members holding the anchor key maintain rings.
        if !self.is_active_member() || self.anchor_private_key().is_err() {
            trace!("not maintaining rings");
            return Ok(());
        }

        self.refresh_membership_rings().await?;
        self.refresh_recovery_ring().await?;
        self.regenerate_backup_rings().await?;

        // Rings committed above flag a refresh themselves.
        self.ring_refresh_needed = false;
        Ok(())
    }

    /// Active members which are expected in a ring listing everyone.
    pub(super) fn active_member_ids(&self) -> BTreeSet<PeerId> {
        self.peers()
            .into_iter()
            .map(|info| info.peer_id().clone())
            .collect()
    }

    /// Brings every view membership ring in line with the views enabled by members.
    async fn refresh_membership_rings(&mut self) -> Result<(), AccountError> {
        let views: Vec<ViewName> = self.config.membership_views().iter().cloned().collect();
        for view in views {
            let member_ids: BTreeSet<PeerId> = self
                .peers()
                .into_iter()
                .filter(|info| info.has_view(&view))
                .map(|info| info.peer_id().clone())
                .collect();
            let payload = RingPayload::ViewMembership(ViewMembership::new(view_set([
                view.clone(),
            ])));
            let name = RingName::membership(&view);

            let ring = match self.named_ring(&name) {
                Some(ring) if *ring.member_ids() == member_ids => continue,
                Some(ring) => ring.with_contents(member_ids, payload)?,
                None if member_ids.is_empty() => continue,
                None => Ring::new(name, RingType::Base, member_ids, payload)?,
            };
            self.sign_and_commit_ring(ring).await?;
        }
        Ok(())
    }

    /// Keeps the recovery ring listing all active members.
    async fn refresh_recovery_ring(&mut self) -> Result<(), AccountError> {
        let member_ids = self.active_member_ids();
        let ring = match self.named_ring(&RingName::recovery()) {
            Some(ring) if *ring.member_ids() != member_ids => {
                ring.with_contents(member_ids, ring.payload().clone())?
            }
            _ => return Ok(()),
        };
        self.sign_and_commit_ring(ring).await
    }

    pub(super) async fn sign_and_commit_ring(&mut self, mut ring: Ring) -> Result<(), AccountError> {
        let anchor = self.anchor_private_key()?;
        let me = self.peer_id().clone();
        ring.generation_sign(Some(&anchor), &me, self.credentials.private_key())?;
        self.commit_ring(ring).await
    }

    /// Signs all accepted rings again, after the anchor key was rotated.
    pub(super) async fn resign_rings(&mut self) -> Result<(), AccountError> {
        let rings: Vec<Ring> = self.rings.values().cloned().collect();
        for ring in rings {
            self.sign_and_commit_ring(ring).await?;
        }
        Ok(())
    }
}
