// SPDX-License-Identifier: MIT OR Apache-2.0

//! Circle lifecycle: handling proposals and local membership commands.
use std::collections::BTreeMap;

use tracing::{debug, info, trace, warn};

use crate::action::Action;
use crate::circle::{Circle, CircleError};
use crate::concordance::{Concordant, Trust, Verdict, evaluate, is_locally_trusted, is_vouched};
use crate::crypto::x25519;
use crate::error::AccountError;
use crate::event::Notifier;
use crate::identity::PeerId;
use crate::peer::{DeviceGestalt, PeerInfo};
use crate::timestamp::Timestamp;
use crate::transport::{Envelope, Transport};
use crate::view::ViewSet;

use super::{Account, CircleStatus, DepartureReason, Retiree};

/// Error kind reported for a proposal which was not adopted.
pub(super) fn rejection_error(verdict: Verdict) -> Option<AccountError> {
    match verdict {
        Verdict::GenerationOld => Some(AccountError::StaleProposal),
        Verdict::BadUserSignature | Verdict::BadPeerSignature | Verdict::NoUserSignature => {
            Some(AccountError::SignatureInvalid)
        }
        Verdict::InvalidMembership => Some(AccountError::MalformedContainer(
            "membership violates structural invariants".to_string(),
        )),
        Verdict::NoUserKey => Some(AccountError::NoTrustAnchor),
        Verdict::Trusted
        | Verdict::NoPeerSignature
        | Verdict::NoPeerLeft
        | Verdict::MissingMe
        | Verdict::NotWorthy => None,
    }
}

impl<T, N> Account<T, N>
where
    T: Transport,
    N: Notifier,
{
    /// Evaluates a proposed circle against the accepted one and applies the resulting action.
    ///
    /// Locally originated proposals are published whenever they are adopted. Returns true if the
    /// accepted circle changed.
    pub async fn handle_update(
        &mut self,
        proposal: Circle,
        locally_originated: bool,
    ) -> Result<bool, AccountError> {
        if proposal.name() != self.config.circle_name() {
            return Err(AccountError::MalformedContainer(format!(
                "unexpected circle name {}",
                proposal.name()
            )));
        }

        if self.circle.as_ref() == Some(&proposal) {
            trace!(generation = %proposal.generation(), "circle already accepted");
            return Ok(false);
        }

        let me = self.peer_id().clone();
        let anchor = self.anchor_public_key();
        let retired = self.retired_ids();
        let trusted = self
            .circle
            .as_ref()
            .map(|circle| {
                circle
                    .member_keys()
                    .into_iter()
                    .filter(|(peer_id, _)| !retired.contains(peer_id))
                    .collect()
            })
            .unwrap_or_default();
        let directory = BTreeMap::new();

        let (verdict, locally_trusted, vouched) = {
            let trust = Trust {
                local_peer: &me,
                local_record: Some(&self.local_peer),
                anchor: anchor.as_ref(),
                previous_anchor: self.previous_anchor.as_ref(),
                trusted: &trusted,
                directory: &directory,
                retired: &retired,
            };
            let old = self.circle.as_ref();
            (
                evaluate(old, &proposal, &trust),
                is_locally_trusted(old, &trust),
                is_vouched(&proposal, &trust),
            )
        };
        let action = Action::for_verdict(verdict, locally_trusted, vouched);

        debug!(
            generation = %proposal.generation(),
            ?verdict,
            ?action,
            locally_originated,
            "evaluated circle proposal"
        );

        match action {
            Action::Accept => {
                self.apply_circle(proposal.clone());
                if locally_originated {
                    self.publish(Envelope::Circle(proposal)).await?;
                }
                self.refresh_rings_if_needed().await?;
                Ok(true)
            }
            Action::Countersign => self.countersign_circle(proposal, locally_originated).await,
            Action::Leave => self.leave_untrusted_circle(proposal).await,
            Action::Revert => {
                self.revert_circle().await?;
                Err(rejection_error(verdict).unwrap_or(AccountError::StaleProposal))
            }
            Action::Modify => self.modify_circle(proposal, verdict).await,
            Action::Ignore => {
                warn!(?verdict, generation = %proposal.generation(), "ignored circle proposal");
                match rejection_error(verdict) {
                    Some(err) => Err(err),
                    None => Ok(false),
                }
            }
        }
    }

    async fn countersign_circle(
        &mut self,
        mut proposal: Circle,
        locally_originated: bool,
    ) -> Result<bool, AccountError> {
        let me = self.peer_id().clone();
        let anchor = self.anchor_public_key();

        // Copies of the same generation can carry different subsets of signatures.
        if let Some(current) = &self.circle {
            proposal.merge_signatures(current, anchor.as_ref())?;
        }

        if self.circle.as_ref() == Some(&proposal) {
            trace!("proposal carried no new signatures");
            return Ok(false);
        }

        let needs_signature = proposal.is_member(&me) && !proposal.signatures().has_member(&me);
        if needs_signature {
            proposal.concordance_sign(&me, self.credentials.private_key())?;
            debug!(generation = %proposal.generation(), "countersigned circle");
        }

        self.apply_circle(proposal.clone());
        if needs_signature || locally_originated {
            self.publish(Envelope::Circle(proposal)).await?;
        }
        self.refresh_rings_if_needed().await?;
        Ok(true)
    }

    /// Publishes the accepted circle again.
    async fn revert_circle(&mut self) -> Result<(), AccountError> {
        let Some(current) = self.circle.clone() else {
            return Ok(());
        };
        info!(generation = %current.generation(), "reverting to accepted circle");
        self.publish(Envelope::Circle(current)).await
    }

    /// Leaves a circle in which none of the trusted members is left.
    async fn leave_untrusted_circle(&mut self, mut proposal: Circle) -> Result<bool, AccountError> {
        let me = self.peer_id().clone();
        let was_member = self.is_active_member();
        info!(generation = %proposal.generation(), was_member, "leaving untrusted circle");

        let listed = proposal.is_applicant(&me) || proposal.is_member(&me);
        let retiring = proposal.is_member(&me) && !self.local_peer.is_retired();

        match self.anchor_private_key() {
            Ok(anchor) if listed => {
                proposal.remove_peer(&me);
                if retiring {
                    self.retire_local_peer()?;
                }
                proposal.generation_sign(Some(&anchor), &me, self.credentials.private_key())?;
                self.apply_circle(proposal.clone());
                self.publish(Envelope::Circle(proposal)).await?;
                if retiring {
                    self.publish(Envelope::Retirement(self.local_peer.clone()))
                        .await?;
                }
            }
            Ok(_) => self.apply_circle(proposal),
            Err(_) => {
                if listed {
                    warn!("can't sign removal from untrusted circle without anchor key");
                }
                self.apply_circle(proposal);
            }
        }

        self.departure = DepartureReason::LeftUntrustedCircle;
        self.update_progress();

        if was_member {
            return Err(AccountError::QuorumLost);
        }
        Ok(true)
    }

    /// Repairs the local device's own standing in a trusted proposal.
    async fn modify_circle(
        &mut self,
        mut proposal: Circle,
        verdict: Verdict,
    ) -> Result<bool, AccountError> {
        let me = self.peer_id().clone();

        let Ok(anchor) = self.anchor_private_key() else {
            warn!(?verdict, "can't repair own record without anchor key, accepting as is");
            self.apply_circle(proposal);
            self.refresh_rings_if_needed().await?;
            return Ok(true);
        };

        match verdict {
            Verdict::MissingMe => {
                info!("removed from circle, applying again");
                self.departure = DepartureReason::MembershipRevoked;
                let applicant = self.signed_application(&anchor)?;
                proposal.request_admission(&anchor.public_key(), applicant)?;
            }
            _ => {
                debug!("proposal carries outdated own record, replacing it");
                proposal.update_peer(self.local_peer.clone())?;
            }
        }

        proposal.generation_sign(Some(&anchor), &me, self.credentials.private_key())?;
        self.commit_circle(proposal).await?;
        Ok(true)
    }

    /// Adopts a locally created circle and publishes it.
    pub(super) async fn commit_circle(&mut self, circle: Circle) -> Result<(), AccountError> {
        self.apply_circle(circle.clone());
        self.publish(Envelope::Circle(circle)).await?;
        self.refresh_rings_if_needed().await
    }

    /// Local record with an application signature of the anchor.
    fn signed_application(
        &mut self,
        anchor: &crate::identity::PrivateKey,
    ) -> Result<PeerInfo, AccountError> {
        if self.local_peer.is_retired() {
            return Err(AccountError::Retired(self.peer_id().clone()));
        }
        if !self.local_peer.has_application_signature()
            || self
                .local_peer
                .verify_application(&anchor.public_key())
                .is_err()
        {
            self.local_peer.sign_application(anchor)?;
        }
        Ok(self.local_peer.clone())
    }

    /// Starting point for a locally created circle.
    fn working_circle(&self) -> Circle {
        self.circle
            .clone()
            .unwrap_or_else(|| Circle::new(self.config.circle_name()))
    }

    /// Creates a new circle containing only the local device.
    pub async fn reset_to_offering(&mut self) -> Result<(), AccountError> {
        let anchor = self.anchor_private_key()?;
        let me = self.peer_id().clone();
        let application = self.signed_application(&anchor)?;

        let mut circle = self.working_circle();
        circle.reset_to_offering(application);
        circle.generation_sign(Some(&anchor), &me, self.credentials.private_key())?;
        info!(generation = %circle.generation(), "reset circle to offering");

        // Rings of the old circle are regenerated for the new membership.
        self.ring_refresh_needed = true;
        self.commit_circle(circle).await
    }

    /// Resets the circle to the empty state.
    pub async fn reset_to_empty(&mut self) -> Result<(), AccountError> {
        let anchor = self.anchor_private_key()?;
        let me = self.peer_id().clone();

        let mut circle = self.working_circle();
        circle.reset_to_empty();
        circle.generation_sign(Some(&anchor), &me, self.credentials.private_key())?;
        info!(generation = %circle.generation(), "reset circle to empty");

        self.commit_circle(circle).await?;
        self.departure = DepartureReason::CircleReset;
        self.update_progress();
        Ok(())
    }

    /// Applies to the accepted circle.
    pub async fn request_to_join(&mut self) -> Result<(), AccountError> {
        let anchor = self.anchor_private_key()?;
        let me = self.peer_id().clone();
        let mut circle = self.circle.clone().ok_or(AccountError::NoGroup)?;

        match self.status() {
            CircleStatus::InCircle | CircleStatus::Applicant => {
                debug!("already part of the circle");
                return Ok(());
            }
            CircleStatus::NotInCircle | CircleStatus::NoGroup => (),
        }

        let application = self.signed_application(&anchor)?;
        circle.clear_rejection(&me);
        circle.request_admission(&anchor.public_key(), application)?;
        circle.generation_sign(Some(&anchor), &me, self.credentials.private_key())?;
        info!(generation = %circle.generation(), "requested to join circle");

        self.commit_circle(circle).await
    }

    /// Withdraws the pending application of the local device.
    pub async fn withdraw_application(&mut self) -> Result<(), AccountError> {
        let anchor = self.anchor_private_key()?;
        let me = self.peer_id().clone();
        let mut circle = self.circle.clone().ok_or(AccountError::NoGroup)?;

        circle.withdraw(&me).map_err(|err| match err {
            CircleError::NotApplicant(peer_id) => AccountError::NotApplicant(peer_id),
            err => err.into(),
        })?;
        circle.generation_sign(Some(&anchor), &me, self.credentials.private_key())?;
        info!(generation = %circle.generation(), "withdrew application");

        self.commit_circle(circle).await?;
        self.departure = DepartureReason::Withdrew;
        self.update_progress();
        Ok(())
    }

    /// Accepted circle, if the local device is an active member of it.
    fn circle_as_member(&self) -> Result<Circle, AccountError> {
        let circle = self.circle.clone().ok_or(AccountError::NoGroup)?;
        if !self.is_active_member() {
            return Err(AccountError::NotAMember(self.peer_id().clone()));
        }
        Ok(circle)
    }

    /// Admits an applicant as a member.
    pub async fn accept_applicant(&mut self, peer_id: &PeerId) -> Result<(), AccountError> {
        let anchor = self.anchor_private_key()?;
        let mut circle = self.circle_as_member()?;
        let me = self.peer_id().clone();

        if self.is_retired(peer_id) {
            return Err(AccountError::Retired(peer_id.clone()));
        }

        circle.accept_applicant(peer_id).map_err(|err| match err {
            CircleError::NotApplicant(peer_id) => AccountError::NotApplicant(peer_id),
            err => err.into(),
        })?;
        circle.generation_sign(Some(&anchor), &me, self.credentials.private_key())?;
        info!(%peer_id, generation = %circle.generation(), "accepted applicant");

        self.commit_circle(circle).await
    }

    /// Rejects an applicant.
    pub async fn reject_applicant(&mut self, peer_id: &PeerId) -> Result<(), AccountError> {
        let anchor = self.anchor_private_key()?;
        let mut circle = self.circle_as_member()?;
        let me = self.peer_id().clone();

        circle.reject_applicant(peer_id).map_err(|err| match err {
            CircleError::NotApplicant(peer_id) => AccountError::NotApplicant(peer_id),
            err => err.into(),
        })?;
        circle.generation_sign(Some(&anchor), &me, self.credentials.private_key())?;
        info!(%peer_id, generation = %circle.generation(), "rejected applicant");

        self.commit_circle(circle).await
    }

    /// Removes other members or applicants from the circle.
    ///
    /// Returns false if none of the given peers was part of the circle.
    pub async fn remove_peers(&mut self, peer_ids: &[PeerId]) -> Result<bool, AccountError> {
        let anchor = self.anchor_private_key()?;
        let mut circle = self.circle_as_member()?;
        let me = self.peer_id().clone();

        let mut removed = 0;
        for peer_id in peer_ids.iter().filter(|peer_id| **peer_id != me) {
            if circle.remove_peer(peer_id).is_some() {
                removed += 1;
            }
        }
        if removed == 0 {
            return Ok(false);
        }

        circle.generation_sign(Some(&anchor), &me, self.credentials.private_key())?;
        info!(removed, generation = %circle.generation(), "removed peers from circle");

        self.commit_circle(circle).await?;
        Ok(true)
    }

    /// Turns the local record into a retirement ticket and records it.
    fn retire_local_peer(&mut self) -> Result<(), AccountError> {
        let now = Timestamp::now();
        let ticket = self.local_peer.retire(self.credentials.private_key(), now)?;
        self.local_peer = ticket.clone();
        self.retirees
            .insert(ticket.peer_id().clone(), Retiree::new(ticket, now));
        self.departure = DepartureReason::Retired;
        Ok(())
    }

    /// Retires the local device: it leaves the circle for good.
    ///
    /// A signed retirement ticket is published next to the circle without the local device.
    pub async fn leave_circle(&mut self) -> Result<(), AccountError> {
        let anchor = self.anchor_private_key()?;
        let me = self.peer_id().clone();
        let mut circle = self.circle.clone().ok_or(AccountError::NoGroup)?;

        if self.local_peer.is_retired() {
            return Err(AccountError::Retired(me));
        }

        self.retire_local_peer()?;
        info!("retiring local device");

        if circle.remove_peer(&me).is_some() {
            circle.generation_sign(Some(&anchor), &me, self.credentials.private_key())?;
            self.commit_circle(circle).await?;
        }
        self.update_progress();

        self.publish(Envelope::Retirement(self.local_peer.clone()))
            .await
    }

    /// Enables and disables views on the local device.
    pub async fn update_views(
        &mut self,
        enable: &ViewSet,
        disable: &ViewSet,
    ) -> Result<(), AccountError> {
        for view in enable.iter().filter(|view| !self.config.is_known_view(view)) {
            warn!(%view, "ignoring unknown view");
        }
        let info =
            self.local_peer
                .with_views(self.credentials.private_key(), enable, disable)?;
        self.update_local_peer(info).await
    }

    /// Announces (or withdraws) the local device's backup key.
    pub async fn set_backup_public_key(
        &mut self,
        backup_public_key: Option<x25519::PublicKey>,
    ) -> Result<(), AccountError> {
        let info = self
            .local_peer
            .with_backup_public_key(self.credentials.private_key(), backup_public_key)?;
        self.update_local_peer(info).await
    }

    pub async fn set_gestalt(&mut self, gestalt: DeviceGestalt) -> Result<(), AccountError> {
        let info = self
            .local_peer
            .with_gestalt(self.credentials.private_key(), gestalt)?;
        self.update_local_peer(info).await
    }

    /// Stores a new version of the local record and publishes it with the circle.
    async fn update_local_peer(&mut self, info: PeerInfo) -> Result<(), AccountError> {
        self.local_peer = info.clone();
        self.update_progress();

        let Some(mut circle) = self.circle.clone() else {
            return Ok(());
        };
        if !circle.contains(info.peer_id()) {
            return Ok(());
        }

        let anchor = self.anchor_private_key()?;
        let me = self.peer_id().clone();
        circle.update_peer(info)?;
        circle.generation_sign(Some(&anchor), &me, self.credentials.private_key())?;
        debug!(generation = %circle.generation(), "published updated own record");

        self.commit_circle(circle).await
    }

    /// Signs the accepted circle again, after the anchor key was rotated.
    pub(super) async fn resign_circle(&mut self) -> Result<(), AccountError> {
        let anchor = self.anchor_private_key()?;
        let me = self.peer_id().clone();
        let mut circle = self.circle.clone().ok_or(AccountError::NoGroup)?;
        circle.generation_sign(Some(&anchor), &me, self.credentials.private_key())?;
        self.commit_circle(circle).await
    }
}
