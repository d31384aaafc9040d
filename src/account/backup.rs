// SPDX-License-Identifier: MIT OR Apache-2.0

//! Distribution of per-view backup secrets and the recovery key.
use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::crypto::x25519;
use crate::error::AccountError;
use crate::event::Notifier;
use crate::identity::PeerId;
use crate::keybag::{BackupSecret, BackupSliceKeyBag, RecoveryKeyBag};
use crate::ring::{Ring, RingName, RingPayload, RingType};
use crate::timestamp::Timestamp;
use crate::transport::Transport;
use crate::view::ViewName;

use super::Account;

impl<T, N> Account<T, N>
where
    T: Transport,
    N: Notifier,
{
    /// Backup keys of all active members which should hold a slice of the view's backup secret.
    pub(super) fn eligible_backup_peers(
        &self,
        view: &ViewName,
    ) -> BTreeMap<PeerId, x25519::PublicKey> {
        self.peers()
            .iter()
            .filter_map(|info| {
                info.backup_key_for(view)
                    .map(|public_key| (info.peer_id().clone(), *public_key))
            })
            .collect()
    }

    pub(super) fn recovery_key(&self) -> Option<x25519::PublicKey> {
        self.recovery.map(|handle| *handle.public_key())
    }

    /// Backup secret of a view, unwrapped with the local device's backup key.
    pub fn backup_secret(&self, view: &ViewName) -> Result<BackupSecret, AccountError> {
        let bag = self
            .rings
            .get(&RingName::backup(view))
            .and_then(Ring::key_bag)
            .ok_or_else(|| AccountError::NotAMember(self.peer_id().clone()))?;
        Ok(bag.open(self.peer_id(), self.credentials.backup_secret())?)
    }

    pub(super) async fn regenerate_backup_rings(&mut self) -> Result<(), AccountError> {
        let views: Vec<ViewName> = self.config.backup_views().iter().cloned().collect();
        for view in views {
            self.regenerate_backup_ring(&view).await?;
        }
        Ok(())
    }

    /// Re-wraps the view's backup secret if the backup ring doesn't match the eligible peers.
    ///
    /// The secret is kept as long as nobody holding a slice lost eligibility, otherwise a fresh
    /// secret is generated.
    async fn regenerate_backup_ring(&mut self, view: &ViewName) -> Result<(), AccountError> {
        let name = RingName::backup(view);
        let eligible = self.eligible_backup_peers(view);
        let recovery_key = self.recovery_key();
        let current = self.named_ring(&name);

        match current {
            Some(ring) if !ring.needs_fix(&eligible, recovery_key.as_ref()) => return Ok(()),
            None if eligible.is_empty() => return Ok(()),
            _ => (),
        }

        let kept_secret = current
            .and_then(Ring::key_bag)
            .filter(|bag| bag.can_keep_secret(&eligible, recovery_key.as_ref()))
            .and_then(|bag| {
                bag.open(self.peer_id(), self.credentials.backup_secret())
                    .ok()
            });
        let secret = match kept_secret {
            Some(secret) => secret,
            None => {
                info!(%view, "rotating backup secret");
                BackupSecret::from_rng(&self.rng)?
            }
        };

        let bag = BackupSliceKeyBag::create(
            view.clone(),
            &secret,
            &eligible,
            recovery_key.as_ref(),
        )?;
        let member_ids = eligible.keys().cloned().collect();
        let payload = RingPayload::BackupKeyBag(bag);
        let ring = match current {
            Some(ring) => ring.with_contents(member_ids, payload)?,
            None => Ring::new(name, RingType::Backup, member_ids, payload)?,
        };

        debug!(%view, peers = eligible.len(), "regenerated backup ring");
        self.sign_and_commit_ring(ring).await
    }

    /// Installs a new recovery key (or removes it) and re-wraps all backup secrets for it.
    pub async fn set_recovery_key(
        &mut self,
        recovery_key: Option<x25519::PublicKey>,
    ) -> Result<(), AccountError> {
        self.anchor_private_key()?;
        if !self.is_active_member() {
            return Err(AccountError::NotAMember(self.peer_id().clone()));
        }

        let member_ids = self.active_member_ids();
        let payload = RingPayload::RecoveryKeyBag(RecoveryKeyBag::new(recovery_key, Timestamp::now()));
        let ring = match self.named_ring(&RingName::recovery()) {
            Some(ring) => ring.with_contents(member_ids, payload)?,
            None => Ring::new(RingName::recovery(), RingType::Recovery, member_ids, payload)?,
        };

        self.sign_and_commit_ring(ring).await?;
        self.ring_refresh_needed = true;
        self.refresh_rings_if_needed().await
    }
}
