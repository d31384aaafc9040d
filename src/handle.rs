// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared access to an [`Account`] from multiple tasks.
//!
//! Every call takes the same lock for its whole duration, so delivered containers, local
//! commands and maintenance are handled one after another and never observe a half-applied
//! state transition.
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::account::{Account, CircleStatus, DepartureReason};
use crate::circle::Circle;
use crate::crypto::x25519;
use crate::error::AccountError;
use crate::event::Notifier;
use crate::identity::{AnchorKey, PeerId};
use crate::keybag::BackupSecret;
use crate::peer::{DeviceGestalt, PeerInfo};
use crate::ring::{Ring, RingName};
use crate::sync::WaitError;
use crate::transport::Transport;
use crate::view::{ViewName, ViewSet};

/// Cloneable handle serialising access to one account.
#[derive(Debug)]
pub struct AccountHandle<T, N> {
    inner: Arc<Mutex<Account<T, N>>>,
}

impl<T, N> Clone for AccountHandle<T, N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, N> AccountHandle<T, N>
where
    T: Transport,
    N: Notifier,
{
    pub fn new(account: Account<T, N>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(account)),
        }
    }

    /// Runs a read-only closure against the account.
    pub async fn with<R>(&self, f: impl FnOnce(&Account<T, N>) -> R) -> R {
        let account = self.inner.lock().await;
        f(&account)
    }

    pub async fn status(&self) -> CircleStatus {
        self.inner.lock().await.status()
    }

    pub async fn circle(&self) -> Option<Circle> {
        self.inner.lock().await.circle()
    }

    pub async fn ring(&self, name: &RingName) -> Option<Ring> {
        self.inner.lock().await.ring(name)
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.inner.lock().await.peers()
    }

    pub async fn applicants(&self) -> Vec<PeerInfo> {
        self.inner.lock().await.applicants()
    }

    pub async fn departure_reason(&self) -> DepartureReason {
        self.inner.lock().await.departure_reason()
    }

    pub async fn backup_secret(&self, view: &ViewName) -> Result<BackupSecret, AccountError> {
        self.inner.lock().await.backup_secret(view)
    }

    pub async fn serialize(&self) -> Result<Vec<u8>, AccountError> {
        self.inner.lock().await.serialize()
    }

    pub async fn set_anchor(&self, anchor: AnchorKey) -> Result<(), AccountError> {
        self.inner.lock().await.set_anchor(anchor).await
    }

    /// Handles a container received from the transport, see [`Account::deliver`].
    pub async fn deliver(&self, name: &str, bytes: &[u8]) {
        self.inner.lock().await.deliver(name, bytes).await
    }

    pub async fn process(&self, name: &str, bytes: &[u8]) -> Result<bool, AccountError> {
        self.inner.lock().await.process(name, bytes).await
    }

    pub async fn refresh(&self) -> Result<(), AccountError> {
        self.inner.lock().await.refresh().await
    }

    pub async fn reset_to_offering(&self) -> Result<(), AccountError> {
        self.inner.lock().await.reset_to_offering().await
    }

    pub async fn reset_to_empty(&self) -> Result<(), AccountError> {
        self.inner.lock().await.reset_to_empty().await
    }

    pub async fn request_to_join(&self) -> Result<(), AccountError> {
        self.inner.lock().await.request_to_join().await
    }

    pub async fn withdraw_application(&self) -> Result<(), AccountError> {
        self.inner.lock().await.withdraw_application().await
    }

    pub async fn accept_applicant(&self, peer_id: &PeerId) -> Result<(), AccountError> {
        self.inner.lock().await.accept_applicant(peer_id).await
    }

    pub async fn reject_applicant(&self, peer_id: &PeerId) -> Result<(), AccountError> {
        self.inner.lock().await.reject_applicant(peer_id).await
    }

    pub async fn remove_peers(&self, peer_ids: &[PeerId]) -> Result<bool, AccountError> {
        self.inner.lock().await.remove_peers(peer_ids).await
    }

    pub async fn leave_circle(&self) -> Result<(), AccountError> {
        self.inner.lock().await.leave_circle().await
    }

    pub async fn update_views(
        &self,
        enable: &ViewSet,
        disable: &ViewSet,
    ) -> Result<(), AccountError> {
        self.inner.lock().await.update_views(enable, disable).await
    }

    pub async fn set_backup_public_key(
        &self,
        key: Option<x25519::PublicKey>,
    ) -> Result<(), AccountError> {
        self.inner.lock().await.set_backup_public_key(key).await
    }

    pub async fn set_gestalt(&self, gestalt: DeviceGestalt) -> Result<(), AccountError> {
        self.inner.lock().await.set_gestalt(gestalt).await
    }

    pub async fn set_recovery_key(
        &self,
        key: Option<x25519::PublicKey>,
    ) -> Result<(), AccountError> {
        self.inner.lock().await.set_recovery_key(key).await
    }

    pub async fn peer_synced(&self, peer_id: PeerId, views: ViewSet) {
        self.inner.lock().await.peer_synced(peer_id, views)
    }

    /// Waits until enough other members synced all of `views`.
    ///
    /// The lock is only held while subscribing, so the account keeps handling events while
    /// this is pending.
    pub async fn wait_for_views(&self, views: ViewSet) -> Result<(), WaitError> {
        let waiter = self.inner.lock().await.wait_for_views(views);
        waiter.wait().await
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::test_utils::{MemoryTransport, Network, RecordingNotifier};
    use crate::view::view_set;

    use super::AccountHandle;

    #[tokio::test]
    async fn handles_share_one_account() {
        let mut network = Network::new(Config::new(view_set(["notes"])), [42; 32]);
        network.add_device("alice", None).await;
        let account = network.devices.pop().unwrap();
        let transport: MemoryTransport = account.transport().clone();
        let peer_id = account.peer_id().clone();

        let handle: AccountHandle<MemoryTransport, RecordingNotifier> = AccountHandle::new(account);
        let other = handle.clone();
        other.reset_to_offering().await.unwrap();

        let circle = handle.circle().await.unwrap();
        assert!(circle.is_member(&peer_id));
        assert_eq!(handle.peers().await.len(), 1);
        assert_eq!(
            transport.published_names().first().map(String::as_str),
            Some("circle")
        );

        // Nobody else is in the circle, so there is nothing to wait for.
        assert!(handle.wait_for_views(view_set(["notes"])).await.is_ok());

        let bytes = handle.serialize().await.unwrap();
        assert!(!bytes.is_empty());
        assert_eq!(handle.with(|account| account.peer_id().clone()).await, peer_id);
    }
}
