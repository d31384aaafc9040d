// SPDX-License-Identifier: MIT OR Apache-2.0

//! Waiting for other members to have synced a set of views.
//!
//! The sync engine reports which views a peer finished syncing, the account folds these reports
//! together with its membership into a [`SyncProgress`] snapshot and broadcasts it on a watch
//! channel. Waiters resolve as soon as a snapshot satisfies them.
use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tokio::sync::watch;

use crate::identity::PeerId;
use crate::view::ViewSet;

/// Point-in-time view of sync progress in the circle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncProgress {
    /// Active members besides the local device.
    pub(crate) peers: BTreeSet<PeerId>,

    /// Views each peer reported as synced.
    pub(crate) synced: BTreeMap<PeerId, ViewSet>,

    /// Views enabled on the local device.
    pub(crate) enabled_views: ViewSet,

    /// Number of peers which need to be in sync.
    pub(crate) quorum: usize,

    /// Local device is not in the circle anymore.
    pub(crate) departed: bool,
}

impl SyncProgress {
    /// Returns the outcome of waiting for `views`, or `None` if still undecided.
    ///
    /// Only views enabled on the local device are waited for. If there are fewer other members
    /// than the quorum, all of them need to be in sync.
    pub fn outcome(&self, views: &ViewSet) -> Option<Result<(), WaitError>> {
        if self.departed {
            return Some(Err(WaitError::Departed));
        }

        let target: ViewSet = views.intersection(&self.enabled_views).cloned().collect();
        if target.is_empty() {
            return Some(Err(WaitError::EmptyViewSet));
        }

        let required = self.quorum.min(self.peers.len());
        let in_sync = self
            .peers
            .iter()
            .filter(|peer_id| {
                self.synced
                    .get(*peer_id)
                    .is_some_and(|synced| target.is_subset(synced))
            })
            .count();

        if in_sync >= required {
            Some(Ok(()))
        } else {
            None
        }
    }
}

/// Future-like handle waiting for a set of views to be in sync.
///
/// Dropping it cancels the wait.
#[derive(Debug)]
pub struct SyncWaiter {
    views: ViewSet,
    receiver: watch::Receiver<SyncProgress>,
}

impl SyncWaiter {
    pub(crate) fn new(views: ViewSet, receiver: watch::Receiver<SyncProgress>) -> Self {
        Self { views, receiver }
    }

    /// Resolves once enough members are in sync, the local device departed or the target views
    /// got disabled.
    pub async fn wait(mut self) -> Result<(), WaitError> {
        let views = self.views;
        let mut outcome = None;
        self.receiver
            .wait_for(|progress| {
                outcome = progress.outcome(&views);
                outcome.is_some()
            })
            .await
            .map_err(|_| WaitError::Closed)?;
        outcome.unwrap_or(Err(WaitError::Closed))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("local device departed from the circle")]
    Departed,

    #[error("none of the awaited views is enabled")]
    EmptyViewSet,

    #[error("account was dropped")]
    Closed,
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use crate::crypto::Rng;
    use crate::identity::{PeerId, PrivateKey};
    use crate::view::view_set;

    use super::{SyncProgress, WaitError};

    #[test]
    fn outcomes() {
        let rng = Rng::from_seed([1; 32]);
        let bob = PeerId::from(&PrivateKey::from_rng(&rng).unwrap().public_key());
        let charlie = PeerId::from(&PrivateKey::from_rng(&rng).unwrap().public_key());

        let mut progress = SyncProgress {
            peers: BTreeSet::from([bob.clone(), charlie.clone()]),
            synced: BTreeMap::new(),
            enabled_views: view_set(["passwords", "photos"]),
            quorum: 1,
            departed: false,
        };

        let views = view_set(["passwords", "music"]);
        assert_eq!(progress.outcome(&views), None);

        progress.synced.insert(bob.clone(), view_set(["photos"]));
        assert_eq!(progress.outcome(&views), None);

        progress.synced.insert(charlie.clone(), view_set(["passwords"]));
        assert_eq!(progress.outcome(&views), Some(Ok(())));

        assert_eq!(
            progress.outcome(&view_set(["music"])),
            Some(Err(WaitError::EmptyViewSet))
        );

        progress.departed = true;
        assert_eq!(progress.outcome(&views), Some(Err(WaitError::Departed)));
    }
}
