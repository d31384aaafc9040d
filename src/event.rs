// SPDX-License-Identifier: MIT OR Apache-2.0

//! Notifications for subsystems depending on the circle, like the content sync engine.
use std::collections::BTreeSet;

use crate::circle::Circle;
use crate::identity::PeerId;
use crate::ring::{RingName, RingPayload};

/// Difference between two accepted circles.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MembershipChange {
    pub added: BTreeSet<PeerId>,
    pub removed: BTreeSet<PeerId>,
    pub added_applicants: BTreeSet<PeerId>,
    pub removed_applicants: BTreeSet<PeerId>,
}

impl MembershipChange {
    /// Computes what changed when `new` replaced `old`.
    pub fn between(old: Option<&Circle>, new: Option<&Circle>) -> Self {
        let ids = |circle: Option<&Circle>, applicants: bool| -> BTreeSet<PeerId> {
            match circle {
                Some(circle) if applicants => circle.applicants().keys().cloned().collect(),
                Some(circle) => circle.members().keys().cloned().collect(),
                None => BTreeSet::new(),
            }
        };

        let old_members = ids(old, false);
        let new_members = ids(new, false);
        let old_applicants = ids(old, true);
        let new_applicants = ids(new, true);

        Self {
            added: new_members.difference(&old_members).cloned().collect(),
            removed: old_members.difference(&new_members).cloned().collect(),
            added_applicants: new_applicants.difference(&old_applicants).cloned().collect(),
            removed_applicants: old_applicants.difference(&new_applicants).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.added_applicants.is_empty()
            && self.removed_applicants.is_empty()
    }
}

/// Receives notifications about accepted state changes.
///
/// Called synchronously while the account is processing an event, implementations should hand
/// the notification off rather than do heavy work.
pub trait Notifier {
    fn on_membership_changed(&self, change: &MembershipChange);

    fn on_ring_updated(&self, name: &RingName, payload: &RingPayload);
}

/// Notifier which drops all notifications.
impl Notifier for () {
    fn on_membership_changed(&self, _change: &MembershipChange) {}

    fn on_ring_updated(&self, _name: &RingName, _payload: &RingPayload) {}
}
