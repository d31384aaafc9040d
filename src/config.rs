// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::view::{ViewName, ViewSet};

/// Retirement tickets are kept around for one day before being finalized.
const DEFAULT_FINALIZATION_DELAY: Duration = Duration::from_secs(60 * 60 * 24);

/// Configuration for an account.
///
/// Created once when an account is constructed and owned by it. Holds the set of views known to
/// this deployment which would otherwise be process-wide state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Name the circle is published under.
    pub(crate) circle_name: String,

    /// Every view this deployment knows about, copied into each peer record as its permitted
    /// views.
    pub(crate) known_views: ViewSet,

    /// Views a device enables when it first enrolls.
    pub(crate) default_views: ViewSet,

    /// Views which get their secrets distributed in a backup ring each.
    pub(crate) backup_views: ViewSet,

    /// Views which get a plain membership ring each.
    pub(crate) membership_views: ViewSet,

    /// Time after which a received retirement ticket is finalized.
    pub(crate) retirement_finalization_delay: Duration,

    /// Remove duplicate enrollments of the local device from the circle.
    pub(crate) ghost_busting: bool,

    /// Number of other members which need to report a view set before it is considered in sync.
    pub(crate) sync_quorum: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            circle_name: "circle".to_string(),
            known_views: ViewSet::new(),
            default_views: ViewSet::new(),
            backup_views: ViewSet::new(),
            membership_views: ViewSet::new(),
            retirement_finalization_delay: DEFAULT_FINALIZATION_DELAY,
            ghost_busting: true,
            sync_quorum: 1,
        }
    }
}

impl Config {
    /// Configuration with the given known views, all of them enabled by default.
    pub fn new(known_views: ViewSet) -> Self {
        Self {
            default_views: known_views.clone(),
            known_views,
            ..Default::default()
        }
    }

    pub fn with_circle_name(mut self, name: impl Into<String>) -> Self {
        self.circle_name = name.into();
        self
    }

    pub fn with_default_views(mut self, views: ViewSet) -> Self {
        self.default_views = views;
        self
    }

    /// Backup views need to be known views, others are ignored.
    pub fn with_backup_views(mut self, views: ViewSet) -> Self {
        self.backup_views = views.intersection(&self.known_views).cloned().collect();
        self
    }

    /// Membership views need to be known views, others are ignored.
    pub fn with_membership_views(mut self, views: ViewSet) -> Self {
        self.membership_views = views.intersection(&self.known_views).cloned().collect();
        self
    }

    pub fn with_retirement_finalization_delay(mut self, delay: Duration) -> Self {
        self.retirement_finalization_delay = delay;
        self
    }

    pub fn with_ghost_busting(mut self, enabled: bool) -> Self {
        self.ghost_busting = enabled;
        self
    }

    pub fn with_sync_quorum(mut self, quorum: usize) -> Self {
        self.sync_quorum = quorum;
        self
    }

    pub fn circle_name(&self) -> &str {
        &self.circle_name
    }

    pub fn known_views(&self) -> &ViewSet {
        &self.known_views
    }

    pub fn is_known_view(&self, view: &ViewName) -> bool {
        self.known_views.contains(view)
    }

    pub fn default_views(&self) -> &ViewSet {
        &self.default_views
    }

    pub fn backup_views(&self) -> &ViewSet {
        &self.backup_views
    }

    pub fn membership_views(&self) -> &ViewSet {
        &self.membership_views
    }

    pub fn retirement_finalization_delay(&self) -> Duration {
        self.retirement_finalization_delay
    }

    pub fn ghost_busting(&self) -> bool {
        self.ghost_busting
    }

    pub fn sync_quorum(&self) -> usize {
        self.sync_quorum
    }
}
