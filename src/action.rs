// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};

use crate::concordance::Verdict;

/// State transition the lifecycle controller applies for a verdict.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Adopt the proposal as it is.
    Accept,

    /// Adopt the proposal and add the local countersignature.
    Countersign,

    /// Leave the circle.
    Leave,

    /// Keep the accepted state and publish it again.
    Revert,

    /// Repair the local device's own record and publish the result.
    Modify,

    /// Drop the proposal.
    Ignore,
}

impl Action {
    /// Maps a verdict to an action.
    ///
    /// `locally_trusted` tells if the accepted state verifies under the current anchor, `vouched`
    /// if the proposal carries a valid anchor or trusted member signature.
    pub fn for_verdict(verdict: Verdict, locally_trusted: bool, vouched: bool) -> Self {
        match verdict {
            Verdict::Trusted => Action::Countersign,
            Verdict::NoPeerSignature => Action::Accept,
            Verdict::NoPeerLeft => Action::Leave,
            Verdict::MissingMe | Verdict::NotWorthy => Action::Modify,
            Verdict::NoUserKey => Action::Ignore,
            Verdict::GenerationOld | Verdict::InvalidMembership => {
                if locally_trusted {
                    Action::Revert
                } else {
                    Action::Ignore
                }
            }
            Verdict::BadUserSignature | Verdict::BadPeerSignature | Verdict::NoUserSignature => {
                if locally_trusted {
                    Action::Revert
                } else if vouched {
                    Action::Accept
                } else {
                    Action::Ignore
                }
            }
        }
    }
}
