// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt::Display;
use std::time::Duration;
#[cfg(not(test))]
use std::time::{SystemTime, SystemTimeError, UNIX_EPOCH};

#[cfg(test)]
use mock_instant::SystemTimeError;
#[cfg(test)]
use mock_instant::thread_local::{SystemTime, UNIX_EPOCH};
use serde::{Deserialize, Serialize};

/// Seconds since the UNIX epoch based on system time.
///
/// Used to date retirement tickets and to decide when they are finalized.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Current system time.
    ///
    /// Falls back to the epoch if the clock is set before it.
    pub fn now() -> Self {
        SystemTime::now().try_into().unwrap_or_default()
    }

    /// Returns true if more than `delay` has passed between this timestamp and `now`.
    pub fn has_elapsed(&self, delay: Duration, now: Timestamp) -> bool {
        now.0.saturating_sub(self.0) >= delay.as_secs()
    }
}

impl From<Timestamp> for u64 {
    fn from(value: Timestamp) -> Self {
        value.0
    }
}

impl TryFrom<SystemTime> for Timestamp {
    type Error = SystemTimeError;

    fn try_from(system_time: SystemTime) -> Result<Self, Self::Error> {
        let duration = system_time.duration_since(UNIX_EPOCH)?;
        Ok(Self(duration.as_secs()))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
