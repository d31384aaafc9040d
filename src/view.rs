// SPDX-License-Identifier: MIT OR Apache-2.0

//! Named partitions of synced data a device can opt into.
use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of a data view, for example "passwords" or "contacts".
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ViewName(String);

impl ViewName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ViewName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for ViewName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ViewName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

pub type ViewSet = BTreeSet<ViewName>;

/// Collects view names into a set.
pub fn view_set<I, V>(views: I) -> ViewSet
where
    I: IntoIterator<Item = V>,
    V: Into<ViewName>,
{
    views.into_iter().map(Into::into).collect()
}
