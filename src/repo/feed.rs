//! Reference records resolved to small integer ids.

use serde::{Deserialize, Serialize};

/// A feed: the logical stream sources, items and aggregates belong to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedKey {
    /// Feed name
    pub feed: String,
    /// Data type carried by the feed, if qualified
    pub type_name: Option<String>,
}

impl FeedKey {
    /// Creates a feed key.
    pub fn new(feed: impl Into<String>, type_name: Option<&str>) -> Self {
        Self { feed: feed.into(), type_name: type_name.map(str::to_string) }
    }
}

crate::bincode_codec!(FeedKey);

/// A destination aggregates are forwarded to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForwardDest {
    /// Destination name
    pub name: String,
}

crate::bincode_codec!(ForwardDest);
