use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a cluster member as seen by the transport.
///
/// The same id is used by every replicated map hosted on that member, so it
/// doubles as the `primary` and `backup_nodes` references stored in entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Returns `true` if `member` is part of `set`.
pub fn in_set(member: &NodeId, set: &[NodeId]) -> bool {
    set.iter().any(|m| m == member)
}

/// Members of `all` that are not in `exclude`, preserving order.
pub fn exclude_from_set(exclude: &[NodeId], all: &[NodeId]) -> Vec<NodeId> {
    all.iter()
        .filter(|m| !in_set(m, exclude))
        .cloned()
        .collect()
}
