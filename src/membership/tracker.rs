use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::types::{NodeId, exclude_from_set};

/// A replicated map's private view of which peers host the same map.
///
/// This is independent of the transport's member list: a peer only enters
/// the table after it answered an INIT or announced a START for this map.
/// Each entry records when the peer was last heard from.
pub struct MapMembers {
    local: NodeId,
    members: RwLock<HashMap<NodeId, Instant>>,
    /// Round-robin cursor used when choosing the next backup node.
    current_node: AtomicUsize,
}

impl MapMembers {
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            members: RwLock::new(HashMap::new()),
            current_node: AtomicUsize::new(0),
        }
    }

    /// Adds `member` if it is not tracked yet. Returns `true` when it was new.
    pub async fn add_if_absent(&self, member: &NodeId) -> bool {
        if member == &self.local {
            return false;
        }
        let mut members = self.members.write().await;
        if members.contains_key(member) {
            return false;
        }
        members.insert(member.clone(), Instant::now());
        true
    }

    /// Refreshes the last-seen time of `member`, inserting it if needed.
    pub async fn touch(&self, member: &NodeId) {
        if member == &self.local {
            return;
        }
        self.members
            .write()
            .await
            .insert(member.clone(), Instant::now());
    }

    /// Removes `member`. Returns `true` if it was tracked.
    pub async fn remove(&self, member: &NodeId) -> bool {
        self.members.write().await.remove(member).is_some()
    }

    pub async fn contains(&self, member: &NodeId) -> bool {
        self.members.read().await.contains_key(member)
    }

    /// Snapshot of the tracked members, sorted so that round-robin selection
    /// walks a stable order between calls.
    pub async fn snapshot(&self) -> Vec<NodeId> {
        let mut members: Vec<NodeId> = self.members.read().await.keys().cloned().collect();
        members.sort();
        members
    }

    pub async fn snapshot_excluding(&self, exclude: &[NodeId]) -> Vec<NodeId> {
        exclude_from_set(exclude, &self.snapshot().await)
    }

    /// Members that have not been seen for longer than `timeout`.
    pub async fn expired(&self, timeout: Duration) -> Vec<NodeId> {
        let now = Instant::now();
        self.members
            .read()
            .await
            .iter()
            .filter(|(_, last_seen)| now.duration_since(**last_seen) > timeout)
            .map(|(member, _)| member.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.members.write().await.clear();
    }

    /// Next index into a member snapshot of length `size`, or `None` when
    /// there is nobody to pick. The cursor wraps back to zero if the member
    /// set shrank since the previous call.
    pub fn next_backup_index(&self, size: usize) -> Option<usize> {
        if size == 0 {
            return None;
        }
        let node = self.current_node.fetch_add(1, Ordering::SeqCst);
        if node >= size {
            self.current_node.store(1, Ordering::SeqCst);
            return Some(0);
        }
        Some(node)
    }

    #[cfg(test)]
    pub(crate) async fn backdate(&self, member: &NodeId, age: Duration) {
        if let Some(last_seen) = self.members.write().await.get_mut(member)
            && let Some(earlier) = Instant::now().checked_sub(age)
        {
            *last_seen = earlier;
        }
    }
}
