use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tokio::sync::Mutex;

use super::config::{ReplicatedMapConfig, ReplicationStrategy};
use super::entry::{MapEntry, Role};
use super::error::MapError;
use super::message::{MapMessage, MessageKind, encode};
use super::value::{MapKey, MapOwner, MapValue, OwnerHandle};
use crate::membership::tracker::MapMembers;
use crate::membership::types::{NodeId, exclude_from_set, in_set};
use crate::transport::{ReplyPolicy, Transport, TransportError};

/// Lifecycle of a map instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapState {
    /// Constructed but the join handshake has not completed.
    New,
    Initialized,
    /// Shut down. Operations are rejected and inbound traffic is ignored.
    Destroyed,
}

/// Members a publish round reached.
#[derive(Debug, Default)]
pub(super) struct Published {
    /// Members now holding the value as backup or copy.
    pub backups: Vec<NodeId>,
    /// Members told to hold a proxy.
    pub proxied: Vec<NodeId>,
}

/// A map replicated across every node hosting a map of the same name.
///
/// Instances are created with [`ReplicatedMap::new`] and must be
/// [`shutdown`](ReplicatedMap::shutdown) to leave the cluster: the transport
/// keeps the map registered until then.
pub struct ReplicatedMap<K, V> {
    pub(super) config: ReplicatedMapConfig,
    pub(super) map_id: Vec<u8>,
    pub(super) local: NodeId,
    pub(super) transport: Arc<dyn Transport>,
    pub(super) entries: DashMap<K, MapEntry<K, V>>,
    pub(super) members: MapMembers,
    /// Serializes state transfer against backup audits.
    pub(super) state_lock: Mutex<()>,
    pub(super) owner: Option<Arc<dyn MapOwner<K, V>>>,
    pub(super) owner_handle: Option<OwnerHandle>,
    pub(super) initialized: AtomicBool,
    pub(super) destroyed: AtomicBool,
    pub(super) state_transferred: AtomicBool,
}

impl<K: MapKey, V: MapValue> ReplicatedMap<K, V> {
    pub fn map_name(&self) -> &str {
        &self.config.name
    }

    pub fn map_id(&self) -> &[u8] {
        &self.map_id
    }

    pub fn local_member(&self) -> &NodeId {
        &self.local
    }

    pub fn config(&self) -> &ReplicatedMapConfig {
        &self.config
    }

    pub fn state(&self) -> MapState {
        if self.destroyed.load(Ordering::SeqCst) {
            MapState::Destroyed
        } else if self.initialized.load(Ordering::SeqCst) {
            MapState::Initialized
        } else {
            MapState::New
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state() == MapState::Initialized
    }

    pub fn is_state_transferred(&self) -> bool {
        self.state_transferred.load(Ordering::SeqCst)
    }

    /// Members currently hosting this map, sorted.
    pub async fn map_members(&self) -> Vec<NodeId> {
        self.members.snapshot().await
    }

    pub(super) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<(), MapError> {
        if self.is_destroyed() {
            Err(MapError::Destroyed)
        } else {
            Ok(())
        }
    }

    /// Hands the map's owner to a value that wants it.
    pub(super) fn attach_owner(&self, value: &mut V) {
        if let Some(replicable) = value.as_replicable_mut() {
            replicable.set_owner(self.owner_handle.clone());
        }
    }

    pub(super) fn notify_made_primary(&self, key: &K, value: &V) {
        if let Some(owner) = &self.owner {
            owner.object_made_primary(key, value);
        }
    }

    fn replicate_kind(&self) -> MessageKind {
        match self.config.strategy {
            ReplicationStrategy::Lazy => MessageKind::Backup,
            ReplicationStrategy::Full => MessageKind::Copy,
        }
    }

    // ---------------------------------------------------------------
    // Client operations
    // ---------------------------------------------------------------

    /// Stores `value` as primary on this node.
    ///
    /// An existing entry for `key` is removed first (cluster-wide when
    /// `notify`). With `notify` the entry is then published to the other
    /// members. Returns the value previously held locally.
    pub async fn put(&self, key: K, value: V, notify: bool) -> Result<Option<V>, MapError> {
        self.ensure_running()?;

        let old = if self.entries.contains_key(&key) {
            self.remove(&key, notify).await?
        } else {
            None
        };

        let mut entry = MapEntry::primary(key.clone(), value, self.local.clone());
        if notify && let Some(value) = entry.value.as_ref() {
            entry.backup_nodes = self.publish_entry_info(&key, value).await.backups;
        }
        self.entries.insert(key, entry);
        Ok(old)
    }

    /// Inserts every pair with `notify = true`.
    pub async fn put_all(&self, pairs: impl IntoIterator<Item = (K, V)>) -> Result<(), MapError> {
        for (key, value) in pairs {
            self.put(key, value, true).await?;
        }
        Ok(())
    }

    /// Deletes `key` locally and, with `notify`, on every map member.
    pub async fn remove(&self, key: &K, notify: bool) -> Result<Option<V>, MapError> {
        self.ensure_running()?;

        let removed = self.entries.remove(key).map(|(_, entry)| entry);
        if notify {
            let members = self.members.snapshot().await;
            if !members.is_empty() {
                let msg = MapMessage::new(&self.map_id, MessageKind::Remove).with_key(encode(key)?);
                if let Err(e) = self.transport.send(&members, &msg).await {
                    tracing::warn!("Unable to replicate removal of {:?} in map {}: {}", key, self.config.name, e);
                }
            }
        }
        Ok(removed.and_then(|entry| entry.value))
    }

    /// Empties the map. With `notify` every key is removed cluster-wide.
    pub async fn clear(&self, notify: bool) -> Result<(), MapError> {
        if notify {
            for key in self.keys_full() {
                self.remove(&key, true).await?;
            }
        } else {
            self.entries.clear();
        }
        Ok(())
    }

    /// Returns the value for `key`, making this node its primary.
    ///
    /// A proxy first retrieves the value from one of the recorded backups. The
    /// new primary publishes fresh backups, then tells every node that may
    /// still hold a stale role for the key (other map members and the
    /// previously recorded backups) to become a proxy.
    pub async fn get(&self, key: &K) -> Option<V> {
        if self.is_destroyed() {
            return None;
        }

        let (role, previous_backups) = {
            let entry = self.entries.get(key)?;
            if entry.is_primary() {
                return entry.value.clone();
            }
            (entry.role(), entry.backup_nodes.clone())
        };

        let fetched = if role == Role::Proxy {
            Some(self.retrieve(key, &previous_backups).await?)
        } else {
            None
        };

        let value = {
            let mut entry = self.entries.get_mut(key)?;
            if entry.is_primary() {
                return entry.value.clone();
            }
            if let Some(value) = fetched {
                entry.value = Some(value);
            }
            let mut value = entry.value.clone()?;
            self.attach_owner(&mut value);
            entry.value = Some(value.clone());
            entry.make_primary(self.local.clone());
            value
        };

        let published = self.publish_entry_info(key, &value).await;
        if let Some(mut entry) = self.entries.get_mut(key)
            && entry.is_primary()
        {
            entry.backup_nodes = published.backups.clone();
        }
        self.invalidate_stale(key, &previous_backups, &published).await;

        tracing::debug!("Key {:?} made primary on {} in map {}", key, self.local, self.config.name);
        self.notify_made_primary(key, &value);
        Some(value)
    }

    /// Pulls the current value of `key` from one of `backups`.
    async fn retrieve(&self, key: &K, backups: &[NodeId]) -> Option<V> {
        let key_bytes = encode(key).ok()?;
        let msg = MapMessage::new(&self.map_id, MessageKind::Retrieve).with_key(key_bytes);

        let replies = match self
            .transport
            .send_request(backups, &msg, ReplyPolicy::First, self.config.rpc_timeout)
            .await
        {
            Ok(replies) => replies,
            Err(e) => {
                tracing::warn!("Unable to retrieve {:?} in map {}: {}", key, self.config.name, e);
                return None;
            }
        };

        let Some(reply) = replies.first() else {
            tracing::warn!("Unable to retrieve remote object for key {:?} in map {}", key, self.config.name);
            return None;
        };
        match reply.message.decode_value::<V>() {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Unable to decode retrieved value for {:?}: {}", key, e);
                None
            }
        }
    }

    /// Sends PROXY for `key` to every node that is not a fresh backup and was
    /// not already proxied by the publish round.
    async fn invalidate_stale(&self, key: &K, previous_backups: &[NodeId], published: &Published) {
        let skip: Vec<NodeId> = published
            .backups
            .iter()
            .chain(published.proxied.iter())
            .chain(std::iter::once(&self.local))
            .cloned()
            .collect();
        let mut targets = self.members.snapshot_excluding(&skip).await;
        for member in exclude_from_set(&skip, previous_backups) {
            if !in_set(&member, &targets) {
                targets.push(member);
            }
        }
        if targets.is_empty() {
            return;
        }

        let Ok(key_bytes) = encode(key) else { return };
        let msg = MapMessage::new(&self.map_id, MessageKind::Proxy)
            .with_key(key_bytes)
            .with_primary(Some(self.local.clone()))
            .with_backups(published.backups.clone());
        if let Err(e) = self.transport.send(&targets, &msg).await {
            tracing::debug!("Unable to invalidate {:?} on {:?}: {}", key, targets, e);
        }
    }

    /// Applies `f` to the local primary value in place. Returns `None` if
    /// this node is not primary for `key`.
    ///
    /// The closure runs under the entry guard, so it must not block.
    pub fn update<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let mut entry = self.entries.get_mut(key)?;
        if !entry.is_primary() {
            return None;
        }
        entry.value.as_mut().map(f)
    }

    /// `true` if `key` is held locally as primary or backup.
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.get(key).map(|entry| entry.is_active()).unwrap_or(false)
    }

    /// Snapshot of the local entry for `key`, whatever its role.
    pub fn get_entry(&self, key: &K) -> Option<MapEntry<K, V>> {
        self.entries.get(key).map(|entry| entry.clone())
    }

    /// Keys held as primary or backup.
    pub fn keys(&self) -> Vec<K> {
        self.entries
            .iter()
            .filter(|entry| entry.is_active())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Number of entries held as primary or backup.
    pub fn size(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_active()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Every key known locally, proxies included.
    pub fn keys_full(&self) -> Vec<K> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn size_full(&self) -> usize {
        self.entries.len()
    }

    // ---------------------------------------------------------------
    // Replication
    // ---------------------------------------------------------------

    /// Pushes the current state of a primary entry to its backups.
    ///
    /// A diffable value that is dirty (or `complete`) ships a delta; any
    /// other dirty value, or a `complete` push, ships the full value; an
    /// untouched value that asks for access replication ships an ACCESS.
    pub async fn replicate(&self, key: &K, complete: bool) {
        let Some((targets, msg)) = self.replication_message(key, complete) else {
            return;
        };
        if let Err(e) = self.transport.send(&targets, &msg).await {
            tracing::error!("Unable to replicate data for {:?} in map {}: {}", key, self.config.name, e);
        }
    }

    /// Runs [`ReplicatedMap::replicate`] for every local key.
    pub async fn replicate_all(&self, complete: bool) {
        for key in self.keys_full() {
            self.replicate(&key, complete).await;
        }
    }

    fn replication_message(&self, key: &K, complete: bool) -> Option<(Vec<NodeId>, MapMessage)> {
        let mut entry = self.entries.get_mut(key)?;
        if !entry.is_primary() || !entry.has_backups() {
            return None;
        }

        let key_bytes = match encode(key) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Key {:?} is not transmissible: {}", key, e);
                return None;
            }
        };
        let targets = entry.backup_nodes.clone();
        let base = MapMessage::new(&self.map_id, self.replicate_kind())
            .with_key(key_bytes)
            .with_primary(entry.primary.clone())
            .with_backups(targets.clone());
        let value = entry.value.as_mut()?;

        let mut dirty = false;
        let mut access = false;
        if let Some(replicable) = value.as_replicable_mut() {
            dirty = replicable.is_dirty();
            access = replicable.is_access_replicate();
            if replicable.is_diffable() && (dirty || complete) {
                match replicable.diff() {
                    Ok(diff) => {
                        replicable.reset_diff();
                        return Some((targets, base.with_diff(diff)));
                    }
                    Err(e) => {
                        tracing::warn!("Unable to diff {:?}, sending full value: {}", key, e);
                    }
                }
            }
        }

        if complete || dirty {
            return match encode(&*value) {
                Ok(bytes) => {
                    if let Some(replicable) = value.as_replicable_mut() {
                        replicable.reset_diff();
                    }
                    Some((targets, base.with_value(Some(bytes))))
                }
                Err(e) => {
                    tracing::warn!("Value for {:?} is not transmissible: {}", key, e);
                    None
                }
            };
        }

        if access {
            let mut touch = base;
            touch.kind = MessageKind::Access;
            return Some((targets, touch));
        }
        None
    }

    // ---------------------------------------------------------------
    // Publishing
    // ---------------------------------------------------------------

    /// Places `key` on the other members according to the strategy.
    /// Returns who ended up with the value and who was proxied.
    pub(super) async fn publish_entry_info(&self, key: &K, value: &V) -> Published {
        let (key_bytes, value_bytes) = match (encode(key), encode(value)) {
            (Ok(key_bytes), Ok(value_bytes)) => (key_bytes, value_bytes),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!("Entry {:?} is not transmissible: {}", key, e);
                return Published::default();
            }
        };

        match self.config.strategy {
            ReplicationStrategy::Lazy => self.publish_lazy(key, key_bytes, value_bytes).await,
            ReplicationStrategy::Full => self.publish_full(key, key_bytes, value_bytes).await,
        }
    }

    /// One round-robin backup, proxies everywhere else. A backup candidate
    /// that cannot be reached is skipped in favour of the next one.
    async fn publish_lazy(&self, key: &K, key_bytes: Vec<u8>, value_bytes: Vec<u8>) -> Published {
        let members = self.members.snapshot().await;
        let Some(first) = self.members.next_backup_index(members.len()) else {
            return Published::default();
        };

        let mut next = first;
        loop {
            let candidate = members[next].clone();
            next = (next + 1) % members.len();

            let backups = vec![candidate.clone()];
            let msg = MapMessage::new(&self.map_id, MessageKind::Backup)
                .with_key(key_bytes.clone())
                .with_value(Some(value_bytes.clone()))
                .with_primary(Some(self.local.clone()))
                .with_backups(backups.clone());

            match self.transport.send(&backups, &msg).await {
                Ok(()) => {
                    let proxied = exclude_from_set(&backups, &members);
                    if !proxied.is_empty() {
                        let proxy = MapMessage::new(&self.map_id, MessageKind::Proxy)
                            .with_key(key_bytes)
                            .with_primary(Some(self.local.clone()))
                            .with_backups(backups.clone());
                        if let Err(e) = self.transport.send(&proxied, &proxy).await {
                            tracing::warn!("Unable to send proxy for {:?}: {}", key, e);
                        }
                    }
                    return Published { backups, proxied };
                }
                Err(e) => {
                    tracing::error!("Unable to replicate backup key {:?} to {}: {}", key, candidate, e);
                }
            }

            if next == first {
                return Published::default();
            }
        }
    }

    /// Full copy to every member. Members that could not be reached are left
    /// out of the returned backups.
    async fn publish_full(&self, key: &K, key_bytes: Vec<u8>, value_bytes: Vec<u8>) -> Published {
        let mut backups = self.members.snapshot().await;
        if backups.is_empty() {
            return Published::default();
        }

        let msg = MapMessage::new(&self.map_id, MessageKind::Copy)
            .with_key(key_bytes)
            .with_value(Some(value_bytes))
            .with_primary(Some(self.local.clone()))
            .with_backups(backups.clone());
        match self.transport.send(&backups, &msg).await {
            Ok(()) => {}
            Err(TransportError::Faulty(faulty)) => {
                tracing::warn!("Unable to copy {:?} to {:?}", key, faulty);
                backups.retain(|member| !in_set(member, &faulty));
            }
            Err(e) => {
                tracing::error!("Unable to copy {:?}: {}", key, e);
                return Published::default();
            }
        }
        Published {
            backups,
            proxied: Vec::new(),
        }
    }
}
