//! Inbound traffic for a replicated map.
//!
//! Fire-and-forget messages mutate the local table; requests are answered
//! from it. A message whose key or value cannot be decoded is dropped with a
//! warning and leaves the table untouched.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;

use super::entry::MapEntry;
use super::error::MapError;
use super::message::{MapMessage, MessageKind, encode};
use super::replicated::ReplicatedMap;
use super::value::{MapKey, MapValue};
use crate::membership::types::NodeId;
use crate::transport::MapListener;

impl<K: MapKey, V: MapValue> ReplicatedMap<K, V> {
    /// Processes a fire-and-forget message (or the first reply to one of our
    /// own broadcasts).
    pub(super) async fn handle_message(&self, msg: MapMessage, sender: NodeId) {
        match msg.kind {
            MessageKind::Start => {
                let member = msg.primary.unwrap_or(sender);
                self.map_member_added(&member).await;
            }
            MessageKind::Stop => {
                let member = msg.primary.unwrap_or(sender);
                self.member_disappeared(&member).await;
            }
            MessageKind::Proxy
            | MessageKind::Remove
            | MessageKind::Backup
            | MessageKind::Copy
            | MessageKind::Access => {
                if let Err(e) = self.apply_entry_message(&msg) {
                    tracing::warn!(
                        "Dropping {:?} message from {} for map {}: {}",
                        msg.kind,
                        sender,
                        self.config.name,
                        e
                    );
                }
            }
            MessageKind::Init | MessageKind::Retrieve | MessageKind::State | MessageKind::StateCopy => {}
        }
    }

    /// Applies an entry-level message to the local table.
    pub(super) fn apply_entry_message(&self, msg: &MapMessage) -> Result<(), MapError> {
        let key: K = msg.decode_key()?;
        match msg.kind {
            MessageKind::Proxy => {
                let mut entry = self
                    .entries
                    .entry(key.clone())
                    .or_insert_with(|| MapEntry::remote(key, None));
                entry.set_proxy(true);
                entry.value = None;
                entry.primary = msg.primary.clone();
                entry.backup_nodes = msg.backup_nodes.clone().unwrap_or_default();
            }
            MessageKind::Remove => {
                self.entries.remove(&key);
            }
            MessageKind::Backup | MessageKind::Copy => self.apply_replica(key, msg)?,
            MessageKind::Access => {
                if let Some(mut entry) = self.entries.get_mut(&key) {
                    entry.primary = msg.primary.clone();
                    entry.backup_nodes = msg.backup_nodes.clone().unwrap_or_default();
                    if let Some(replicable) = entry.value.as_mut().and_then(|value| value.as_replicable_mut()) {
                        replicable.access_entry();
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// BACKUP or COPY: store the value (or apply its delta) and adopt the
    /// role carried by the message.
    fn apply_replica(&self, key: K, msg: &MapMessage) -> Result<(), MapError> {
        let incoming: Option<V> = if msg.diff { None } else { msg.decode_value()? };

        let mut entry = match self.entries.entry(key.clone()) {
            Entry::Occupied(slot) => slot.into_ref(),
            Entry::Vacant(slot) => {
                if msg.diff {
                    return Err(MapError::Diff(format!("no local value for {:?}", key)));
                }
                slot.insert(MapEntry::remote(key, None))
            }
        };

        if msg.diff {
            let diff = msg.diff_value.as_deref().ok_or(MapError::MissingField("diff_value"))?;
            let current = entry
                .value
                .as_ref()
                .ok_or_else(|| MapError::Diff("no local value".to_string()))?;
            let mut scratch = current.clone();
            match scratch.as_replicable_mut() {
                Some(replicable) if replicable.is_diffable() => {
                    replicable
                        .apply_diff(diff)
                        .map_err(|e| MapError::Diff(e.to_string()))?;
                }
                _ => return Err(MapError::Diff("local value is not diffable".to_string())),
            }
            entry.value = Some(scratch);
        } else if let Some(mut value) = incoming {
            self.attach_owner(&mut value);
            entry.value = Some(value);
        } else if let Some(value) = entry.value.as_mut() {
            self.attach_owner(value);
        }

        if msg.kind == MessageKind::Backup {
            entry.set_backup(true);
        } else {
            entry.set_backup(false);
            entry.set_proxy(false);
        }
        entry.primary = msg.primary.clone();
        entry.backup_nodes = msg.backup_nodes.clone().unwrap_or_default();
        Ok(())
    }

    /// Answers a request/reply message.
    pub(super) async fn handle_request(&self, msg: MapMessage, sender: NodeId) -> Option<MapMessage> {
        match msg.kind {
            MessageKind::Init => Some(MapMessage::control(&self.map_id, MessageKind::Init, self.local.clone())),
            MessageKind::Start => {
                self.map_member_added(&sender).await;
                Some(MapMessage::control(&self.map_id, MessageKind::Start, self.local.clone()))
            }
            MessageKind::Retrieve => self.retrieve_reply(&msg),
            MessageKind::State | MessageKind::StateCopy => {
                match self.state_reply(msg.kind == MessageKind::StateCopy).await {
                    Ok(reply) => Some(reply),
                    Err(e) => {
                        tracing::error!("Unable to build state for map {}: {}", self.config.name, e);
                        None
                    }
                }
            }
            _ => None,
        }
    }

    /// Current value of the requested key, if held locally and transmissible.
    fn retrieve_reply(&self, msg: &MapMessage) -> Option<MapMessage> {
        let key: K = match msg.decode_key() {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!("Unable to decode RETRIEVE key for map {}: {}", self.config.name, e);
                return None;
            }
        };
        let entry = self.entries.get(&key)?;
        let value = encode(entry.value.as_ref()?).ok()?;

        Some(
            MapMessage::new(&self.map_id, MessageKind::Retrieve)
                .with_key(msg.key.clone().unwrap_or_default())
                .with_value(Some(value))
                .with_primary(entry.primary.clone())
                .with_backups(entry.backup_nodes.clone()),
        )
    }

    /// Late replies to our own FIRST broadcasts.
    pub(super) async fn handle_left_over(&self, msg: MapMessage, sender: NodeId) {
        let member = msg.primary.clone().unwrap_or(sender);
        match msg.kind {
            MessageKind::Start => self.map_member_added(&member).await,
            MessageKind::Init => self.member_alive(&member).await,
            _ => {}
        }
    }
}

#[async_trait]
impl<K: MapKey, V: MapValue> MapListener for ReplicatedMap<K, V> {
    fn map_id(&self) -> &[u8] {
        &self.map_id
    }

    fn accept(&self, msg: &MapMessage, _sender: &NodeId) -> bool {
        !self.is_destroyed() && msg.map_id == self.map_id
    }

    async fn on_message(&self, msg: MapMessage, sender: NodeId) {
        if self.is_destroyed() {
            return;
        }
        self.handle_message(msg, sender).await;
    }

    async fn on_left_over_message(&self, msg: MapMessage, sender: NodeId) {
        if self.is_destroyed() {
            return;
        }
        self.handle_left_over(msg, sender).await;
    }

    async fn on_request(&self, msg: MapMessage, sender: NodeId) -> Option<MapMessage> {
        if self.is_destroyed() {
            return None;
        }
        self.handle_request(msg, sender).await
    }

    async fn on_member_added(&self, member: NodeId) {
        // Map membership follows START/INIT traffic, not transport events.
        tracing::debug!("Transport member {} added, map {}", member, self.config.name);
    }

    async fn on_member_removed(&self, member: NodeId) {
        if self.is_destroyed() {
            return;
        }
        self.member_disappeared(&member).await;
    }

    async fn on_heartbeat(&self) {
        self.heartbeat().await;
    }
}
