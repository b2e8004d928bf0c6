//! Membership changes and the rebalancing they trigger.
//!
//! ## Arrival
//! A new member gets a backup for every local primary that has none. The
//! same audit runs again whenever a known member answers a ping while such
//! primaries remain.
//!
//! ## Departure
//! For each local entry, in order:
//! 1. Primary backed up on the leaver: re-publish to get fresh backups.
//! 2. Otherwise, if the leaver was the primary: forget the primary.
//! 3. Proxy with no primary whose only backup was the leaver: drop it.
//! 4. Backup with no primary whose only backup is this node: promote it.

use std::time::Duration;

use super::error::MapError;
use super::message::{MapMessage, MessageKind};
use super::replicated::ReplicatedMap;
use super::value::{MapKey, MapValue};
use crate::membership::types::{NodeId, in_set};
use crate::transport::ReplyPolicy;

enum Departure<V> {
    Republish(V),
    Promote(V),
    Drop,
    Keep,
}

impl<K: MapKey, V: MapValue> ReplicatedMap<K, V> {
    /// Starts tracking `member` and, if it is new, gives it a backup of every
    /// local primary that has none.
    pub async fn map_member_added(&self, member: &NodeId) {
        if *member == self.local {
            return;
        }
        if !self.members.add_if_absent(member).await {
            return;
        }
        tracing::info!("Map {} member added: {}", self.config.name, member);

        let _guard = self.state_lock.lock().await;
        self.audit_backups().await;
    }

    async fn audit_backups(&self) {
        if self.members.is_empty().await {
            return;
        }
        let orphans: Vec<K> = self
            .entries
            .iter()
            .filter(|entry| entry.is_primary() && !entry.has_backups())
            .map(|entry| entry.key().clone())
            .collect();

        for key in orphans {
            let value = match self.entries.get(&key) {
                Some(entry) if entry.is_primary() && !entry.has_backups() => entry.value.clone(),
                _ => None,
            };
            let Some(value) = value else { continue };

            let published = self.publish_entry_info(&key, &value).await;
            if let Some(mut entry) = self.entries.get_mut(&key)
                && entry.is_primary()
            {
                entry.primary = Some(self.local.clone());
                entry.backup_nodes = published.backups;
            }
        }
    }

    /// Refreshes the last-seen time of `member`, tracking it first if needed.
    ///
    /// Primaries still without a backup (an earlier publish found nobody
    /// reachable) are audited again, so they get one once a peer answers.
    pub async fn member_alive(&self, member: &NodeId) {
        if *member == self.local {
            return;
        }
        if !self.members.contains(member).await {
            self.map_member_added(member).await;
            return;
        }
        self.members.touch(member).await;

        if self.has_unbacked_primaries() {
            let _guard = self.state_lock.lock().await;
            self.audit_backups().await;
        }
    }

    fn has_unbacked_primaries(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.is_primary() && !entry.has_backups())
    }

    /// Stops tracking `member` and repairs every entry it was involved in.
    /// Does nothing for a member that was not tracked.
    pub async fn member_disappeared(&self, member: &NodeId) {
        if !self.members.remove(member).await {
            return;
        }
        tracing::info!("Map {} member disappeared: {}", self.config.name, member);

        for key in self.keys_full() {
            match self.departure_action(&key, member) {
                Departure::Republish(value) => {
                    let published = self.publish_entry_info(&key, &value).await;
                    if let Some(mut entry) = self.entries.get_mut(&key)
                        && entry.is_primary()
                    {
                        entry.primary = Some(self.local.clone());
                        entry.backup_nodes = published.backups;
                    }
                }
                Departure::Promote(value) => {
                    let published = self.publish_entry_info(&key, &value).await;
                    if let Some(mut entry) = self.entries.get_mut(&key)
                        && entry.is_primary()
                    {
                        entry.backup_nodes = published.backups;
                    }
                    tracing::info!("Promoted {:?} to primary in map {}", key, self.config.name);
                    self.notify_made_primary(&key, &value);
                }
                Departure::Drop => {
                    self.entries.remove_if(&key, |_, entry| {
                        entry.is_proxy() && entry.primary.is_none() && entry.sole_backup_is(member)
                    });
                }
                Departure::Keep => {}
            }
        }
    }

    fn departure_action(&self, key: &K, member: &NodeId) -> Departure<V> {
        let Some(mut entry) = self.entries.get_mut(key) else {
            return Departure::Keep;
        };

        if entry.is_primary() && in_set(member, &entry.backup_nodes) {
            return match entry.value.clone() {
                Some(value) => Departure::Republish(value),
                None => Departure::Keep,
            };
        }
        if entry.primary.as_ref() == Some(member) {
            entry.primary = None;
        }

        if entry.is_proxy() && entry.primary.is_none() && entry.sole_backup_is(member) {
            return Departure::Drop;
        }
        if entry.is_backup() && entry.primary.is_none() && entry.sole_backup_is(&self.local) {
            let Some(mut value) = entry.value.clone() else {
                return Departure::Keep;
            };
            self.attach_owner(&mut value);
            entry.value = Some(value.clone());
            entry.make_primary(self.local.clone());
            entry.backup_nodes.clear();
            return Departure::Promote(value);
        }
        Departure::Keep
    }

    /// Pings every transport member and expires map members not heard from
    /// within `timeout`. Members the transport reports as unreachable are
    /// treated as departed straight away.
    pub async fn ping(&self, timeout: Duration) -> Result<(), MapError> {
        let members = self.transport.members();
        if !members.is_empty() {
            let msg = MapMessage::control(&self.map_id, MessageKind::Init, self.local.clone());
            let replies = self
                .transport
                .send_request(&members, &msg, ReplyPolicy::All, self.config.rpc_timeout)
                .await?;

            for response in &replies.responses {
                let member = response.message.primary.clone().unwrap_or_else(|| response.source.clone());
                self.member_alive(&member).await;
            }
            for member in &replies.faulty {
                tracing::warn!("Map {} member {} unreachable", self.config.name, member);
                self.member_disappeared(member).await;
            }
        }

        for member in self.members.expired(timeout).await {
            tracing::warn!("Map {} member {} expired", self.config.name, member);
            self.member_disappeared(&member).await;
        }
        Ok(())
    }

    /// Periodic liveness check, driven by the transport.
    pub async fn heartbeat(&self) {
        if self.is_destroyed() || !self.is_initialized() {
            return;
        }
        if let Err(e) = self.ping(self.config.access_timeout).await {
            tracing::error!("Unable to send heartbeat for map {}: {}", self.config.name, e);
        }
    }
}
