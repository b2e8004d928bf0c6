//! Map lifecycle: joining the cluster, receiving state and leaving.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tokio::sync::Mutex;

use super::config::ReplicatedMapConfig;
use super::error::MapError;
use super::message::{MapMessage, MessageKind, encode};
use super::replicated::ReplicatedMap;
use super::value::{MapKey, MapOwner, MapValue, OwnerHandle};
use crate::membership::tracker::MapMembers;
use crate::transport::{ReplyPolicy, Transport};

impl<K: MapKey, V: MapValue> ReplicatedMap<K, V> {
    /// Creates a map, registers it with `transport` and joins the cluster.
    ///
    /// Joining broadcasts INIT, copies the state of the first member found,
    /// then broadcasts START. If any step fails and `config.terminate` is
    /// set the map is shut down again and [`MapError::Startup`] is returned;
    /// otherwise the failure is logged and the map starts with what it has.
    pub async fn new(transport: Arc<dyn Transport>, config: ReplicatedMapConfig) -> Result<Arc<Self>, MapError> {
        Self::start(transport, config, None).await
    }

    /// Like [`ReplicatedMap::new`], with an owner notified on promotions and
    /// handed to values through `set_owner`.
    pub async fn with_owner<O: MapOwner<K, V>>(
        transport: Arc<dyn Transport>,
        config: ReplicatedMapConfig,
        owner: Arc<O>,
    ) -> Result<Arc<Self>, MapError> {
        let handle: OwnerHandle = owner.clone();
        let owner: Arc<dyn MapOwner<K, V>> = owner;
        Self::start(transport, config, Some((owner, handle))).await
    }

    async fn start(
        transport: Arc<dyn Transport>,
        config: ReplicatedMapConfig,
        owner: Option<(Arc<dyn MapOwner<K, V>>, OwnerHandle)>,
    ) -> Result<Arc<Self>, MapError> {
        let local = transport.local_member();
        let (owner, owner_handle) = match owner {
            Some((owner, handle)) => (Some(owner), Some(handle)),
            None => (None, None),
        };

        let map = Arc::new(Self {
            map_id: config.name.as_bytes().to_vec(),
            members: MapMembers::new(local.clone()),
            local,
            transport: transport.clone(),
            entries: DashMap::new(),
            state_lock: Mutex::new(()),
            owner,
            owner_handle,
            initialized: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            state_transferred: AtomicBool::new(false),
            config,
        });

        transport.register(map.clone());

        if let Err(e) = map.join().await {
            if map.config.terminate {
                tracing::error!("Unable to start map {}: {}", map.config.name, e);
                map.shutdown().await;
                return Err(MapError::Startup {
                    map: map.config.name.clone(),
                    reason: e.to_string(),
                });
            }
            tracing::warn!("Map {} started without a complete join: {}", map.config.name, e);
        }

        map.initialized.store(true, Ordering::SeqCst);
        tracing::info!(
            "Map {} initialized on {} with {} member(s)",
            map.config.name,
            map.local,
            map.members.len().await
        );
        Ok(map)
    }

    async fn join(&self) -> Result<(), MapError> {
        self.broadcast(MessageKind::Init, true).await?;
        self.transfer_state().await?;
        self.broadcast(MessageKind::Start, true).await?;
        Ok(())
    }

    /// Sends a control message to every transport member. With `rpc` the
    /// first reply is processed here and later ones arrive as left-overs.
    async fn broadcast(&self, kind: MessageKind, rpc: bool) -> Result<(), MapError> {
        let members = self.transport.members();
        if members.is_empty() {
            return Ok(());
        }
        let msg = MapMessage::control(&self.map_id, kind, self.local.clone());

        if !rpc {
            self.transport.send(&members, &msg).await?;
            return Ok(());
        }

        let replies = self
            .transport
            .send_request(&members, &msg, ReplyPolicy::First, self.config.rpc_timeout)
            .await?;
        if !replies.faulty.is_empty() {
            tracing::warn!("{:?} broadcast for map {} missed {:?}", kind, self.config.name, replies.faulty);
        }
        if replies.responses.is_empty() {
            tracing::warn!(
                "{:?} broadcast for map {} received 0 replies, probably no other node hosts it",
                kind,
                self.config.name
            );
        }
        for response in replies.responses {
            self.map_member_added(&response.source).await;
            self.handle_message(response.message, response.source).await;
        }
        Ok(())
    }

    /// Copies the entries of the first known map member into this map.
    ///
    /// Entries arrive as proxies (STATE) or full copies (STATE_COPY,
    /// `config.state_copy`). Runs under the state lock so that no backup
    /// audit interleaves with the incoming entries. Returns how many entries
    /// were applied.
    pub async fn transfer_state(&self) -> Result<usize, MapError> {
        let result = self.request_state().await;
        self.state_transferred.store(true, Ordering::SeqCst);
        result
    }

    async fn request_state(&self) -> Result<usize, MapError> {
        let Some(donor) = self.members.snapshot().await.into_iter().next() else {
            return Ok(0);
        };

        let kind = if self.config.state_copy {
            MessageKind::StateCopy
        } else {
            MessageKind::State
        };
        let msg = MapMessage::new(&self.map_id, kind);
        let replies = self
            .transport
            .send_request(std::slice::from_ref(&donor), &msg, ReplyPolicy::First, self.config.rpc_timeout)
            .await?;

        let Some(reply) = replies.first() else {
            tracing::warn!("Transferring state for map {} failed: no reply from {}", self.config.name, donor);
            return Ok(0);
        };
        let entries = reply.message.state_entries()?;

        let _guard = self.state_lock.lock().await;
        let mut applied = 0;
        for entry in &entries {
            match self.apply_entry_message(entry) {
                Ok(()) => applied += 1,
                Err(e) => tracing::warn!("Skipping transferred entry for map {}: {}", self.config.name, e),
            }
        }
        tracing::info!("Map {} received {} entries from {}", self.config.name, applied, donor);
        Ok(applied)
    }

    /// Serializes every local entry for a joining member. STATE ships
    /// proxies; STATE_COPY ships copies of every entry holding a value and
    /// proxies for the rest.
    pub(super) async fn state_reply(&self, copy: bool) -> Result<MapMessage, MapError> {
        let _guard = self.state_lock.lock().await;

        let mut list = Vec::with_capacity(self.entries.len());
        for entry in self.entries.iter() {
            let key = match encode(&entry.key) {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!("Skipping non-transmissible key {:?}: {}", entry.key, e);
                    continue;
                }
            };
            let value = match entry.value.as_ref() {
                Some(value) if copy => encode(value).ok(),
                _ => None,
            };
            let kind = if value.is_some() {
                MessageKind::Copy
            } else {
                MessageKind::Proxy
            };
            list.push(
                MapMessage::new(&self.map_id, kind)
                    .with_key(key)
                    .with_value(value)
                    .with_primary(entry.primary.clone())
                    .with_backups(entry.backup_nodes.clone()),
            );
        }
        MapMessage::state_reply(&self.map_id, &list)
    }

    /// Leaves the cluster: broadcasts STOP, unregisters from the transport
    /// and drops all local state. Idempotent.
    pub async fn shutdown(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.broadcast(MessageKind::Stop, false).await {
            tracing::debug!("Unable to announce shutdown of map {}: {}", self.config.name, e);
        }
        self.transport.unregister(&self.map_id);
        self.members.clear().await;
        self.entries.clear();
        tracing::info!("Map {} on {} shut down", self.config.name, self.local);
    }
}
