//! In-process transport.
//!
//! [`MemoryNetwork`] connects any number of [`MemoryTransport`]s living in the
//! same process. Delivery is awaited inline, so a `send` returns only after
//! every receiver has processed the message. That keeps multi-node scenarios
//! deterministic in tests.
//!
//! Fault injection:
//! - [`MemoryNetwork::leave`] kills a node and raises `on_member_removed` on the others.
//! - [`MemoryNetwork::partition`] silently blocks traffic between two nodes
//!   without any membership event, so only pings notice it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::{MapListener, Replies, ReplyPolicy, Response, Transport, TransportError};
use crate::map::message::MapMessage;
use crate::membership::types::NodeId;

struct NodeSlot {
    alive: AtomicBool,
    listeners: RwLock<Vec<Arc<dyn MapListener>>>,
}

impl NodeSlot {
    fn listeners(&self) -> Vec<Arc<dyn MapListener>> {
        match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Shared in-process network.
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: DashMap<NodeId, Arc<NodeSlot>>,
    /// Directed (source, target) pairs that are blocked.
    partitions: DashSet<(NodeId, NodeId)>,
    sent: AtomicU64,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds (or revives) `id` and announces it to every other live node.
    pub async fn join(self: &Arc<Self>, id: NodeId) -> Arc<MemoryTransport> {
        let slot = self
            .nodes
            .entry(id.clone())
            .or_insert_with(|| {
                Arc::new(NodeSlot {
                    alive: AtomicBool::new(true),
                    listeners: RwLock::new(Vec::new()),
                })
            })
            .clone();
        slot.alive.store(true, Ordering::SeqCst);

        for other in self.live_nodes_except(&id) {
            for listener in self.listeners_of(&other) {
                listener.on_member_added(id.clone()).await;
            }
        }

        Arc::new(MemoryTransport {
            id,
            network: self.clone(),
        })
    }

    /// Kills `id` and announces its departure to every other live node.
    pub async fn leave(&self, id: &NodeId) {
        match self.nodes.get(id) {
            Some(slot) => slot.alive.store(false, Ordering::SeqCst),
            None => return,
        }

        for other in self.live_nodes_except(id) {
            for listener in self.listeners_of(&other) {
                listener.on_member_removed(id.clone()).await;
            }
        }
    }

    /// Blocks traffic in both directions between `a` and `b`.
    pub fn partition(&self, a: &NodeId, b: &NodeId) {
        self.partitions.insert((a.clone(), b.clone()));
        self.partitions.insert((b.clone(), a.clone()));
    }

    /// Restores traffic in both directions between `a` and `b`.
    pub fn heal(&self, a: &NodeId, b: &NodeId) {
        self.partitions.remove(&(a.clone(), b.clone()));
        self.partitions.remove(&(b.clone(), a.clone()));
    }

    /// Fires `on_heartbeat` on every listener of every live node.
    pub async fn heartbeat(&self) {
        for id in self.live_nodes() {
            for listener in self.listeners_of(&id) {
                listener.on_heartbeat().await;
            }
        }
    }

    /// Number of messages and requests handed to the network so far.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    fn is_alive(&self, id: &NodeId) -> bool {
        self.nodes
            .get(id)
            .map(|slot| slot.alive.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn reachable(&self, from: &NodeId, to: &NodeId) -> bool {
        self.is_alive(to) && !self.partitions.contains(&(from.clone(), to.clone()))
    }

    fn live_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|slot| slot.value().alive.load(Ordering::SeqCst))
            .map(|slot| slot.key().clone())
            .collect();
        nodes.sort();
        nodes
    }

    fn live_nodes_except(&self, id: &NodeId) -> Vec<NodeId> {
        self.live_nodes().into_iter().filter(|node| node != id).collect()
    }

    fn listeners_of(&self, id: &NodeId) -> Vec<Arc<dyn MapListener>> {
        self.nodes
            .get(id)
            .map(|slot| slot.listeners())
            .unwrap_or_default()
    }

    fn accepting(&self, target: &NodeId, msg: &MapMessage, from: &NodeId) -> Vec<Arc<dyn MapListener>> {
        self.listeners_of(target)
            .into_iter()
            .filter(|listener| listener.accept(msg, from))
            .collect()
    }
}

/// One node's handle onto a [`MemoryNetwork`].
pub struct MemoryTransport {
    id: NodeId,
    network: Arc<MemoryNetwork>,
}

impl MemoryTransport {
    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }

    /// Splits `targets` into reachable members and faulty ones.
    fn split_targets(&self, targets: &[NodeId]) -> (Vec<NodeId>, Vec<NodeId>) {
        targets
            .iter()
            .filter(|target| **target != self.id)
            .cloned()
            .partition(|target| self.network.reachable(&self.id, target))
    }

    fn deliver_left_overs(&self, mut pending: JoinSet<Option<Response>>) {
        let network = self.network.clone();
        let local = self.id.clone();
        tokio::spawn(async move {
            while let Some(joined) = pending.join_next().await {
                let Ok(Some(response)) = joined else { continue };
                for listener in network.accepting(&local, &response.message, &response.source) {
                    listener
                        .on_left_over_message(response.message.clone(), response.source.clone())
                        .await;
                }
            }
        });
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_member(&self) -> NodeId {
        self.id.clone()
    }

    fn members(&self) -> Vec<NodeId> {
        self.network.live_nodes_except(&self.id)
    }

    async fn send(&self, targets: &[NodeId], msg: &MapMessage) -> Result<(), TransportError> {
        if !self.network.is_alive(&self.id) {
            return Err(TransportError::Closed);
        }
        let (reachable, faulty) = self.split_targets(targets);

        for target in reachable {
            self.network.sent.fetch_add(1, Ordering::SeqCst);
            for listener in self.network.accepting(&target, msg, &self.id) {
                listener.on_message(msg.clone(), self.id.clone()).await;
            }
        }

        if faulty.is_empty() {
            Ok(())
        } else {
            debug!("send to unreachable members {:?}", faulty);
            Err(TransportError::Faulty(faulty))
        }
    }

    async fn send_request(
        &self,
        targets: &[NodeId],
        msg: &MapMessage,
        policy: ReplyPolicy,
        timeout: Duration,
    ) -> Result<Replies, TransportError> {
        if !self.network.is_alive(&self.id) {
            return Err(TransportError::Closed);
        }
        let (reachable, faulty) = self.split_targets(targets);

        let mut pending: JoinSet<Option<Response>> = JoinSet::new();
        for target in reachable {
            self.network.sent.fetch_add(1, Ordering::SeqCst);
            let listeners = self.network.accepting(&target, msg, &self.id);
            let request = msg.clone();
            let from = self.id.clone();
            pending.spawn(async move {
                let answer = async {
                    for listener in listeners {
                        if let Some(reply) = listener.on_request(request.clone(), from.clone()).await {
                            return Some(reply);
                        }
                    }
                    None
                };
                match tokio::time::timeout(timeout, answer).await {
                    Ok(Some(message)) => Some(Response {
                        source: target,
                        message,
                    }),
                    Ok(None) => None,
                    Err(_) => {
                        warn!("request to {} timed out", target);
                        None
                    }
                }
            });
        }

        let mut responses = Vec::new();
        while let Some(joined) = pending.join_next().await {
            if let Ok(Some(response)) = joined {
                responses.push(response);
                if policy == ReplyPolicy::First {
                    break;
                }
            }
        }
        if !pending.is_empty() {
            self.deliver_left_overs(pending);
        }

        if !faulty.is_empty() {
            debug!("request to unreachable members {:?}", faulty);
        }
        Ok(Replies { responses, faulty })
    }

    fn register(&self, listener: Arc<dyn MapListener>) {
        if let Some(slot) = self.network.nodes.get(&self.id) {
            let mut listeners = match slot.listeners.write() {
                Ok(listeners) => listeners,
                Err(poisoned) => poisoned.into_inner(),
            };
            listeners.retain(|existing| existing.map_id() != listener.map_id());
            listeners.push(listener);
        }
    }

    fn unregister(&self, map_id: &[u8]) {
        if let Some(slot) = self.network.nodes.get(&self.id) {
            let mut listeners = match slot.listeners.write() {
                Ok(listeners) => listeners,
                Err(poisoned) => poisoned.into_inner(),
            };
            listeners.retain(|existing| existing.map_id() != map_id);
        }
    }
}
