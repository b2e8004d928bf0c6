//! Transport Module
//!
//! The replicated map never talks to the network directly. It consumes a
//! [`Transport`] and registers itself with it as a [`MapListener`].
//!
//! ## Implementations
//! - **`memory`**: in-process network with awaited delivery and fault injection.
//! - **`http`**: axum server + reqwest client over a static peer list.

pub mod http;
pub mod memory;


use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::map::message::MapMessage;
use crate::membership::types::NodeId;

/// Errors reported by a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Some targets could not be reached.
    #[error("unreachable members: {0:?}")]
    Faulty(Vec<NodeId>),

    #[error("request timed out")]
    Timeout,

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("http error: {0}")]
    Http(String),

    /// The transport was shut down.
    #[error("transport closed")]
    Closed,
}

/// How many replies a request waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyPolicy {
    /// Return as soon as one target replied. Later replies are delivered to
    /// the requester as left-over messages.
    First,
    /// Wait for every target (bounded by the timeout).
    All,
}

/// A reply to a request, tagged with the member that produced it.
#[derive(Debug, Clone)]
pub struct Response {
    pub source: NodeId,
    pub message: MapMessage,
}

/// Result of a request/reply call.
///
/// Targets that answered are in `responses`; targets the transport could not
/// reach at all are reported in `faulty`. Targets that were reached but
/// stayed silent (no reply or timeout) appear in neither.
#[derive(Debug, Clone, Default)]
pub struct Replies {
    pub responses: Vec<Response>,
    pub faulty: Vec<NodeId>,
}

impl Replies {
    pub fn first(self) -> Option<Response> {
        self.responses.into_iter().next()
    }
}

/// Messaging primitives consumed by a replicated map.
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_member(&self) -> NodeId;

    /// Transport-level member snapshot, excluding the local member.
    fn members(&self) -> Vec<NodeId>;

    /// Fire-and-forget delivery to every target.
    async fn send(&self, targets: &[NodeId], msg: &MapMessage) -> Result<(), TransportError>;

    /// Request/reply to `targets`, bounded by `timeout`.
    async fn send_request(
        &self,
        targets: &[NodeId],
        msg: &MapMessage,
        policy: ReplyPolicy,
        timeout: Duration,
    ) -> Result<Replies, TransportError>;

    /// Routes inbound messages and membership events to `listener`.
    fn register(&self, listener: Arc<dyn MapListener>);

    fn unregister(&self, map_id: &[u8]);
}

/// Callbacks a transport delivers into a replicated map.
#[async_trait]
pub trait MapListener: Send + Sync {
    fn map_id(&self) -> &[u8];

    /// `true` if the message belongs to this listener.
    fn accept(&self, msg: &MapMessage, sender: &NodeId) -> bool;

    async fn on_message(&self, msg: MapMessage, sender: NodeId);

    /// A reply that arrived after a FIRST request was already satisfied.
    async fn on_left_over_message(&self, msg: MapMessage, sender: NodeId);

    /// Synchronous responder for request/reply traffic.
    async fn on_request(&self, msg: MapMessage, sender: NodeId) -> Option<MapMessage>;

    async fn on_member_added(&self, member: NodeId);

    async fn on_member_removed(&self, member: NodeId);

    async fn on_heartbeat(&self);
}
