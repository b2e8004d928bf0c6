//! HTTP transport.
//!
//! Carries [`MapMessage`]s between nodes as bincode-encoded [`Envelope`]s over
//! plain HTTP: an axum [`Router`] receives, a shared `reqwest::Client` sends.
//!
//! The peer list is static. The embedding application calls
//! [`HttpTransport::add_peer`] / [`HttpTransport::remove_peer`] as nodes come
//! and go, and the transport turns those calls into membership callbacks.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::Extension;
use axum::http::StatusCode;
use axum::{Router, routing::post};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use super::{MapListener, Replies, ReplyPolicy, Response, Transport, TransportError};
use crate::map::message::MapMessage;
use crate::membership::types::NodeId;

/// Endpoint for fire-and-forget messages.
pub const ENDPOINT_MESSAGE: &str = "/cluster/message";
/// Endpoint for request/reply traffic. The body of the reply is a bincode
/// `Option<MapMessage>`.
pub const ENDPOINT_REQUEST: &str = "/cluster/request";

const SEND_TIMEOUT: Duration = Duration::from_millis(500);
const SEND_ATTEMPTS: usize = 3;

/// Wire wrapper naming the sending member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: NodeId,
    pub message: MapMessage,
}

/// Outcome of a single request to one peer.
enum Outcome {
    Reply(Response),
    Silent,
    Unreachable(NodeId),
}

pub struct HttpTransport {
    local: NodeId,
    peers: DashMap<NodeId, SocketAddr>,
    listeners: RwLock<Vec<Arc<dyn MapListener>>>,
    http_client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(local: NodeId, peers: impl IntoIterator<Item = (NodeId, SocketAddr)>) -> Arc<Self> {
        Arc::new(Self {
            local,
            peers: peers.into_iter().collect(),
            listeners: RwLock::new(Vec::new()),
            http_client: reqwest::Client::new(),
        })
    }

    /// Routes serving this transport's inbound endpoints.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route(ENDPOINT_MESSAGE, post(handle_message))
            .route(ENDPOINT_REQUEST, post(handle_request))
            .layer(Extension(self.clone()))
    }

    /// Adds a peer and raises `on_member_added` if it was not known.
    pub async fn add_peer(&self, id: NodeId, addr: SocketAddr) {
        if id == self.local {
            return;
        }
        if self.peers.insert(id.clone(), addr).is_none() {
            tracing::info!("Peer {} added at {}", id, addr);
            for listener in self.listeners() {
                listener.on_member_added(id.clone()).await;
            }
        }
    }

    /// Removes a peer and raises `on_member_removed` if it was known.
    pub async fn remove_peer(&self, id: &NodeId) {
        if self.peers.remove(id).is_some() {
            tracing::info!("Peer {} removed", id);
            for listener in self.listeners() {
                listener.on_member_removed(id.clone()).await;
            }
        }
    }

    /// Fires `on_heartbeat` on every registered listener.
    pub async fn heartbeat(&self) {
        for listener in self.listeners() {
            listener.on_heartbeat().await;
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn MapListener>> {
        match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn accepting(&self, msg: &MapMessage, sender: &NodeId) -> Vec<Arc<dyn MapListener>> {
        self.listeners()
            .into_iter()
            .filter(|listener| listener.accept(msg, sender))
            .collect()
    }

    async fn dispatch_message(&self, envelope: Envelope) {
        for listener in self.accepting(&envelope.message, &envelope.sender) {
            listener
                .on_message(envelope.message.clone(), envelope.sender.clone())
                .await;
        }
    }

    async fn dispatch_request(&self, envelope: Envelope) -> Option<MapMessage> {
        for listener in self.accepting(&envelope.message, &envelope.sender) {
            if let Some(reply) = listener
                .on_request(envelope.message.clone(), envelope.sender.clone())
                .await
            {
                return Some(reply);
            }
        }
        None
    }

    fn url(&self, target: &NodeId, endpoint: &str) -> Option<String> {
        self.peers
            .get(target)
            .map(|addr| format!("http://{}{}", *addr, endpoint))
    }

    fn envelope(&self, msg: &MapMessage) -> Result<Vec<u8>, TransportError> {
        Ok(bincode::serialize(&Envelope {
            sender: self.local.clone(),
            message: msg.clone(),
        })?)
    }

    fn deliver_left_overs(&self, mut pending: JoinSet<Outcome>) {
        let listeners = self.listeners();
        tokio::spawn(async move {
            while let Some(joined) = pending.join_next().await {
                let Ok(Outcome::Reply(response)) = joined else { continue };
                for listener in &listeners {
                    if listener.accept(&response.message, &response.source) {
                        listener
                            .on_left_over_message(response.message.clone(), response.source.clone())
                            .await;
                    }
                }
            }
        });
    }
}

async fn post_with_retry(
    client: &reqwest::Client,
    url: String,
    body: Vec<u8>,
    timeout: Duration,
    attempts: usize,
) -> Result<reqwest::Response, reqwest::Error> {
    let mut delay_ms = 150u64;
    let mut attempt = 0;

    loop {
        let response = client
            .post(url.clone())
            .header("content-type", "application/octet-stream")
            .body(body.clone())
            .timeout(timeout)
            .send()
            .await;

        match response {
            Ok(resp) => return Ok(resp),
            Err(e) => {
                attempt += 1;
                if attempt >= attempts || e.is_timeout() {
                    return Err(e);
                }
                let jitter = rand::random::<u64>() % 50;
                tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                delay_ms = (delay_ms * 2).min(1200);
            }
        }
    }
}

async fn request_one(
    client: reqwest::Client,
    target: NodeId,
    url: String,
    body: Vec<u8>,
    timeout: Duration,
) -> Outcome {
    let response = match post_with_retry(&client, url, body, timeout, 1).await {
        Ok(resp) => resp,
        Err(e) if e.is_timeout() => {
            tracing::warn!("Request to {} timed out", target);
            return Outcome::Silent;
        }
        Err(e) => {
            tracing::warn!("Request to {} failed: {}", target, e);
            return Outcome::Unreachable(target);
        }
    };

    if !response.status().is_success() {
        tracing::warn!("Request to {} failed: {}", target, response.status());
        return Outcome::Silent;
    }

    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!("Failed to read reply from {}: {}", target, e);
            return Outcome::Silent;
        }
    };

    match bincode::deserialize::<Option<MapMessage>>(&bytes) {
        Ok(Some(message)) => Outcome::Reply(Response {
            source: target,
            message,
        }),
        Ok(None) => Outcome::Silent,
        Err(e) => {
            tracing::warn!("Failed to deserialize reply from {}: {}", target, e);
            Outcome::Silent
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn local_member(&self) -> NodeId {
        self.local.clone()
    }

    fn members(&self) -> Vec<NodeId> {
        let mut members: Vec<NodeId> = self.peers.iter().map(|peer| peer.key().clone()).collect();
        members.sort();
        members
    }

    async fn send(&self, targets: &[NodeId], msg: &MapMessage) -> Result<(), TransportError> {
        let body = self.envelope(msg)?;
        let mut faulty = Vec::new();

        for target in targets.iter().filter(|target| **target != self.local) {
            let Some(url) = self.url(target, ENDPOINT_MESSAGE) else {
                faulty.push(target.clone());
                continue;
            };
            match post_with_retry(&self.http_client, url, body.clone(), SEND_TIMEOUT, SEND_ATTEMPTS).await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => {
                    tracing::warn!("Send to {} rejected: {}", target, resp.status());
                    faulty.push(target.clone());
                }
                Err(e) => {
                    tracing::warn!("Failed to send to {}: {}", target, e);
                    faulty.push(target.clone());
                }
            }
        }

        if faulty.is_empty() {
            Ok(())
        } else {
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
        let body = self.envelope(msg)?;
        let mut faulty = Vec::new();
        let mut pending: JoinSet<Outcome> = JoinSet::new();

        for target in targets.iter().filter(|target| **target != self.local) {
            let Some(url) = self.url(target, ENDPOINT_REQUEST) else {
                faulty.push(target.clone());
                continue;
            };
            pending.spawn(request_one(
                self.http_client.clone(),
                target.clone(),
                url,
                body.clone(),
                timeout,
            ));
        }

        let mut responses = Vec::new();
        while let Some(joined) = pending.join_next().await {
            match joined {
                Ok(Outcome::Reply(response)) => {
                    responses.push(response);
                    if policy == ReplyPolicy::First {
                        break;
                    }
                }
                Ok(Outcome::Unreachable(target)) => faulty.push(target),
                Ok(Outcome::Silent) => {}
                Err(e) => tracing::error!("Request task failed: {}", e),
            }
        }
        if !pending.is_empty() {
            self.deliver_left_overs(pending);
        }

        Ok(Replies { responses, faulty })
    }

    fn register(&self, listener: Arc<dyn MapListener>) {
        let mut listeners = match self.listeners.write() {
            Ok(listeners) => listeners,
            Err(poisoned) => poisoned.into_inner(),
        };
        listeners.retain(|existing| existing.map_id() != listener.map_id());
        listeners.push(listener);
    }

    fn unregister(&self, map_id: &[u8]) {
        let mut listeners = match self.listeners.write() {
            Ok(listeners) => listeners,
            Err(poisoned) => poisoned.into_inner(),
        };
        listeners.retain(|existing| existing.map_id() != map_id);
    }
}

pub async fn handle_message(
    Extension(transport): Extension<Arc<HttpTransport>>,
    body: Bytes,
) -> StatusCode {
    match bincode::deserialize::<Envelope>(&body) {
        Ok(envelope) => {
            transport.dispatch_message(envelope).await;
            StatusCode::OK
        }
        Err(e) => {
            tracing::warn!("Failed to deserialize message: {}", e);
            StatusCode::BAD_REQUEST
        }
    }
}

pub async fn handle_request(
    Extension(transport): Extension<Arc<HttpTransport>>,
    body: Bytes,
) -> (StatusCode, Vec<u8>) {
    let envelope = match bincode::deserialize::<Envelope>(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!("Failed to deserialize request: {}", e);
            return (StatusCode::BAD_REQUEST, Vec::new());
        }
    };

    let reply = transport.dispatch_request(envelope).await;
    match bincode::serialize(&reply) {
        Ok(bytes) => (StatusCode::OK, bytes),
        Err(e) => {
            tracing::error!("Failed to serialize reply: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Vec::new())
        }
    }
}
