//! Replicated Map Wire Protocol
//!
//! Defines the [`MapMessage`] moved over the transport and the helpers used to
//! encode keys and values into it.
//!
//! Keys and values travel as bincode bytes so that maps with different key and
//! value types can share a single transport. Decoding happens inside the map
//! that accepted the message, which keeps a bad payload isolated to that one
//! message.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::membership::types::NodeId;

use super::error::MapError;

/// The kinds of message exchanged between replicated map instances.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Handshake/ping. The reply names the responder in `primary`.
    Init,
    /// Sender has finished joining and hosts the map.
    Start,
    /// Sender is leaving the map.
    Stop,
    /// Entry is now backed up on the receiver.
    Backup,
    /// Entry is fully copied to the receiver.
    Copy,
    /// Receiver only knows where the entry lives.
    Proxy,
    /// Keep-alive touch for an entry, no content.
    Access,
    Remove,
    /// Request for the current value of a key.
    Retrieve,
    /// Request for the whole map, entries sent as proxies.
    State,
    /// Request for the whole map, entries sent as copies.
    StateCopy,
}

/// A single replicated map message.
///
/// `map_id` is the routing tag: a transport delivers the message to every
/// registered map, and only the map whose id matches accepts it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MapMessage {
    pub map_id: Vec<u8>,
    pub kind: MessageKind,
    /// `true` when `diff_value` carries an incremental delta instead of `value`.
    pub diff: bool,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub diff_value: Option<Vec<u8>>,
    pub primary: Option<NodeId>,
    pub backup_nodes: Option<Vec<NodeId>>,
}

impl MapMessage {
    /// A message with only the routing tag and kind set.
    pub fn new(map_id: &[u8], kind: MessageKind) -> Self {
        Self {
            map_id: map_id.to_vec(),
            kind,
            diff: false,
            key: None,
            value: None,
            diff_value: None,
            primary: None,
            backup_nodes: None,
        }
    }

    /// Control message (INIT/START/STOP) naming `member` as the sender.
    pub fn control(map_id: &[u8], kind: MessageKind, member: NodeId) -> Self {
        Self::new(map_id, kind).with_primary(Some(member))
    }

    pub fn with_key(mut self, key: Vec<u8>) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_value(mut self, value: Option<Vec<u8>>) -> Self {
        self.value = value;
        self
    }

    pub fn with_diff(mut self, diff: Vec<u8>) -> Self {
        self.diff = true;
        self.diff_value = Some(diff);
        self
    }

    pub fn with_primary(mut self, primary: Option<NodeId>) -> Self {
        self.primary = primary;
        self
    }

    pub fn with_backups(mut self, backups: Vec<NodeId>) -> Self {
        self.backup_nodes = Some(backups);
        self
    }

    /// Builds the reply to a STATE/STATE_COPY request: the sub-messages are
    /// bundled into the reply's value.
    pub fn state_reply(map_id: &[u8], entries: &[MapMessage]) -> Result<Self, MapError> {
        let bundle = bincode::serialize(entries)?;
        Ok(Self::new(map_id, MessageKind::State).with_value(Some(bundle)))
    }

    /// Unpacks the sub-messages of a STATE reply.
    pub fn state_entries(&self) -> Result<Vec<MapMessage>, MapError> {
        match &self.value {
            Some(bundle) => Ok(bincode::deserialize(bundle)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn decode_key<K: DeserializeOwned>(&self) -> Result<K, MapError> {
        let bytes = self.key.as_deref().ok_or(MapError::MissingField("key"))?;
        decode(bytes)
    }

    pub fn decode_value<V: DeserializeOwned>(&self) -> Result<Option<V>, MapError> {
        self.value.as_deref().map(decode).transpose()
    }
}

pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, MapError> {
    Ok(bincode::serialize(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, MapError> {
    Ok(bincode::deserialize(bytes)?)
}
