//! Client Protocol
//!
//! Endpoints and Data Transfer Objects (DTOs) of the client-facing JSON API.

use serde::{Deserialize, Serialize};

// --- API Endpoints ---

/// Public endpoint for writes.
pub const ENDPOINT_PUT: &str = "/put";
/// Public endpoint for reads. Reading a key makes the serving node its primary.
pub const ENDPOINT_GET: &str = "/get";
/// Public endpoint for deletes.
pub const ENDPOINT_REMOVE: &str = "/remove";
/// Map statistics of the serving node.
pub const ENDPOINT_STATS: &str = "/stats";

// --- Data Transfer Objects ---

fn default_notify() -> bool {
    true
}

/// Client request for writing data.
#[derive(Debug, Serialize, Deserialize)]
pub struct PutRequest {
    /// The data key.
    pub key: String,
    /// The serialized JSON string of the value.
    pub value_json: String,
    /// Publish the entry to the other members. Defaults to `true`.
    #[serde(default = "default_notify")]
    pub notify: bool,
}

/// Acknowledgment for writes and deletes.
#[derive(Debug, Serialize, Deserialize)]
pub struct PutResponse {
    pub success: bool,
    /// The value replaced or removed, serialized as a JSON string.
    pub previous_json: Option<String>,
}

/// Response for data retrieval.
#[derive(Debug, Serialize, Deserialize)]
pub struct GetResponse {
    /// `None` indicates the key does not exist anywhere reachable.
    pub value_json: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub map_name: String,
    pub local_member: String,
    pub state: String,
    pub members: Vec<String>,
    /// Entries held as primary or backup.
    pub size: usize,
    /// All entries, proxies included.
    pub size_full: usize,
}
