use std::time::Duration;

/// How a primary spreads an entry to its peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationStrategy {
    /// One round-robin backup holds the value, every other member holds a proxy.
    Lazy,
    /// Every member holds a full copy.
    Full,
}

/// Configuration for a [`crate::map::replicated::ReplicatedMap`].
#[derive(Debug, Clone)]
pub struct ReplicatedMapConfig {
    /// Logical name of the map. Its bytes are the routing tag on the wire.
    pub name: String,
    /// Timeout for every request/reply call issued by the map.
    pub rpc_timeout: Duration,
    /// Members not heard from within this window are treated as departed by `heartbeat`.
    pub access_timeout: Duration,
    pub strategy: ReplicationStrategy,
    /// Request STATE_COPY instead of STATE when joining.
    pub state_copy: bool,
    /// Fail construction if the join handshake or state transfer fails.
    pub terminate: bool,
}

impl ReplicatedMapConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Create a config suitable for fast test execution.
    pub fn test_config(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rpc_timeout: Duration::from_millis(200),
            access_timeout: Duration::from_millis(500),
            strategy: ReplicationStrategy::Lazy,
            state_copy: false,
            terminate: false,
        }
    }

    pub fn with_strategy(mut self, strategy: ReplicationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_state_copy(mut self, state_copy: bool) -> Self {
        self.state_copy = state_copy;
        self
    }

    pub fn with_terminate(mut self, terminate: bool) -> Self {
        self.terminate = terminate;
        self
    }
}

impl Default for ReplicatedMapConfig {
    fn default() -> Self {
        Self {
            name: "replicated-map".to_string(),
            rpc_timeout: Duration::from_secs(15),
            access_timeout: Duration::from_secs(5),
            strategy: ReplicationStrategy::Lazy,
            state_copy: false,
            terminate: true,
        }
    }
}
