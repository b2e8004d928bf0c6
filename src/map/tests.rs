//! Replicated Map Tests
//!
//! Multi-node scenarios run on the in-process network; replication edge cases
//! run against a stub transport that records what the map sends.
//!
//! ## Test Scopes
//! - **Data Structures**: entry roles and message helpers.
//! - **Client Operations**: put/get/remove on a single node and across nodes.
//! - **Placement**: lazy backup selection, full copies, retries.
//! - **Replication**: diff/full/access precedence and inbound error handling.
//! - **Membership**: join state transfer, arrival audit, departures, ping.
//! - **Lifecycle**: startup failure policy and shutdown.

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    use crate::map::config::{ReplicatedMapConfig, ReplicationStrategy};
    use crate::map::entry::{MapEntry, Role};
    use crate::map::error::MapError;
    use crate::map::message::{MapMessage, MessageKind, encode};
    use crate::map::replicated::{MapState, ReplicatedMap};
    use crate::map::value::{MapOwner, MapValue, OwnerHandle, Replicable};
    use crate::membership::types::NodeId;
    use crate::transport::memory::{MemoryNetwork, MemoryTransport};
    use crate::transport::{MapListener, Replies, ReplyPolicy, Transport, TransportError};

    // ============================================================
    // FIXTURES
    // ============================================================

    /// Counter that can replicate as a delta. The skipped fields are local
    /// bookkeeping and never travel.
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Counter {
        total: i64,
        diffable: bool,
        access_replicate: bool,
        #[serde(skip)]
        pending: i64,
        #[serde(skip)]
        diffs_applied: u32,
        #[serde(skip)]
        accessed: u32,
        #[serde(skip)]
        has_owner: bool,
    }

    impl Counter {
        fn diffable(total: i64) -> Self {
            Self {
                total,
                diffable: true,
                ..Self::default()
            }
        }

        fn plain(total: i64) -> Self {
            Self {
                total,
                ..Self::default()
            }
        }

        fn add(&mut self, n: i64) {
            self.total += n;
            self.pending += n;
        }
    }

    impl MapValue for Counter {
        fn as_replicable_mut(&mut self) -> Option<&mut dyn Replicable> {
            Some(self)
        }
    }

    impl Replicable for Counter {
        fn is_dirty(&self) -> bool {
            self.pending != 0
        }

        fn is_diffable(&self) -> bool {
            self.diffable
        }

        fn diff(&self) -> anyhow::Result<Vec<u8>> {
            Ok(bincode::serialize(&self.pending)?)
        }

        fn apply_diff(&mut self, diff: &[u8]) -> anyhow::Result<()> {
            let delta: i64 = bincode::deserialize(diff)?;
            self.total += delta;
            self.diffs_applied += 1;
            Ok(())
        }

        fn reset_diff(&mut self) {
            self.pending = 0;
        }

        fn access_entry(&mut self) {
            self.accessed += 1;
        }

        fn is_access_replicate(&self) -> bool {
            self.access_replicate
        }

        fn set_owner(&mut self, owner: Option<OwnerHandle>) {
            self.has_owner = owner.is_some();
        }
    }

    #[derive(Default)]
    struct RecordingOwner {
        promoted: Mutex<Vec<String>>,
    }

    impl<V> MapOwner<String, V> for RecordingOwner {
        fn object_made_primary(&self, key: &String, _value: &V) {
            self.promoted.lock().unwrap().push(key.clone());
        }
    }

    /// Transport double: a fixed member list, every send recorded, requests
    /// either unanswered or failing.
    struct StubTransport {
        local: NodeId,
        members: Vec<NodeId>,
        fail_requests: bool,
        sent: Mutex<Vec<(Vec<NodeId>, MapMessage)>>,
        registered: Mutex<Vec<Vec<u8>>>,
    }

    impl StubTransport {
        fn new(members: &[&str], fail_requests: bool) -> Arc<Self> {
            Arc::new(Self {
                local: NodeId::from("local"),
                members: members.iter().map(|m| NodeId::from(*m)).collect(),
                fail_requests,
                sent: Mutex::new(Vec::new()),
                registered: Mutex::new(Vec::new()),
            })
        }

        fn take_sent(&self) -> Vec<(Vec<NodeId>, MapMessage)> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        fn local_member(&self) -> NodeId {
            self.local.clone()
        }

        fn members(&self) -> Vec<NodeId> {
            self.members.clone()
        }

        async fn send(&self, targets: &[NodeId], msg: &MapMessage) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push((targets.to_vec(), msg.clone()));
            Ok(())
        }

        async fn send_request(
            &self,
            _targets: &[NodeId],
            _msg: &MapMessage,
            _policy: ReplyPolicy,
            _timeout: Duration,
        ) -> Result<Replies, TransportError> {
            if self.fail_requests {
                Err(TransportError::Closed)
            } else {
                Ok(Replies::default())
            }
        }

        fn register(&self, listener: Arc<dyn MapListener>) {
            self.registered.lock().unwrap().push(listener.map_id().to_vec());
        }

        fn unregister(&self, map_id: &[u8]) {
            self.registered.lock().unwrap().retain(|id| id != map_id);
        }
    }

    fn id(name: &str) -> NodeId {
        NodeId::from(name)
    }

    fn key(name: &str) -> String {
        name.to_string()
    }

    fn config() -> ReplicatedMapConfig {
        ReplicatedMapConfig::test_config("sessions")
    }

    /// Lets left-over replies and spawned deliveries finish.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    async fn start_node<V: MapValue>(
        network: &Arc<MemoryNetwork>,
        name: &str,
        config: ReplicatedMapConfig,
    ) -> (Arc<MemoryTransport>, Arc<ReplicatedMap<String, V>>) {
        let transport = network.join(id(name)).await;
        let map = ReplicatedMap::new(transport.clone(), config)
            .await
            .expect("map should start");
        (transport, map)
    }

    async fn cluster<V: MapValue>(names: &[&str], config: ReplicatedMapConfig) -> (Arc<MemoryNetwork>, Vec<Arc<ReplicatedMap<String, V>>>) {
        let network = MemoryNetwork::new();
        let mut maps = Vec::new();
        for name in names {
            let (_, map) = start_node(&network, name, config.clone()).await;
            maps.push(map);
        }
        settle().await;
        (network, maps)
    }

    fn role_of<V: MapValue>(map: &ReplicatedMap<String, V>, k: &str) -> Option<Role> {
        map.get_entry(&key(k)).map(|entry| entry.role())
    }

    async fn stub_map(strategy: ReplicationStrategy) -> (Arc<StubTransport>, Arc<ReplicatedMap<String, Counter>>) {
        let stub = StubTransport::new(&["peer"], false);
        let map = ReplicatedMap::new(stub.clone(), config().with_strategy(strategy))
            .await
            .expect("map should start");
        map.map_member_added(&id("peer")).await;
        stub.take_sent();
        (stub, map)
    }

    // ============================================================
    // DATA STRUCTURE TESTS
    // ============================================================

    #[test]
    fn test_entry_roles_are_exclusive() {
        let mut entry: MapEntry<String, String> = MapEntry::primary(key("k"), "v".into(), id("a"));
        assert_eq!(entry.role(), Role::Primary);

        entry.set_backup(true);
        assert_eq!(entry.role(), Role::Backup);

        entry.set_proxy(true);
        assert!(entry.is_proxy());
        assert!(!entry.is_backup(), "Proxy must clear the backup flag");
        assert!(!entry.is_active());

        entry.make_primary(id("b"));
        assert!(entry.is_primary());
        assert_eq!(entry.primary, Some(id("b")));
    }

    #[test]
    fn test_sole_backup() {
        let mut entry: MapEntry<String, String> = MapEntry::remote(key("k"), None);
        entry.backup_nodes = vec![id("b")];
        assert!(entry.sole_backup_is(&id("b")));

        entry.backup_nodes.push(id("c"));
        assert!(!entry.sole_backup_is(&id("b")));
    }

    #[test]
    fn test_message_without_key_is_rejected() {
        let msg = MapMessage::new(b"m", MessageKind::Backup);
        let result: Result<String, MapError> = msg.decode_key();
        assert!(matches!(result, Err(MapError::MissingField("key"))));
    }

    #[test]
    fn test_state_bundle_preserves_entries() {
        let entries = vec![
            MapMessage::new(b"m", MessageKind::Proxy).with_key(encode("a").unwrap()),
            MapMessage::new(b"m", MessageKind::Proxy).with_key(encode("b").unwrap()),
        ];
        let reply = MapMessage::state_reply(b"m", &entries).unwrap();

        assert_eq!(reply.kind, MessageKind::State);
        assert_eq!(reply.state_entries().unwrap(), entries);
    }

    // ============================================================
    // SINGLE NODE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_single_node_put_get() {
        let (_network, maps) = cluster::<String>(&["a"], config()).await;
        let a = &maps[0];

        assert_eq!(a.put(key("k"), "v1".into(), true).await.unwrap(), None);
        assert_eq!(a.get(&key("k")).await, Some("v1".to_string()));
        assert!(a.contains_key(&key("k")));
        assert_eq!(a.size(), 1);
        assert_eq!(a.keys(), vec![key("k")]);
        assert!(a.get_entry(&key("k")).unwrap().backup_nodes.is_empty());
    }

    #[tokio::test]
    async fn test_primary_get_sends_nothing() {
        let (network, maps) = cluster::<String>(&["a"], config()).await;
        let a = &maps[0];
        a.put(key("k"), "v".into(), true).await.unwrap();

        let before = network.sent_count();
        assert_eq!(a.get(&key("k")).await, Some("v".to_string()));
        assert_eq!(network.sent_count(), before);
    }

    #[tokio::test]
    async fn test_primary_get_sends_nothing_with_peers() {
        let (network, maps) = cluster::<String>(&["a", "b", "c"], config()).await;
        let a = &maps[0];
        a.put(key("k"), "v".into(), true).await.unwrap();

        let before = network.sent_count();
        assert_eq!(a.get(&key("k")).await, Some("v".to_string()));
        assert_eq!(network.sent_count(), before);
        assert_eq!(role_of(a, "k"), Some(Role::Primary));
    }

    #[tokio::test]
    async fn test_put_replaces_and_returns_old_value() {
        let (_network, maps) = cluster::<String>(&["a"], config()).await;
        let a = &maps[0];

        a.put(key("k"), "v1".into(), true).await.unwrap();
        let old = a.put(key("k"), "v2".into(), true).await.unwrap();

        assert_eq!(old, Some("v1".to_string()));
        assert_eq!(a.get(&key("k")).await, Some("v2".to_string()));
        assert_eq!(a.size(), 1);
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let (_network, maps) = cluster::<String>(&["a"], config()).await;
        let a = &maps[0];

        a.put_all(vec![(key("x"), "1".into()), (key("y"), "2".into())]).await.unwrap();
        assert_eq!(a.remove(&key("x"), true).await.unwrap(), Some("1".to_string()));
        assert_eq!(a.remove(&key("x"), true).await.unwrap(), None);

        a.clear(false).await.unwrap();
        assert!(a.is_empty());
        assert_eq!(a.size_full(), 0);
    }

    #[tokio::test]
    async fn test_update_mutates_primary_in_place() {
        let (_network, maps) = cluster::<Counter>(&["a"], config()).await;
        let a = &maps[0];

        a.put(key("k"), Counter::plain(1), true).await.unwrap();
        let total = a.update(&key("k"), |counter| {
            counter.add(4);
            counter.total
        });

        assert_eq!(total, Some(5));
        assert_eq!(a.get(&key("k")).await.unwrap().total, 5);
        assert_eq!(a.update(&key("missing"), |counter| counter.total), None);
    }

    // ============================================================
    // PLACEMENT TESTS
    // ============================================================

    #[tokio::test]
    async fn test_put_publishes_backup_to_peer() {
        let (_network, maps) = cluster::<String>(&["a", "b"], config()).await;
        let (a, b) = (&maps[0], &maps[1]);

        a.put(key("k"), "v".into(), true).await.unwrap();

        let entry = b.get_entry(&key("k")).expect("peer should hold the key");
        assert_eq!(entry.role(), Role::Backup);
        assert_eq!(entry.value, Some("v".to_string()));
        assert_eq!(entry.primary, Some(id("a")));
        assert_eq!(a.get_entry(&key("k")).unwrap().backup_nodes, vec![id("b")]);
    }

    #[tokio::test]
    async fn test_put_without_notify_stays_local() {
        let (_network, maps) = cluster::<String>(&["a", "b"], config()).await;
        let (a, b) = (&maps[0], &maps[1]);

        a.put(key("k"), "v".into(), false).await.unwrap();

        assert!(b.get_entry(&key("k")).is_none());
        assert!(a.get_entry(&key("k")).unwrap().backup_nodes.is_empty());
    }

    #[tokio::test]
    async fn test_lazy_places_one_backup_and_proxies() {
        let (_network, maps) = cluster::<String>(&["a", "b", "c"], config()).await;
        let (a, b, c) = (&maps[0], &maps[1], &maps[2]);

        a.put(key("k1"), "v1".into(), true).await.unwrap();
        a.put(key("k2"), "v2".into(), true).await.unwrap();

        // Round robin over the sorted members [b, c].
        assert_eq!(role_of(b, "k1"), Some(Role::Backup));
        assert_eq!(role_of(c, "k1"), Some(Role::Proxy));
        assert_eq!(role_of(b, "k2"), Some(Role::Proxy));
        assert_eq!(role_of(c, "k2"), Some(Role::Backup));

        let proxy = c.get_entry(&key("k1")).unwrap();
        assert_eq!(proxy.primary, Some(id("a")));
        assert_eq!(proxy.backup_nodes, vec![id("b")]);
        assert!(proxy.value.is_none());

        for map in &maps {
            assert!(map.size() <= map.size_full());
        }
        assert_eq!(c.size(), 1);
        assert_eq!(c.size_full(), 2);
    }

    #[tokio::test]
    async fn test_lazy_skips_unreachable_backup_candidate() {
        let (network, maps) = cluster::<String>(&["a", "b", "c"], config()).await;
        let (a, c) = (&maps[0], &maps[2]);

        network.partition(&id("a"), &id("b"));
        a.put(key("k"), "v".into(), true).await.unwrap();

        assert_eq!(a.get_entry(&key("k")).unwrap().backup_nodes, vec![id("c")]);
        assert_eq!(role_of(c, "k"), Some(Role::Backup));
    }

    #[tokio::test]
    async fn test_full_strategy_copies_everywhere() {
        let full = config().with_strategy(ReplicationStrategy::Full);
        let (_network, maps) = cluster::<String>(&["a", "b", "c"], full).await;
        let (a, b, c) = (&maps[0], &maps[1], &maps[2]);

        a.put(key("k"), "v".into(), true).await.unwrap();

        assert_eq!(a.get_entry(&key("k")).unwrap().backup_nodes, vec![id("b"), id("c")]);
        for peer in [b, c] {
            let entry = peer.get_entry(&key("k")).unwrap();
            // A full copy is neither backup nor proxy.
            assert_eq!(entry.role(), Role::Primary);
            assert_eq!(entry.value, Some("v".to_string()));
            assert_eq!(entry.primary, Some(id("a")));
            assert_eq!(peer.size(), 1);
        }
    }

    #[tokio::test]
    async fn test_remove_with_notify_reaches_every_member() {
        let (_network, maps) = cluster::<String>(&["a", "b", "c"], config()).await;
        let a = &maps[0];

        a.put(key("k"), "v".into(), true).await.unwrap();
        a.remove(&key("k"), true).await.unwrap();

        for map in &maps {
            assert!(map.get_entry(&key("k")).is_none(), "{} still holds k", map.local_member());
        }
    }

    // ============================================================
    // GET / PROMOTION TESTS
    // ============================================================

    #[tokio::test]
    async fn test_get_on_proxy_promotes_and_leaves_single_primary() {
        let network = MemoryNetwork::new();
        let (_, a) = start_node::<String>(&network, "a", config()).await;
        let (_, b) = start_node::<String>(&network, "b", config()).await;
        let owner = Arc::new(RecordingOwner::default());
        let c_transport = network.join(id("c")).await;
        let c = ReplicatedMap::<String, String>::with_owner(c_transport, config(), owner.clone())
            .await
            .unwrap();
        settle().await;

        a.put(key("k"), "v".into(), true).await.unwrap();
        assert_eq!(role_of(&c, "k"), Some(Role::Proxy));

        assert_eq!(c.get(&key("k")).await, Some("v".to_string()));

        assert_eq!(role_of(&c, "k"), Some(Role::Primary));
        let primaries = [role_of(&a, "k"), role_of(&b, "k"), role_of(&c, "k")]
            .iter()
            .filter(|role| **role == Some(Role::Primary))
            .count();
        assert_eq!(primaries, 1, "Exactly one node may be primary after promotion");

        // The old primary and the old backup both point at the new primary.
        for stale in [&a, &b] {
            assert_eq!(stale.get_entry(&key("k")).unwrap().primary, Some(id("c")));
        }
        let new_backups = c.get_entry(&key("k")).unwrap().backup_nodes;
        assert_eq!(new_backups.len(), 1);
        assert_eq!(*owner.promoted.lock().unwrap(), vec![key("k")]);
    }

    #[tokio::test]
    async fn test_get_on_backup_promotes_without_retrieve() {
        let (_network, maps) = cluster::<String>(&["a", "b"], config()).await;
        let (a, b) = (&maps[0], &maps[1]);

        a.put(key("k"), "v".into(), true).await.unwrap();
        assert_eq!(b.get(&key("k")).await, Some("v".to_string()));

        assert_eq!(role_of(b, "k"), Some(Role::Primary));
        assert_eq!(role_of(a, "k"), Some(Role::Backup));
        assert_eq!(a.get_entry(&key("k")).unwrap().primary, Some(id("b")));
    }

    #[tokio::test]
    async fn test_get_on_proxy_without_reachable_backup() {
        let (network, maps) = cluster::<String>(&["a", "b", "c"], config()).await;
        let (a, c) = (&maps[0], &maps[2]);
        a.put(key("k"), "v".into(), true).await.unwrap();
        assert_eq!(c.get_entry(&key("k")).unwrap().backup_nodes, vec![id("b")]);

        network.partition(&id("c"), &id("b"));

        assert_eq!(c.get(&key("k")).await, None);
        let proxy = c.get_entry(&key("k")).unwrap();
        assert_eq!(proxy.role(), Role::Proxy);
        assert_eq!(proxy.primary, Some(id("a")));
        assert_eq!(proxy.backup_nodes, vec![id("b")]);
        assert!(proxy.value.is_none());
        assert_eq!(role_of(a, "k"), Some(Role::Primary));
    }

    #[tokio::test]
    async fn test_get_missing_key() {
        let (_network, maps) = cluster::<String>(&["a", "b"], config()).await;
        assert_eq!(maps[1].get(&key("nope")).await, None);
    }

    // ============================================================
    // REPLICATION PRECEDENCE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_replicate_dirty_diffable_sends_diff() {
        let (stub, map) = stub_map(ReplicationStrategy::Lazy).await;
        map.put(key("k"), Counter::diffable(1), true).await.unwrap();
        stub.take_sent();

        map.update(&key("k"), |counter| counter.add(2));
        map.replicate(&key("k"), false).await;

        let sent = stub.take_sent();
        assert_eq!(sent.len(), 1);
        let (targets, msg) = &sent[0];
        assert_eq!(targets, &vec![id("peer")]);
        assert_eq!(msg.kind, MessageKind::Backup);
        assert!(msg.diff);
        assert!(msg.value.is_none());
        assert!(!map.get_entry(&key("k")).unwrap().value.unwrap().is_dirty());
    }

    #[tokio::test]
    async fn test_replicate_complete_diffable_sends_diff() {
        let (stub, map) = stub_map(ReplicationStrategy::Lazy).await;
        map.put(key("k"), Counter::diffable(1), true).await.unwrap();
        stub.take_sent();

        map.replicate(&key("k"), true).await;

        let sent = stub.take_sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.diff);
    }

    #[tokio::test]
    async fn test_replicate_dirty_non_diffable_sends_full_value() {
        let (stub, map) = stub_map(ReplicationStrategy::Lazy).await;
        map.put(key("k"), Counter::plain(1), true).await.unwrap();
        stub.take_sent();

        map.update(&key("k"), |counter| counter.add(2));
        map.replicate(&key("k"), false).await;

        let sent = stub.take_sent();
        assert_eq!(sent.len(), 1);
        let msg = &sent[0].1;
        assert_eq!(msg.kind, MessageKind::Backup);
        assert!(!msg.diff);
        let shipped: Counter = msg.decode_value().unwrap().unwrap();
        assert_eq!(shipped.total, 3);
    }

    #[tokio::test]
    async fn test_replicate_access_only() {
        let (stub, map) = stub_map(ReplicationStrategy::Lazy).await;
        let value = Counter {
            access_replicate: true,
            ..Counter::plain(1)
        };
        map.put(key("k"), value, true).await.unwrap();
        stub.take_sent();

        map.replicate(&key("k"), false).await;

        let sent = stub.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.kind, MessageKind::Access);
        assert!(sent[0].1.value.is_none());
    }

    #[tokio::test]
    async fn test_replicate_clean_value_sends_nothing() {
        let (stub, map) = stub_map(ReplicationStrategy::Lazy).await;
        map.put(key("k"), Counter::diffable(1), true).await.unwrap();
        stub.take_sent();

        map.replicate(&key("k"), false).await;
        map.replicate_all(false).await;

        assert!(stub.take_sent().is_empty());
    }

    #[tokio::test]
    async fn test_replicate_full_strategy_uses_copy() {
        let (stub, map) = stub_map(ReplicationStrategy::Full).await;
        map.put(key("k"), Counter::plain(1), true).await.unwrap();
        let publish = stub.take_sent();
        assert_eq!(publish[0].1.kind, MessageKind::Copy);

        map.replicate(&key("k"), true).await;

        let sent = stub.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.kind, MessageKind::Copy);
    }

    #[tokio::test]
    async fn test_replicate_skips_entries_without_backups() {
        let stub = StubTransport::new(&[], false);
        let map: Arc<ReplicatedMap<String, Counter>> = ReplicatedMap::new(stub.clone(), config()).await.unwrap();
        map.put(key("k"), Counter::plain(1), true).await.unwrap();

        map.replicate(&key("k"), true).await;

        assert!(stub.take_sent().is_empty());
    }

    // ============================================================
    // INBOUND REPLICATION TESTS
    // ============================================================

    #[tokio::test]
    async fn test_diff_applied_on_backup() {
        let (_network, maps) = cluster::<Counter>(&["a", "b"], config()).await;
        let (a, b) = (&maps[0], &maps[1]);

        a.put(key("k"), Counter::diffable(10), true).await.unwrap();
        a.update(&key("k"), |counter| counter.add(5));
        a.replicate(&key("k"), false).await;

        let replica = b.get_entry(&key("k")).unwrap().value.unwrap();
        assert_eq!(replica.total, 15);
        assert_eq!(replica.diffs_applied, 1);
    }

    #[tokio::test]
    async fn test_access_touches_backup() {
        let (_network, maps) = cluster::<Counter>(&["a", "b"], config()).await;
        let (a, b) = (&maps[0], &maps[1]);
        let value = Counter {
            access_replicate: true,
            ..Counter::plain(1)
        };

        a.put(key("k"), value, true).await.unwrap();
        a.replicate(&key("k"), false).await;

        assert_eq!(b.get_entry(&key("k")).unwrap().value.unwrap().accessed, 1);
    }

    #[tokio::test]
    async fn test_failed_diff_leaves_value_intact() {
        let network = MemoryNetwork::new();
        let (a_transport, a) = start_node::<Counter>(&network, "a", config()).await;
        let (_, b) = start_node::<Counter>(&network, "b", config()).await;

        a.put(key("k"), Counter::diffable(10), true).await.unwrap();

        let broken = MapMessage::new(a.map_id(), MessageKind::Backup)
            .with_key(encode(&key("k")).unwrap())
            .with_diff(vec![0xFF])
            .with_primary(Some(id("a")))
            .with_backups(vec![id("b")]);
        a_transport.send(&[id("b")], &broken).await.unwrap();

        let replica = b.get_entry(&key("k")).unwrap();
        assert_eq!(replica.value.as_ref().unwrap().total, 10);
        assert_eq!(replica.role(), Role::Backup);
    }

    #[tokio::test]
    async fn test_undecodable_value_is_dropped() {
        let network = MemoryNetwork::new();
        let (a_transport, a) = start_node::<String>(&network, "a", config()).await;
        let (_, b) = start_node::<String>(&network, "b", config()).await;

        let garbage = MapMessage::new(a.map_id(), MessageKind::Backup)
            .with_key(encode(&key("x")).unwrap())
            .with_value(Some(vec![1, 2]))
            .with_primary(Some(id("a")));
        a_transport.send(&[id("b")], &garbage).await.unwrap();

        assert!(b.get_entry(&key("x")).is_none());
        assert_eq!(b.size_full(), 0);
    }

    #[tokio::test]
    async fn test_maps_sharing_a_transport_are_isolated() {
        let network = MemoryNetwork::new();
        let a_transport = network.join(id("a")).await;
        let b_transport = network.join(id("b")).await;

        let sessions_a: Arc<ReplicatedMap<String, String>> =
            ReplicatedMap::new(a_transport.clone(), ReplicatedMapConfig::test_config("sessions")).await.unwrap();
        let carts_a: Arc<ReplicatedMap<String, u64>> =
            ReplicatedMap::new(a_transport, ReplicatedMapConfig::test_config("carts")).await.unwrap();
        let sessions_b: Arc<ReplicatedMap<String, String>> =
            ReplicatedMap::new(b_transport.clone(), ReplicatedMapConfig::test_config("sessions")).await.unwrap();
        let carts_b: Arc<ReplicatedMap<String, u64>> =
            ReplicatedMap::new(b_transport, ReplicatedMapConfig::test_config("carts")).await.unwrap();

        sessions_a.put(key("k"), "session".into(), true).await.unwrap();
        carts_a.put(key("k"), 3, true).await.unwrap();

        assert_eq!(
            sessions_b.get_entry(&key("k")).unwrap().value,
            Some("session".to_string())
        );
        assert_eq!(carts_b.get_entry(&key("k")).unwrap().value, Some(3));
    }

    #[tokio::test]
    async fn test_owner_handed_to_replicas() {
        let network = MemoryNetwork::new();
        let (_, a) = start_node::<Counter>(&network, "a", config()).await;
        let b_transport = network.join(id("b")).await;
        let b = ReplicatedMap::<String, Counter>::with_owner(b_transport, config(), Arc::new(RecordingOwner::default()))
            .await
            .unwrap();

        a.put(key("k"), Counter::plain(1), true).await.unwrap();

        assert!(b.get_entry(&key("k")).unwrap().value.unwrap().has_owner);
    }

    // ============================================================
    // JOIN / STATE TRANSFER TESTS
    // ============================================================

    #[tokio::test]
    async fn test_joiner_receives_state_as_proxies() {
        let (network, maps) = cluster::<String>(&["a", "b"], config()).await;
        let a = &maps[0];
        for i in 0..3 {
            a.put(format!("k{}", i), format!("v{}", i), true).await.unwrap();
        }

        let (_, c) = start_node::<String>(&network, "c", config()).await;
        settle().await;

        assert!(c.is_state_transferred());
        assert_eq!(c.size_full(), 3);
        assert_eq!(c.size(), 0);
        for i in 0..3 {
            assert_eq!(role_of(&c, &format!("k{}", i)), Some(Role::Proxy));
        }
        assert_eq!(c.get(&key("k1")).await, Some("v1".to_string()));
    }

    #[tokio::test]
    async fn test_joiner_receives_state_copy() {
        let (network, maps) = cluster::<String>(&["a", "b"], config()).await;
        let a = &maps[0];
        for i in 0..3 {
            a.put(format!("k{}", i), format!("v{}", i), true).await.unwrap();
        }

        let (_, c) = start_node::<String>(&network, "c", config().with_state_copy(true)).await;

        assert_eq!(c.size_full(), 3);
        assert_eq!(c.size(), 3);
        let entry = c.get_entry(&key("k2")).unwrap();
        assert_eq!(entry.value, Some("v2".to_string()));
    }

    #[tokio::test]
    async fn test_arrival_audit_backs_up_orphans() {
        let network = MemoryNetwork::new();
        let (_, a) = start_node::<String>(&network, "a", config()).await;
        a.put(key("k"), "v".into(), true).await.unwrap();
        assert!(a.get_entry(&key("k")).unwrap().backup_nodes.is_empty());

        let (_, b) = start_node::<String>(&network, "b", config()).await;

        assert_eq!(a.get_entry(&key("k")).unwrap().backup_nodes, vec![id("b")]);
        assert_eq!(role_of(&b, "k"), Some(Role::Backup));
        assert_eq!(a.map_members().await, vec![id("b")]);
        assert_eq!(b.map_members().await, vec![id("a")]);
    }

    // ============================================================
    // DEPARTURE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_backup_promoted_when_primary_leaves() {
        let (network, maps) = cluster::<String>(&["a", "b", "c"], config()).await;
        let (a, b, c) = (&maps[0], &maps[1], &maps[2]);
        a.put(key("k"), "v".into(), true).await.unwrap();

        network.leave(&id("a")).await;

        assert_eq!(role_of(b, "k"), Some(Role::Primary));
        assert_eq!(b.get_entry(&key("k")).unwrap().primary, Some(id("b")));
        let survivor = c.get_entry(&key("k")).unwrap();
        assert_eq!(survivor.primary, Some(id("b")));
        assert_eq!(survivor.role(), Role::Backup);
        assert_eq!(b.get_entry(&key("k")).unwrap().backup_nodes, vec![id("c")]);
    }

    #[tokio::test]
    async fn test_primary_republishes_when_backup_leaves() {
        let (network, maps) = cluster::<String>(&["a", "b", "c"], config()).await;
        let (a, c) = (&maps[0], &maps[2]);
        a.put(key("k"), "v".into(), true).await.unwrap();
        assert_eq!(a.get_entry(&key("k")).unwrap().backup_nodes, vec![id("b")]);

        network.leave(&id("b")).await;

        assert_eq!(a.get_entry(&key("k")).unwrap().backup_nodes, vec![id("c")]);
        assert_eq!(role_of(c, "k"), Some(Role::Backup));
        assert_eq!(c.get_entry(&key("k")).unwrap().value, Some("v".to_string()));
    }

    #[tokio::test]
    async fn test_orphaned_proxy_dropped() {
        let (_network, maps) = cluster::<String>(&["a", "b", "c"], config()).await;
        let (a, c) = (&maps[0], &maps[2]);
        a.put(key("k"), "v".into(), true).await.unwrap();
        assert_eq!(role_of(c, "k"), Some(Role::Proxy));

        c.member_disappeared(&id("a")).await;
        let proxy = c.get_entry(&key("k")).unwrap();
        assert!(proxy.primary.is_none());
        assert!(proxy.is_proxy());

        c.member_disappeared(&id("b")).await;
        assert!(c.get_entry(&key("k")).is_none());
    }

    #[tokio::test]
    async fn test_untracked_departure_is_ignored() {
        let (_network, maps) = cluster::<String>(&["a", "b"], config()).await;
        let (a, b) = (&maps[0], &maps[1]);
        a.put(key("k"), "v".into(), true).await.unwrap();

        b.member_disappeared(&id("ghost")).await;

        assert_eq!(role_of(b, "k"), Some(Role::Backup));
        assert_eq!(b.get_entry(&key("k")).unwrap().primary, Some(id("a")));
    }

    // ============================================================
    // PING TESTS
    // ============================================================

    #[tokio::test]
    async fn test_ping_detects_partition_and_recovers() {
        let (network, maps) = cluster::<String>(&["a", "b"], config()).await;
        let (a, b) = (&maps[0], &maps[1]);
        a.put(key("k"), "v".into(), true).await.unwrap();

        network.partition(&id("a"), &id("b"));
        b.ping(b.config().access_timeout).await.unwrap();

        assert!(b.map_members().await.is_empty());
        assert_eq!(role_of(b, "k"), Some(Role::Primary));

        network.heal(&id("a"), &id("b"));
        b.ping(b.config().access_timeout).await.unwrap();

        assert_eq!(b.map_members().await, vec![id("a")]);
        let rejoined = a.get_entry(&key("k")).unwrap();
        assert_eq!(rejoined.role(), Role::Backup);
        assert_eq!(rejoined.primary, Some(id("b")));
    }

    #[tokio::test]
    async fn test_ping_backs_up_primary_once_member_answers() {
        let (network, maps) = cluster::<String>(&["a", "b"], config()).await;
        let (a, b) = (&maps[0], &maps[1]);

        // b is already tracked but unreachable when the key is published.
        network.partition(&id("a"), &id("b"));
        a.put(key("k"), "v".into(), true).await.unwrap();
        assert!(a.get_entry(&key("k")).unwrap().backup_nodes.is_empty());
        assert_eq!(a.map_members().await, vec![id("b")]);

        network.heal(&id("a"), &id("b"));
        a.ping(a.config().access_timeout).await.unwrap();

        assert_eq!(a.get_entry(&key("k")).unwrap().backup_nodes, vec![id("b")]);
        assert_eq!(role_of(b, "k"), Some(Role::Backup));
        assert_eq!(b.get_entry(&key("k")).unwrap().primary, Some(id("a")));
    }

    #[tokio::test]
    async fn test_ping_expires_silent_member() {
        let network = MemoryNetwork::new();
        let (a_transport, a) = start_node::<String>(&network, "a", config()).await;
        let (_, b) = start_node::<String>(&network, "b", config()).await;
        assert_eq!(b.map_members().await, vec![id("a")]);

        // a stays on the network but stops answering for this map.
        a_transport.unregister(a.map_id());
        b.members.backdate(&id("a"), Duration::from_secs(1)).await;
        b.ping(Duration::from_millis(500)).await.unwrap();

        assert!(b.map_members().await.is_empty());
    }

    #[tokio::test]
    async fn test_ping_keeps_responsive_members() {
        let (_network, maps) = cluster::<String>(&["a", "b", "c"], config()).await;
        let a = &maps[0];

        a.members.backdate(&id("b"), Duration::from_secs(1)).await;
        a.ping(Duration::from_millis(500)).await.unwrap();

        assert_eq!(a.map_members().await, vec![id("b"), id("c")]);
    }

    // ============================================================
    // LIFECYCLE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_startup_failure_terminates() {
        let stub = StubTransport::new(&["ghost"], true);
        let result: Result<Arc<ReplicatedMap<String, String>>, MapError> =
            ReplicatedMap::new(stub.clone(), config().with_terminate(true)).await;

        assert!(matches!(result, Err(MapError::Startup { .. })));
        assert!(stub.registered.lock().unwrap().is_empty(), "Failed map must unregister");
        let sent = stub.take_sent();
        assert!(sent.iter().any(|(_, msg)| msg.kind == MessageKind::Stop));
    }

    #[tokio::test]
    async fn test_startup_failure_tolerated_without_terminate() {
        let stub = StubTransport::new(&["ghost"], true);
        let map: Arc<ReplicatedMap<String, String>> = ReplicatedMap::new(stub.clone(), config().with_terminate(false))
            .await
            .expect("startup failure should be tolerated");

        assert_eq!(map.state(), MapState::Initialized);
        assert_eq!(*stub.registered.lock().unwrap(), vec![b"sessions".to_vec()]);
    }

    #[tokio::test]
    async fn test_shutdown_hands_over_to_backup() {
        let (_network, maps) = cluster::<String>(&["a", "b"], config()).await;
        let (a, b) = (&maps[0], &maps[1]);
        a.put(key("k"), "v".into(), true).await.unwrap();

        a.shutdown().await;

        assert_eq!(a.state(), MapState::Destroyed);
        assert!(matches!(a.put(key("x"), "y".into(), true).await, Err(MapError::Destroyed)));
        assert_eq!(a.get(&key("k")).await, None);
        assert!(b.map_members().await.is_empty());
        assert_eq!(role_of(b, "k"), Some(Role::Primary));
        assert_eq!(b.get(&key("k")).await, Some("v".to_string()));
    }
}
