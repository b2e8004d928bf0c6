use serde::{Serialize, de::DeserializeOwned};
use std::any::Any;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

/// Type-erased handle to the object that owns a map's values.
///
/// Values receive it through [`Replicable::set_owner`] and may downcast it to
/// the concrete owner type they expect.
pub type OwnerHandle = Arc<dyn Any + Send + Sync>;

/// Anything usable as a replicated map key.
pub trait MapKey: Clone + Hash + Eq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> MapKey for T where T: Clone + Hash + Eq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Anything that can be stored in a replicated map.
///
/// Plain values only need an empty impl and are always replicated in full.
/// Values that track their own changes override the accessor to expose
/// the [`Replicable`] capability.
pub trait MapValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn as_replicable_mut(&mut self) -> Option<&mut dyn Replicable> {
        None
    }
}

/// Optional capability of a value that can replicate incrementally.
///
/// The map calls the mutating hooks while holding the entry's write guard,
/// which is the value lock: diff computation, application and reset never
/// interleave with each other or with [`crate::map::replicated::ReplicatedMap::update`].
pub trait Replicable: Send + Sync {
    /// The value changed since the last replication.
    fn is_dirty(&self) -> bool;

    /// The value can express its changes as a delta.
    fn is_diffable(&self) -> bool;

    /// Delta capturing the changes since the last [`Replicable::reset_diff`].
    fn diff(&self) -> anyhow::Result<Vec<u8>>;

    /// Applies a delta produced by [`Replicable::diff`] on another node.
    fn apply_diff(&mut self, diff: &[u8]) -> anyhow::Result<()>;

    /// Clears the dirty state after a delta was shipped.
    fn reset_diff(&mut self);

    /// Called on backups when the primary touched the value without changing it.
    fn access_entry(&mut self) {}

    /// The value wants its backups touched even when nothing changed.
    fn is_access_replicate(&self) -> bool {
        false
    }

    fn set_owner(&mut self, _owner: Option<OwnerHandle>) {}
}

/// Callback for the logical owner of a map's values.
pub trait MapOwner<K, V>: Send + Sync + 'static {
    /// `key` was promoted to primary on this node, either because a reader
    /// pulled it here or because the previous primary left the cluster.
    fn object_made_primary(&self, key: &K, value: &V);
}

macro_rules! plain_map_value {
    ($($ty:ty),* $(,)?) => {
        $(impl MapValue for $ty {})*
    };
}

plain_map_value!(
    String,
    Vec<u8>,
    bool,
    i32,
    i64,
    u32,
    u64,
    usize,
);
