use crate::membership::types::NodeId;

/// The role a node plays for a single key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Authoritative for the value.
    Primary,
    /// Holds a replica for fail-over.
    Backup,
    /// Knows where the value lives but holds no data.
    Proxy,
}

/// Per-key record held in a replicated map's local table.
///
/// The role is derived from the `backup`/`proxy` pair, and the setters keep
/// the two flags from ever being set together.
#[derive(Debug, Clone)]
pub struct MapEntry<K, V> {
    pub key: K,
    pub value: Option<V>,
    backup: bool,
    proxy: bool,
    pub primary: Option<NodeId>,
    pub backup_nodes: Vec<NodeId>,
}

impl<K, V> MapEntry<K, V> {
    /// An entry owned by `local`, with no backups yet.
    pub fn primary(key: K, value: V, local: NodeId) -> Self {
        Self {
            key,
            value: Some(value),
            backup: false,
            proxy: false,
            primary: Some(local),
            backup_nodes: Vec::new(),
        }
    }

    /// An entry created from an inbound message, role set by the caller.
    pub fn remote(key: K, value: Option<V>) -> Self {
        Self {
            key,
            value,
            backup: false,
            proxy: false,
            primary: None,
            backup_nodes: Vec::new(),
        }
    }

    pub fn is_primary(&self) -> bool {
        !self.proxy && !self.backup
    }

    pub fn is_active(&self) -> bool {
        !self.proxy
    }

    pub fn is_backup(&self) -> bool {
        self.backup
    }

    pub fn is_proxy(&self) -> bool {
        self.proxy
    }

    pub fn role(&self) -> Role {
        if self.proxy {
            Role::Proxy
        } else if self.backup {
            Role::Backup
        } else {
            Role::Primary
        }
    }

    pub fn set_backup(&mut self, backup: bool) {
        self.backup = backup;
        if backup {
            self.proxy = false;
        }
    }

    pub fn set_proxy(&mut self, proxy: bool) {
        self.proxy = proxy;
        if proxy {
            self.backup = false;
        }
    }

    /// Makes `local` the primary for this entry.
    pub fn make_primary(&mut self, local: NodeId) {
        self.backup = false;
        self.proxy = false;
        self.primary = Some(local);
    }

    pub fn has_backups(&self) -> bool {
        !self.backup_nodes.is_empty()
    }

    /// `true` when the only backup recorded for this entry is `member`.
    pub fn sole_backup_is(&self, member: &NodeId) -> bool {
        self.backup_nodes.len() == 1 && &self.backup_nodes[0] == member
    }
}
