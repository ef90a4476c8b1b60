use std::collections::HashMap;

use chrono::Utc;
use crann_core::{AgentQuery, ConnectionId, ConnectionInfo, CrannError, Result};

/// Directory of live connections, keyed by connection id.
///
/// Entries mirror the transport exactly: one `add` per handshake, one
/// `remove` per disconnect. A second `add` for a live id is an error.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, ConnectionInfo>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, stamping `connected_at` with the current time.
    pub fn add(&mut self, mut info: ConnectionInfo) -> Result<ConnectionInfo> {
        if self.connections.contains_key(&info.id) {
            return Err(CrannError::DuplicateConnection(info.id));
        }
        info.connected_at = Utc::now();
        self.connections.insert(info.id.clone(), info.clone());
        Ok(info)
    }

    pub fn remove(&mut self, id: &ConnectionId) -> Option<ConnectionInfo> {
        self.connections.remove(id)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&ConnectionInfo> {
        self.connections.get(id)
    }

    pub fn has(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Every connection, oldest first.
    pub fn get_all(&self) -> Vec<ConnectionInfo> {
        self.sorted(self.connections.values())
    }

    /// Connections matching every field `query` sets, oldest first.
    pub fn query(&self, query: &AgentQuery) -> Vec<ConnectionInfo> {
        self.sorted(self.connections.values().filter(|info| query.matches(info)))
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn clear(&mut self) {
        self.connections.clear();
    }

    fn sorted<'a>(&self, infos: impl Iterator<Item = &'a ConnectionInfo>) -> Vec<ConnectionInfo> {
        let mut out: Vec<ConnectionInfo> = infos.cloned().collect();
        out.sort_by(|a, b| {
            a.connected_at
                .cmp(&b.connected_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }
}
