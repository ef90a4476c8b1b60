use std::sync::Arc;

use async_trait::async_trait;
use crann_core::{AgentLocation, AgentQuery, ConnectionId, ConnectionInfo, Envelope};
use tokio::sync::mpsc;

/// Events delivered to the store side of a namespace.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// An agent completed the handshake.
    Connected(ConnectionInfo),
    /// The link to this connection is usable. May repeat.
    Ready(ConnectionId),
    /// The connection is gone.
    Disconnected(ConnectionId),
    /// A wire message from one connection.
    Message {
        from: ConnectionId,
        envelope: Envelope,
    },
}

/// Events delivered to one agent.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A wire message from the store.
    Message(Envelope),
    /// The link dropped. The agent may later see `Reconnected`.
    Disconnected,
    /// The link came back under a new connection id.
    Reconnected(ConnectionId),
}

/// Store-side handle for a listening namespace.
pub struct StoreLink {
    pub sender: Arc<dyn StoreSender>,
    pub events: mpsc::Receiver<StoreEvent>,
}

/// Agent-side handle for one connection.
pub struct AgentLink {
    pub sender: Arc<dyn AgentSender>,
    pub events: mpsc::Receiver<AgentEvent>,
}

/// Opens the store side of a namespace.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    /// Start accepting agents on `namespace`.
    async fn listen(&self, namespace: &str) -> crann_core::Result<StoreLink>;
}

/// Outbound half of the store side.
#[async_trait]
pub trait StoreSender: Send + Sync {
    /// Send to one connection, or to every connection of the namespace when
    /// `target` is `None`.
    async fn post(&self, envelope: Envelope, target: Option<&ConnectionId>)
    -> crann_core::Result<()>;

    /// Live connections matching `query`.
    fn query_agents(&self, query: &AgentQuery) -> Vec<ConnectionInfo>;

    fn agent_by_id(&self, id: &ConnectionId) -> Option<ConnectionInfo>;

    /// Stop listening. Every connection of the namespace is dropped and its
    /// agent sees a disconnect.
    fn close(&self);
}

/// Opens the agent side of a namespace.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    async fn connect(
        &self,
        namespace: &str,
        location: AgentLocation,
    ) -> crann_core::Result<AgentLink>;
}

/// Outbound half of one agent connection.
#[async_trait]
pub trait AgentSender: Send + Sync {
    async fn post(&self, envelope: Envelope) -> crann_core::Result<()>;

    /// Tear the connection down for good.
    async fn close(&self);

    /// Current connection id; `None` while the link is down.
    fn connection_id(&self) -> Option<ConnectionId>;
}
