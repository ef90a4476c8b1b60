use std::sync::Arc;

use async_trait::async_trait;
use crann_config::TransportConfig;
use crann_core::{
    AgentLocation, AgentQuery, ConnectionId, ConnectionInfo, CrannError, Envelope, Result,
};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info};

use crate::link::{
    AgentConnector, AgentEvent, AgentLink, AgentSender, StoreConnector, StoreEvent, StoreLink,
    StoreSender,
};

/// Current connection id of one agent; `None` while its link is down.
type Route = Arc<RwLock<Option<ConnectionId>>>;

struct HubConnection {
    namespace: String,
    info: ConnectionInfo,
    agent_tx: mpsc::Sender<AgentEvent>,
    route: Route,
}

/// An agent whose link was interrupted, waiting for `resume`.
struct ParkedAgent {
    namespace: String,
    location: AgentLocation,
    agent_tx: mpsc::Sender<AgentEvent>,
    route: Route,
}

struct HubInner {
    buffer: usize,
    stores: DashMap<String, mpsc::Sender<StoreEvent>>,
    connections: DashMap<ConnectionId, HubConnection>,
    parked: DashMap<ConnectionId, ParkedAgent>,
}

/// In-process transport. One store listens per namespace; any number of
/// agents connect to it. Every envelope is serialised to JSON and parsed
/// back on delivery, so only the wire form crosses the hub.
///
/// Cloning yields another handle to the same hub.
#[derive(Clone)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl LocalHub {
    /// A hub whose channels hold `buffer` events each.
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                buffer: buffer.max(1),
                stores: DashMap::new(),
                connections: DashMap::new(),
                parked: DashMap::new(),
            }),
        }
    }

    /// A hub sized by the `[transport]` section of `crann.toml`.
    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(config.channel_buffer)
    }

    /// Number of live connections across all namespaces.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Drop a live link. Both sides see a disconnect; the agent is parked
    /// so [`LocalHub::resume`] can bring it back.
    pub async fn interrupt(&self, id: &ConnectionId) -> Result<()> {
        let (_, conn) = self
            .inner
            .connections
            .remove(id)
            .ok_or_else(|| CrannError::Transport(format!("unknown connection {id}")))?;
        *conn.route.write() = None;
        info!(connection = %id, namespace = %conn.namespace, "link interrupted");

        if conn.agent_tx.send(AgentEvent::Disconnected).await.is_err() {
            debug!(connection = %id, "agent already gone");
        }
        let namespace = conn.namespace.clone();
        self.inner.parked.insert(
            id.clone(),
            ParkedAgent {
                namespace: conn.namespace,
                location: conn.info.location,
                agent_tx: conn.agent_tx,
                route: conn.route,
            },
        );
        self.inner
            .to_store(&namespace, StoreEvent::Disconnected(id.clone()))
            .await
    }

    /// Re-attach an interrupted agent under a fresh connection id.
    pub async fn resume(&self, id: &ConnectionId) -> Result<ConnectionId> {
        let (_, parked) = self
            .inner
            .parked
            .remove(id)
            .ok_or_else(|| CrannError::Transport(format!("connection {id} is not parked")))?;
        let agent_tx = parked.agent_tx.clone();
        let info = self.inner.attach(
            &parked.namespace,
            parked.location,
            parked.agent_tx,
            parked.route,
        );
        let new_id = info.id.clone();
        info!(old = %id, connection = %new_id, "link resumed");

        // The agent learns its new id before the store can address it.
        agent_tx
            .send(AgentEvent::Reconnected(new_id.clone()))
            .await
            .map_err(|_| CrannError::Disconnected(new_id.clone()))?;
        self.inner.announce(&parked.namespace, info).await?;
        Ok(new_id)
    }

    /// Repeat the channel-ready signal for a live connection.
    pub async fn signal_ready(&self, id: &ConnectionId) -> Result<()> {
        let namespace = self
            .inner
            .connections
            .get(id)
            .map(|c| c.namespace.clone())
            .ok_or_else(|| CrannError::Transport(format!("unknown connection {id}")))?;
        self.inner
            .to_store(&namespace, StoreEvent::Ready(id.clone()))
            .await
    }
}

impl HubInner {
    fn store_tx(&self, namespace: &str) -> Result<mpsc::Sender<StoreEvent>> {
        self.stores
            .get(namespace)
            .map(|tx| tx.clone())
            .ok_or_else(|| CrannError::Transport(format!("no store listening on '{namespace}'")))
    }

    async fn to_store(&self, namespace: &str, event: StoreEvent) -> Result<()> {
        self.store_tx(namespace)?
            .send(event)
            .await
            .map_err(|_| CrannError::Transport(format!("store on '{namespace}' is gone")))
    }

    /// Register a connection under a new id and point the agent's route at it.
    fn attach(
        &self,
        namespace: &str,
        location: AgentLocation,
        agent_tx: mpsc::Sender<AgentEvent>,
        route: Route,
    ) -> ConnectionInfo {
        let id = uuid::Uuid::new_v4().to_string();
        let info = ConnectionInfo::new(id.clone(), location);
        *route.write() = Some(id.clone());
        self.connections.insert(
            id,
            HubConnection {
                namespace: namespace.to_string(),
                info: info.clone(),
                agent_tx,
                route,
            },
        );
        info
    }

    /// Tell the store a connection exists and is usable.
    async fn announce(&self, namespace: &str, info: ConnectionInfo) -> Result<()> {
        let id = info.id.clone();
        self.to_store(namespace, StoreEvent::Connected(info)).await?;
        self.to_store(namespace, StoreEvent::Ready(id)).await
    }
}

/// Tell an agent its link is gone without waiting on its channel.
fn drop_agent(id: &ConnectionId, tx: mpsc::Sender<AgentEvent>) {
    match tx.try_send(AgentEvent::Disconnected) {
        Ok(()) => {}
        Err(TrySendError::Closed(_)) => debug!(connection = %id, "agent already gone"),
        Err(TrySendError::Full(event)) => match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = tx.send(event).await;
                });
            }
            Err(_) => debug!(connection = %id, "agent channel full, disconnect not delivered"),
        },
    }
}

/// Round-trip an envelope through its wire form.
fn wire(envelope: &Envelope) -> Result<Envelope> {
    Envelope::from_json(&envelope.to_json()?)
}

// ── Store side ─────────────────────────────────────────────────

#[async_trait]
impl StoreConnector for LocalHub {
    async fn listen(&self, namespace: &str) -> Result<StoreLink> {
        let taken = self
            .inner
            .stores
            .get(namespace)
            .map(|tx| !tx.is_closed())
            .unwrap_or(false);
        if taken {
            return Err(CrannError::Transport(format!(
                "a store is already listening on '{namespace}'"
            )));
        }
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        self.inner.stores.insert(namespace.to_string(), tx.clone());
        info!(namespace, "store listening");
        Ok(StoreLink {
            sender: Arc::new(LocalStoreSender {
                hub: Arc::clone(&self.inner),
                namespace: namespace.to_string(),
                store_tx: tx,
            }),
            events: rx,
        })
    }
}

struct LocalStoreSender {
    hub: Arc<HubInner>,
    namespace: String,
    /// Identifies this listener, so a late close cannot unregister a
    /// newer store on the same namespace.
    store_tx: mpsc::Sender<StoreEvent>,
}

#[async_trait]
impl StoreSender for LocalStoreSender {
    async fn post(&self, envelope: Envelope, target: Option<&ConnectionId>) -> Result<()> {
        let envelope = wire(&envelope)?;
        match target {
            Some(id) => {
                let tx = self
                    .hub
                    .connections
                    .get(id)
                    .filter(|c| c.namespace == self.namespace)
                    .map(|c| c.agent_tx.clone())
                    .ok_or_else(|| CrannError::Disconnected(id.clone()))?;
                debug!(connection = %id, action = envelope.action(), "unicast");
                tx.send(AgentEvent::Message(envelope))
                    .await
                    .map_err(|_| CrannError::Disconnected(id.clone()))
            }
            None => {
                let targets: Vec<(ConnectionId, mpsc::Sender<AgentEvent>)> = self
                    .hub
                    .connections
                    .iter()
                    .filter(|c| c.namespace == self.namespace)
                    .map(|c| (c.key().clone(), c.agent_tx.clone()))
                    .collect();
                debug!(
                    namespace = %self.namespace,
                    action = envelope.action(),
                    targets = targets.len(),
                    "broadcast"
                );
                for (id, tx) in targets {
                    if tx.send(AgentEvent::Message(envelope.clone())).await.is_err() {
                        debug!(connection = %id, "broadcast target gone");
                    }
                }
                Ok(())
            }
        }
    }

    fn query_agents(&self, query: &AgentQuery) -> Vec<ConnectionInfo> {
        self.hub
            .connections
            .iter()
            .filter(|c| c.namespace == self.namespace && query.matches(&c.info))
            .map(|c| c.info.clone())
            .collect()
    }

    fn agent_by_id(&self, id: &ConnectionId) -> Option<ConnectionInfo> {
        self.hub
            .connections
            .get(id)
            .filter(|c| c.namespace == self.namespace)
            .map(|c| c.info.clone())
    }

    fn close(&self) {
        let removed = self
            .hub
            .stores
            .remove_if(&self.namespace, |_, tx| tx.same_channel(&self.store_tx))
            .is_some();
        if !removed {
            debug!(namespace = %self.namespace, "namespace already closed");
            return;
        }
        self.hub.parked.retain(|_, p| p.namespace != self.namespace);
        let ids: Vec<ConnectionId> = self
            .hub
            .connections
            .iter()
            .filter(|c| c.namespace == self.namespace)
            .map(|c| c.key().clone())
            .collect();
        let dropped = ids.len();
        for id in ids {
            if let Some((_, conn)) = self.hub.connections.remove(&id) {
                *conn.route.write() = None;
                drop_agent(&id, conn.agent_tx);
            }
        }
        info!(namespace = %self.namespace, dropped, "store closed namespace");
    }
}

// ── Agent side ─────────────────────────────────────────────────

#[async_trait]
impl AgentConnector for LocalHub {
    async fn connect(&self, namespace: &str, location: AgentLocation) -> Result<AgentLink> {
        // Fail before registering anything when nobody is listening.
        self.inner.store_tx(namespace)?;

        let (agent_tx, agent_rx) = mpsc::channel(self.inner.buffer);
        let route: Route = Arc::new(RwLock::new(None));
        let info = self
            .inner
            .attach(namespace, location, agent_tx, Arc::clone(&route));
        let id = info.id.clone();
        debug!(connection = %id, namespace, context = %info.context(), "agent connecting");

        if let Err(e) = self.inner.announce(namespace, info).await {
            self.inner.connections.remove(&id);
            return Err(e);
        }
        Ok(AgentLink {
            sender: Arc::new(LocalAgentSender {
                hub: Arc::clone(&self.inner),
                namespace: namespace.to_string(),
                route,
            }),
            events: agent_rx,
        })
    }
}

struct LocalAgentSender {
    hub: Arc<HubInner>,
    namespace: String,
    route: Route,
}

#[async_trait]
impl AgentSender for LocalAgentSender {
    async fn post(&self, envelope: Envelope) -> Result<()> {
        let from = self
            .route
            .read()
            .clone()
            .ok_or_else(|| CrannError::Disconnected("link is down".into()))?;
        let envelope = wire(&envelope)?;
        self.hub
            .to_store(&self.namespace, StoreEvent::Message { from, envelope })
            .await
    }

    async fn close(&self) {
        let id = self.route.write().take();
        self.hub
            .parked
            .retain(|_, p| !Arc::ptr_eq(&p.route, &self.route));
        let Some(id) = id else {
            return;
        };
        if self.hub.connections.remove(&id).is_some() {
            debug!(connection = %id, "agent closed link");
            if let Err(e) = self
                .hub
                .to_store(&self.namespace, StoreEvent::Disconnected(id.clone()))
                .await
            {
                debug!(connection = %id, error = %e, "store not told about close");
            }
        }
    }

    fn connection_id(&self) -> Option<ConnectionId> {
        self.route.read().clone()
    }
}
