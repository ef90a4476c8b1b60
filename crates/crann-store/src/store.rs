use std::collections::HashSet;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use crann_core::{
    AgentQuery, ConnectionId, ConnectionInfo, CrannError, Envelope, ListenerSet, Result,
    RpcResponse, StateChanges, StateMap, StateWriter, StoreConfig, SubscriptionId,
};
use crann_storage::StorageTiers;
use crann_transport::{StoreConnector, StoreEvent, StoreSender};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::executor::ActionExecutor;
use crate::persistence::Persistence;
use crate::registry::ConnectionRegistry;
use crate::state::StateManager;

/// Called with the full snapshot, the keys that changed, and the connection
/// the change is attributed to (if any).
pub type StateListener = dyn Fn(&StateMap, &StateChanges, Option<&ConnectionInfo>) + Send + Sync;

/// Called when an agent connects or disconnects.
pub type ConnectionListener = dyn Fn(&ConnectionInfo) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    Created,
    Active,
    Destroyed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DestroyOptions {
    /// Also delete this store's persisted keys (in the background).
    pub clear_persisted: bool,
}

/// The authoritative store.
///
/// Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    config: Arc<StoreConfig>,
    status: RwLock<StoreStatus>,
    state: Mutex<StateManager>,
    registry: Mutex<ConnectionRegistry>,
    persistence: Arc<Persistence>,
    executor: ActionExecutor,
    transport: Arc<dyn StoreSender>,
    state_listeners: ListenerSet<StateListener>,
    connect_listeners: ListenerSet<ConnectionListener>,
    disconnect_listeners: ListenerSet<ConnectionListener>,
    /// Connections that already got their initial snapshot.
    ready_sent: Mutex<HashSet<ConnectionId>>,
    /// Held from apply through notify, so agents see changes in commit order.
    write_gate: tokio::sync::Mutex<()>,
    hydrated: watch::Sender<bool>,
    /// Event loop, hydration and in-flight actions; aborted by `destroy`.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Store {
    /// Listen on the store's namespace and start serving agents.
    ///
    /// Hydration from `tiers` starts in the background; see
    /// [`Store::wait_hydrated`].
    pub async fn start(
        config: StoreConfig,
        connector: &dyn StoreConnector,
        tiers: StorageTiers,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let link = connector.listen(config.name()).await?;

        let inner = Arc::new(StoreInner {
            status: RwLock::new(StoreStatus::Created),
            state: Mutex::new(StateManager::new(Arc::clone(&config))),
            registry: Mutex::new(ConnectionRegistry::new()),
            persistence: Arc::new(Persistence::new(&config, tiers)),
            executor: ActionExecutor::new(Arc::clone(&config)),
            transport: link.sender,
            state_listeners: ListenerSet::new("store.state"),
            connect_listeners: ListenerSet::new("store.connect"),
            disconnect_listeners: ListenerSet::new("store.disconnect"),
            ready_sent: Mutex::new(HashSet::new()),
            write_gate: tokio::sync::Mutex::new(()),
            hydrated: watch::Sender::new(false),
            tasks: Mutex::new(Vec::new()),
            config,
        });

        let event_loop = tokio::spawn(run_events(Arc::downgrade(&inner), link.events));
        let hydration = tokio::spawn(Arc::clone(&inner).hydrate());
        inner.tasks.lock().extend([event_loop, hydration]);
        *inner.status.write() = StoreStatus::Active;

        info!(store = %inner.config.name(), version = inner.config.version(), "store started");
        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        self.inner.config.name()
    }

    pub fn version(&self) -> u32 {
        self.inner.config.version()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn status(&self) -> StoreStatus {
        *self.inner.status.read()
    }

    pub fn is_destroyed(&self) -> bool {
        self.status() == StoreStatus::Destroyed
    }

    /// Copy of the shared state.
    pub fn get_state(&self) -> Result<StateMap> {
        self.inner.ensure_live()?;
        Ok(self.inner.state.lock().get_shared_state())
    }

    /// Copy of one connection's scoped state; defaults for an unknown id.
    pub fn get_agent_state(&self, id: &ConnectionId) -> Result<StateMap> {
        self.inner.ensure_live()?;
        Ok(self.inner.state.lock().get_agent_state(id))
    }

    /// Store-initiated write. Agent-scoped keys are dropped; shared changes
    /// are persisted and broadcast.
    pub async fn set_state(&self, partial: StateMap) -> Result<StateChanges> {
        self.inner
            .commit(None, |state| state.set_state(partial, None))
            .await
    }

    /// Write scoped keys of one connection and tell only that connection.
    pub async fn set_agent_state(
        &self,
        id: &ConnectionId,
        partial: StateMap,
    ) -> Result<StateChanges> {
        self.inner
            .commit(Some(id), |state| state.set_agent_state(id, partial))
            .await
    }

    /// Reset shared and scoped state to defaults, persisting and announcing
    /// whatever moved.
    pub async fn clear(&self) -> Result<()> {
        self.inner.ensure_live()?;
        let _gate = self.inner.write_gate.lock().await;
        let outcome = self.inner.state.lock().clear();
        info!(store = %self.name(), "state cleared");

        for (id, scoped) in outcome.scoped {
            let info = self.inner.registry.lock().get(&id).cloned();
            let changes = StateChanges {
                shared: StateMap::new(),
                scoped,
            };
            self.inner.notify(&changes, info.as_ref()).await;
        }
        if outcome.shared.is_empty() {
            return Ok(());
        }
        let persisted = self.inner.persistence.persist(&outcome.shared).await;
        let changes = StateChanges {
            shared: outcome.shared,
            scoped: StateMap::new(),
        };
        self.inner.notify(&changes, None).await;
        persisted
    }

    pub fn subscribe<F>(&self, listener: F) -> Result<SubscriptionId>
    where
        F: Fn(&StateMap, &StateChanges, Option<&ConnectionInfo>) + Send + Sync + 'static,
    {
        self.inner.ensure_live()?;
        Ok(self.inner.state_listeners.add(Arc::new(listener)))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<bool> {
        self.inner.ensure_live()?;
        Ok(self.inner.state_listeners.remove(id))
    }

    pub fn on_connect<F>(&self, listener: F) -> Result<SubscriptionId>
    where
        F: Fn(&ConnectionInfo) + Send + Sync + 'static,
    {
        self.inner.ensure_live()?;
        Ok(self.inner.connect_listeners.add(Arc::new(listener)))
    }

    pub fn off_connect(&self, id: SubscriptionId) -> Result<bool> {
        self.inner.ensure_live()?;
        Ok(self.inner.connect_listeners.remove(id))
    }

    pub fn on_disconnect<F>(&self, listener: F) -> Result<SubscriptionId>
    where
        F: Fn(&ConnectionInfo) + Send + Sync + 'static,
    {
        self.inner.ensure_live()?;
        Ok(self.inner.disconnect_listeners.add(Arc::new(listener)))
    }

    pub fn off_disconnect(&self, id: SubscriptionId) -> Result<bool> {
        self.inner.ensure_live()?;
        Ok(self.inner.disconnect_listeners.remove(id))
    }

    /// Connected agents matching `query`, oldest first.
    pub fn get_agents(&self, query: &AgentQuery) -> Result<Vec<ConnectionInfo>> {
        self.inner.ensure_live()?;
        Ok(self.inner.registry.lock().query(query))
    }

    pub fn get_agent(&self, id: &ConnectionId) -> Result<Option<ConnectionInfo>> {
        self.inner.ensure_live()?;
        Ok(self.inner.registry.lock().get(id).cloned())
    }

    /// Resolves once startup hydration has finished (successfully or not).
    pub async fn wait_hydrated(&self) -> Result<()> {
        self.inner.ensure_live()?;
        let mut rx = self.inner.hydrated.subscribe();
        let waited = rx.wait_for(|done| *done).await.map(|_| ());
        self.inner.ensure_live()?;
        waited.map_err(|_| CrannError::lifecycle("store", "destroyed"))
    }

    /// Stop serving. In-flight actions are aborted and every agent is
    /// disconnected, which fails their pending calls. Listeners and the
    /// registry are cleared; persisted keys are removed in the background
    /// when asked. Does not wait for that.
    pub fn destroy(&self, options: DestroyOptions) -> Result<()> {
        {
            let mut status = self.inner.status.write();
            if *status == StoreStatus::Destroyed {
                return Err(CrannError::lifecycle("store", "destroyed"));
            }
            *status = StoreStatus::Destroyed;
        }

        self.inner.state_listeners.clear();
        self.inner.connect_listeners.clear();
        self.inner.disconnect_listeners.clear();
        self.inner.registry.lock().clear();
        self.inner.ready_sent.lock().clear();
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.transport.close();
        self.inner.hydrated.send_replace(true);

        if options.clear_persisted {
            let persistence = Arc::clone(&self.inner.persistence);
            let store = self.inner.config.name().to_string();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = persistence.clear_all().await {
                            warn!(store = %store, error = %e, "failed to clear persisted state");
                        }
                    });
                }
                Err(_) => {
                    warn!(store = %store, "no runtime to clear persisted state on");
                }
            }
        }
        info!(store = %self.name(), clear_persisted = options.clear_persisted, "store destroyed");
        Ok(())
    }
}

/// Drive the store from transport events until the link or the store goes.
async fn run_events(store: Weak<StoreInner>, mut events: mpsc::Receiver<StoreEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = store.upgrade() else {
            break;
        };
        if inner.is_destroyed() {
            break;
        }
        inner.handle(event).await;
    }
    debug!("store event loop finished");
}

impl StoreInner {
    fn is_destroyed(&self) -> bool {
        *self.status.read() == StoreStatus::Destroyed
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(CrannError::lifecycle("store", "destroyed"));
        }
        Ok(())
    }

    async fn handle(self: &Arc<Self>, event: StoreEvent) {
        match event {
            StoreEvent::Connected(info) => self.on_connected(info),
            StoreEvent::Ready(id) => self.on_ready(&id).await,
            StoreEvent::Disconnected(id) => self.on_disconnected(&id),
            StoreEvent::Message { from, envelope } => self.on_message(from, envelope).await,
        }
    }

    fn on_connected(&self, info: ConnectionInfo) {
        let added = self.registry.lock().add(info);
        let info = match added {
            Ok(info) => info,
            Err(e) => {
                warn!(store = %self.config.name(), error = %e, "rejected connection");
                return;
            }
        };
        self.state.lock().initialize_agent_state(&info.id);
        info!(
            store = %self.config.name(),
            connection = %info.id,
            context = %info.context(),
            "agent connected"
        );
        self.connect_listeners.emit(|l| l(&info));
    }

    async fn on_ready(&self, id: &ConnectionId) {
        let Some(info) = self.registry.lock().get(id).cloned() else {
            debug!(connection = %id, "ready for unknown connection");
            return;
        };
        if !self.ready_sent.lock().insert(id.clone()) {
            debug!(connection = %id, "ready repeated, snapshot already sent");
            return;
        }
        let state = self.state.lock().get_full_state(id);
        debug!(store = %self.config.name(), connection = %id, keys = state.len(), "sending initial state");
        if let Err(e) = self
            .transport
            .post(Envelope::InitialState { state, info }, Some(id))
            .await
        {
            warn!(connection = %id, error = %e, "failed to send initial state");
        }
    }

    fn on_disconnected(&self, id: &ConnectionId) {
        let Some(info) = self.registry.lock().remove(id) else {
            debug!(connection = %id, "disconnect for unknown connection");
            return;
        };
        self.state.lock().remove_agent_state(id);
        self.ready_sent.lock().remove(id);
        info!(store = %self.config.name(), connection = %id, "agent disconnected");
        self.disconnect_listeners.emit(|l| l(&info));
    }

    async fn on_message(self: &Arc<Self>, from: ConnectionId, envelope: Envelope) {
        if !self.registry.lock().has(&from) {
            warn!(connection = %from, action = envelope.action(), "message from unknown connection");
            return;
        }
        match envelope {
            Envelope::SetState { state } => {
                debug!(connection = %from, keys = state.len(), "setState");
                if let Err(e) = self
                    .commit(Some(&from), |s| s.set_state(state, Some(&from)))
                    .await
                {
                    warn!(connection = %from, error = %e, "setState failed");
                }
            }
            Envelope::Rpc {
                call_id,
                action,
                args,
            } => {
                debug!(connection = %from, call_id, action = %action, "rpc");
                // Caller and snapshot are fixed before the next message is handled.
                let Some(caller) = self.registry.lock().get(&from).cloned() else {
                    return;
                };
                let snapshot = self.state.lock().get_full_state(&from);
                let inner = Arc::clone(self);
                let task = tokio::spawn(async move {
                    inner
                        .answer_rpc(caller, snapshot, call_id, action, args)
                        .await
                });
                self.track(task);
            }
            other => {
                debug!(connection = %from, action = other.action(), "ignoring store-bound message");
            }
        }
    }

    /// Keep a spawned task so `destroy` can abort it.
    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        if self.is_destroyed() {
            task.abort();
        } else {
            tasks.push(task);
        }
    }

    async fn answer_rpc(
        self: Arc<Self>,
        caller: ConnectionInfo,
        snapshot: StateMap,
        call_id: u64,
        action: String,
        args: Vec<Value>,
    ) {
        let from = caller.id.clone();
        let response = match self.run_action(&action, args, caller, snapshot).await {
            Ok(result) => RpcResponse::ok(call_id, result),
            Err(e) => RpcResponse::err(call_id, e.to_string()),
        };
        if !self.registry.lock().has(&from) {
            debug!(connection = %from, call_id, "caller gone, dropping rpc result");
            return;
        }
        if let Err(e) = self
            .transport
            .post(Envelope::RpcResult(response), Some(&from))
            .await
        {
            debug!(connection = %from, call_id, error = %e, "failed to send rpc result");
        }
    }

    async fn run_action(
        self: &Arc<Self>,
        name: &str,
        args: Vec<Value>,
        info: ConnectionInfo,
        snapshot: StateMap,
    ) -> Result<Value> {
        self.ensure_live()?;
        let writer: Arc<dyn StateWriter> = Arc::new(StoreWriter {
            store: Arc::downgrade(self),
        });
        self.executor
            .execute(name, args, info, snapshot, writer)
            .await
    }

    /// Apply a write, persist its shared part, then notify. A persistence
    /// failure is returned after the change has been announced.
    async fn commit<F>(&self, connection: Option<&ConnectionId>, write: F) -> Result<StateChanges>
    where
        F: FnOnce(&mut StateManager) -> Result<StateChanges> + Send,
    {
        self.ensure_live()?;
        let _gate = self.write_gate.lock().await;
        let changes = write(&mut *self.state.lock())?;
        if changes.is_empty() {
            return Ok(changes);
        }

        let persisted = self.persistence.persist(&changes.shared).await;
        if let Err(ref e) = persisted {
            warn!(store = %self.config.name(), error = %e, "persist failed; durable copy is stale");
        }
        let attributed = connection.and_then(|id| self.registry.lock().get(id).cloned());
        self.notify(&changes, attributed.as_ref()).await;
        persisted.map(|_| changes)
    }

    /// Fire local listeners, then tell agents.
    ///
    /// The attributed connection gets every change in one message; other
    /// connections get the shared part. Unattributed changes are broadcast.
    async fn notify(&self, changes: &StateChanges, attributed: Option<&ConnectionInfo>) {
        let snapshot = match attributed {
            Some(info) => self.state.lock().get_full_state(&info.id),
            None => self.state.lock().get_shared_state(),
        };
        self.state_listeners
            .emit(|l| l(&snapshot, changes, attributed));

        let Some(origin) = attributed else {
            if changes.shared.is_empty() {
                return;
            }
            let update = Envelope::StateUpdate {
                state: changes.shared.clone(),
            };
            if let Err(e) = self.transport.post(update, None).await {
                warn!(store = %self.config.name(), error = %e, "broadcast failed");
            }
            return;
        };

        let own = Envelope::StateUpdate {
            state: changes.merged(),
        };
        if let Err(e) = self.transport.post(own, Some(&origin.id)).await {
            debug!(connection = %origin.id, error = %e, "update to origin failed");
        }
        if changes.shared.is_empty() {
            return;
        }
        let others: Vec<ConnectionId> = self
            .registry
            .lock()
            .ids()
            .into_iter()
            .filter(|id| *id != origin.id)
            .collect();
        for id in others {
            let update = Envelope::StateUpdate {
                state: changes.shared.clone(),
            };
            if let Err(e) = self.transport.post(update, Some(&id)).await {
                debug!(connection = %id, error = %e, "update to agent failed");
            }
        }
    }

    /// Startup hydration. Loaded values are announced like any other change
    /// but not written back.
    async fn hydrate(self: Arc<Self>) {
        match self.persistence.hydrate().await {
            Ok(values) => {
                if !self.is_destroyed() {
                    let _gate = self.write_gate.lock().await;
                    let changes = self.state.lock().hydrate_shared_state(values);
                    if !changes.is_empty() {
                        self.notify(&changes, None).await;
                    }
                }
            }
            Err(e) => {
                warn!(store = %self.config.name(), error = %e, "hydration failed, keeping defaults");
            }
        }
        self.hydrated.send_replace(true);
    }
}

/// The write path handed to action handlers. Holds the store weakly so an
/// in-flight action cannot keep a dropped store alive.
struct StoreWriter {
    store: Weak<StoreInner>,
}

#[async_trait]
impl StateWriter for StoreWriter {
    async fn write(&self, partial: StateMap, connection: &ConnectionId) -> Result<StateChanges> {
        let inner = self
            .store
            .upgrade()
            .ok_or_else(|| CrannError::lifecycle("store", "dropped"))?;
        inner
            .commit(Some(connection), |s| s.set_state(partial, Some(connection)))
            .await
    }
}
