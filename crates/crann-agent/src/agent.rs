use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crann_core::listener::guarded;
use crann_core::{
    AgentLocation, ConnectionInfo, CrannError, Envelope, ListenerSet, Result, StateMap,
    StoreConfig, SubscriptionId, overlay,
};
use crann_transport::{AgentConnector, AgentEvent, AgentSender};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::rpc::{ActionStub, CallGuard, PendingCalls};

/// Called with the keys an update changed and the full local snapshot.
pub type StateCallback = dyn Fn(&StateMap, &StateMap) + Send + Sync;

/// Called with the full local snapshot.
pub type SnapshotCallback = dyn Fn(&StateMap) + Send + Sync;

/// Called when the link drops.
pub type DisconnectCallback = dyn Fn() + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    /// Waiting for the first snapshot.
    Connecting,
    Ready,
    /// The link is down, or [`Agent::disconnect`] was called.
    Disconnected,
    /// The link is back; waiting for a fresh snapshot.
    Reconnecting,
}

#[derive(Debug, Clone)]
enum ReadyState {
    Pending,
    Ready(StateMap),
    Closed,
}

/// A client of one store.
///
/// Keeps a local copy of the shared state plus this connection's scoped
/// state. Reads never wait on the network: before the first snapshot the
/// copy holds the configured defaults.
///
/// Cloning yields another handle to the same agent.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    config: Arc<StoreConfig>,
    location: AgentLocation,
    sender: Arc<dyn AgentSender>,
    status: RwLock<AgentStatus>,
    /// Set once by `disconnect`; never cleared.
    closed: AtomicBool,
    state: RwLock<StateMap>,
    info: RwLock<Option<ConnectionInfo>>,
    ready: watch::Sender<ReadyState>,
    pending: PendingCalls,
    subscribers: ListenerSet<StateCallback>,
    ready_listeners: ListenerSet<SnapshotCallback>,
    disconnect_listeners: ListenerSet<DisconnectCallback>,
    reconnect_listeners: ListenerSet<SnapshotCallback>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Agent {
    /// Connect to the store named in `config`.
    ///
    /// Returns as soon as the link is open; use [`Agent::ready`] to wait
    /// for the first snapshot.
    pub async fn connect(
        config: StoreConfig,
        connector: &dyn AgentConnector,
        location: AgentLocation,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let link = connector.connect(config.name(), location.clone()).await?;
        debug!(
            store = %config.name(),
            context = %location.context,
            "agent link open"
        );

        let inner = Arc::new(AgentInner {
            location,
            sender: link.sender,
            status: RwLock::new(AgentStatus::Connecting),
            closed: AtomicBool::new(false),
            state: RwLock::new(config.all_defaults()),
            info: RwLock::new(None),
            ready: watch::Sender::new(ReadyState::Pending),
            pending: PendingCalls::default(),
            subscribers: ListenerSet::new("agent.subscriber"),
            ready_listeners: ListenerSet::new("agent.ready"),
            disconnect_listeners: ListenerSet::new("agent.disconnect"),
            reconnect_listeners: ListenerSet::new("agent.reconnect"),
            task: Mutex::new(None),
            config,
        });
        let task = tokio::spawn(run_events(Arc::downgrade(&inner), link.events));
        *inner.task.lock() = Some(task);
        Ok(Self { inner })
    }

    pub fn status(&self) -> AgentStatus {
        *self.inner.status.read()
    }

    pub fn location(&self) -> &AgentLocation {
        &self.inner.location
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Resolves with the first snapshot the store sent. Later reconnects
    /// do not change the value.
    pub async fn ready(&self) -> Result<StateMap> {
        self.inner.ensure_live()?;
        let mut rx = self.inner.ready.subscribe();
        let settled = rx
            .wait_for(|s| !matches!(s, ReadyState::Pending))
            .await
            .map(|s| (*s).clone());
        match settled {
            Ok(ReadyState::Ready(state)) => Ok(state),
            _ => Err(CrannError::lifecycle("agent", "disconnected")),
        }
    }

    /// Run `callback` on every transition to Ready. If the agent is
    /// already Ready it also runs once right away, on a separate task.
    pub fn on_ready<F>(&self, callback: F) -> Result<SubscriptionId>
    where
        F: Fn(&StateMap) + Send + Sync + 'static,
    {
        self.inner.ensure_live()?;
        let callback: Arc<SnapshotCallback> = Arc::new(callback);
        let id = self.inner.ready_listeners.add(Arc::clone(&callback));
        if self.status() == AgentStatus::Ready {
            let snapshot = self.inner.state.read().clone();
            tokio::spawn(async move {
                guarded("agent.ready", || callback(&snapshot));
            });
        }
        Ok(id)
    }

    /// Copy of the local state.
    pub fn get_state(&self) -> Result<StateMap> {
        self.inner.ensure_live()?;
        Ok(self.inner.state.read().clone())
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.inner.ensure_live()?;
        Ok(self.inner.state.read().get(key).cloned())
    }

    /// One key, deserialized. `None` when the key is absent.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get(key)?
            .map(serde_json::from_value)
            .transpose()
            .map_err(CrannError::from)
    }

    /// Apply `partial` locally and send it to the store without waiting.
    ///
    /// Undeclared keys are left out of the local copy; the store decides
    /// what happens to them. Local subscribers are not called: they hear
    /// about the write when the store's update comes back.
    pub async fn set_state(&self, partial: StateMap) -> Result<()> {
        self.inner.ensure_live()?;
        {
            let mut state = self.inner.state.write();
            for (key, value) in &partial {
                if self.inner.config.item(key).is_some() {
                    state.insert(key.clone(), value.clone());
                }
            }
        }
        self.inner
            .sender
            .post(Envelope::SetState { state: partial })
            .await
    }

    /// Run `callback` on every update from the store.
    pub fn subscribe<F>(&self, callback: F) -> Result<SubscriptionId>
    where
        F: Fn(&StateMap, &StateMap) + Send + Sync + 'static,
    {
        self.inner.ensure_live()?;
        Ok(self.inner.subscribers.add(Arc::new(callback)))
    }

    /// Like [`Agent::subscribe`], but only for updates touching one of `keys`.
    pub fn subscribe_keys<I, K, F>(&self, keys: I, callback: F) -> Result<SubscriptionId>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
        F: Fn(&StateMap, &StateMap) + Send + Sync + 'static,
    {
        let watched: HashSet<String> = keys.into_iter().map(Into::into).collect();
        self.subscribe(move |changes, state| {
            if changes.keys().any(|k| watched.contains(k)) {
                callback(changes, state);
            }
        })
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<bool> {
        self.inner.ensure_live()?;
        Ok(self.inner.subscribers.remove(id))
    }

    /// Invoke action `name` on the store and wait for its result.
    ///
    /// Calls are matched to replies by correlation id, so concurrent calls
    /// may finish in any order. A dropped link fails every pending call.
    /// Dropping the returned future forgets the call; a late reply is ignored.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        self.inner.ensure_live()?;
        let (call_id, reply) = self.inner.pending.register(name);
        let _guard = CallGuard::new(&self.inner.pending, call_id);
        debug!(call_id, action = name, "calling action");
        let request = Envelope::Rpc {
            call_id,
            action: name.to_string(),
            args,
        };
        self.inner.sender.post(request).await?;
        reply
            .await
            .map_err(|_| CrannError::Disconnected(format!("agent closed while '{name}' was in flight")))?
    }

    pub async fn call_as<T: DeserializeOwned>(&self, name: &str, args: Vec<Value>) -> Result<T> {
        let value = self.call(name, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// A reusable stub for action `name`.
    pub fn action(&self, name: impl Into<String>) -> ActionStub {
        ActionStub::new(self.clone(), name.into())
    }

    /// The store-assigned identity of this connection; `None` until the
    /// first snapshot arrives.
    pub fn get_info(&self) -> Result<Option<ConnectionInfo>> {
        self.inner.ensure_live()?;
        Ok(self.inner.info.read().clone())
    }

    pub fn on_disconnect<F>(&self, callback: F) -> Result<SubscriptionId>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.ensure_live()?;
        Ok(self.inner.disconnect_listeners.add(Arc::new(callback)))
    }

    /// Run `callback` when the link comes back. It gets the local copy as
    /// it stood before the store's fresh snapshot.
    pub fn on_reconnect<F>(&self, callback: F) -> Result<SubscriptionId>
    where
        F: Fn(&StateMap) + Send + Sync + 'static,
    {
        self.inner.ensure_live()?;
        Ok(self.inner.reconnect_listeners.add(Arc::new(callback)))
    }

    /// Number of calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Close the link for good. Every callback is dropped and every later
    /// call on this agent fails.
    pub async fn disconnect(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(CrannError::lifecycle("agent", "disconnected"));
        }
        *self.inner.status.write() = AgentStatus::Disconnected;
        self.inner.subscribers.clear();
        self.inner.ready_listeners.clear();
        self.inner.disconnect_listeners.clear();
        self.inner.reconnect_listeners.clear();
        self.inner.ready.send_if_modified(|s| match s {
            ReadyState::Pending => {
                *s = ReadyState::Closed;
                true
            }
            _ => false,
        });
        let rejected = self.inner.pending.reject_all("agent disconnected");
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
        self.inner.sender.close().await;
        info!(store = %self.inner.config.name(), rejected, "agent disconnected");
        Ok(())
    }
}

/// Drive the agent from transport events until the link or the agent goes.
async fn run_events(agent: Weak<AgentInner>, mut events: mpsc::Receiver<AgentEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = agent.upgrade() else {
            break;
        };
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        inner.handle(event);
    }
    if let Some(inner) = agent.upgrade() {
        inner.pending.reject_all("link closed");
    }
    debug!("agent event loop finished");
}

impl AgentInner {
    fn ensure_live(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CrannError::lifecycle("agent", "disconnected"));
        }
        Ok(())
    }

    fn handle(&self, event: AgentEvent) {
        match event {
            AgentEvent::Message(envelope) => self.on_message(envelope),
            AgentEvent::Disconnected => self.on_link_down(),
            AgentEvent::Reconnected(id) => self.on_link_back(&id),
        }
    }

    fn on_message(&self, envelope: Envelope) {
        match envelope {
            Envelope::InitialState { state, info } => self.on_initial_state(state, info),
            Envelope::StateUpdate { state } => {
                let snapshot = {
                    let mut local = self.state.write();
                    for (key, value) in &state {
                        local.insert(key.clone(), value.clone());
                    }
                    local.clone()
                };
                debug!(keys = state.len(), "state update");
                self.subscribers.emit(|cb| cb(&state, &snapshot));
            }
            Envelope::RpcResult(response) => {
                self.pending.resolve(response);
            }
            other => {
                debug!(action = other.action(), "ignoring agent-bound message");
            }
        }
    }

    fn on_initial_state(&self, state: StateMap, info: ConnectionInfo) {
        let snapshot = overlay(&self.config.all_defaults(), &state);
        *self.state.write() = snapshot.clone();
        *self.info.write() = Some(info.clone());
        *self.status.write() = AgentStatus::Ready;

        let first = self.ready.send_if_modified(|s| match s {
            ReadyState::Pending => {
                *s = ReadyState::Ready(snapshot.clone());
                true
            }
            _ => false,
        });
        info!(
            store = %self.config.name(),
            connection = %info.id,
            first,
            "agent ready"
        );
        self.ready_listeners.emit(|cb| cb(&snapshot));
        if !first {
            // A fresh snapshot after a reconnect replaces everything.
            self.subscribers.emit(|cb| cb(&snapshot, &snapshot));
        }
    }

    fn on_link_down(&self) {
        *self.status.write() = AgentStatus::Disconnected;
        let rejected = self.pending.reject_all("link dropped");
        warn!(store = %self.config.name(), rejected, "agent link dropped");
        self.disconnect_listeners.emit(|cb| cb());
    }

    fn on_link_back(&self, id: &str) {
        *self.status.write() = AgentStatus::Reconnecting;
        info!(store = %self.config.name(), connection = %id, "agent link restored");
        let snapshot = self.state.read().clone();
        self.reconnect_listeners.emit(|cb| cb(&snapshot));
    }
}
