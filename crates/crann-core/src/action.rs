//! Remote action definitions and the context a handler runs in.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::Result;
use crate::types::{AgentLocation, ConnectionId, ConnectionInfo, StateChanges, StateMap};

/// Future returned by an action handler.
pub type ActionFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// Handler invoked for a named remote action.
pub type ActionHandler = Arc<dyn Fn(ActionContext, Vec<Value>) -> ActionFuture + Send + Sync>;

/// Synchronous argument check run before the handler.
pub type ActionValidator = Arc<dyn Fn(&[Value]) -> anyhow::Result<()> + Send + Sync>;

/// Write path a handler uses to change state on behalf of its caller.
///
/// Implemented by the store; every write is attributed to `connection`,
/// so agent-scoped keys land in that connection's state.
#[async_trait]
pub trait StateWriter: Send + Sync {
    async fn write(&self, partial: StateMap, connection: &ConnectionId) -> Result<StateChanges>;
}

/// A named remote procedure: a handler plus an optional validator.
#[derive(Clone)]
pub struct ActionDef {
    handler: ActionHandler,
    validator: Option<ActionValidator>,
}

impl ActionDef {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(ActionContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |ctx, args| Box::pin(handler(ctx, args))),
            validator: None,
        }
    }

    pub fn with_validator<V>(mut self, validator: V) -> Self
    where
        V: Fn(&[Value]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn handler(&self) -> &ActionHandler {
        &self.handler
    }

    pub fn validator(&self) -> Option<&ActionValidator> {
        self.validator.as_ref()
    }
}

impl fmt::Debug for ActionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDef")
            .field("validator", &self.validator.is_some())
            .finish_non_exhaustive()
    }
}

/// Everything a handler can see and do while it runs.
#[derive(Clone)]
pub struct ActionContext {
    state: Arc<StateMap>,
    caller: ConnectionInfo,
    writer: Arc<dyn StateWriter>,
}

impl ActionContext {
    pub fn new(state: StateMap, caller: ConnectionInfo, writer: Arc<dyn StateWriter>) -> Self {
        Self {
            state: Arc::new(state),
            caller,
            writer,
        }
    }

    /// Snapshot taken when the action started (shared ∪ caller's scoped state).
    pub fn state(&self) -> &StateMap {
        &self.state
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    pub fn agent_id(&self) -> &ConnectionId {
        &self.caller.id
    }

    pub fn agent_location(&self) -> &AgentLocation {
        &self.caller.location
    }

    pub fn caller(&self) -> &ConnectionInfo {
        &self.caller
    }

    /// Apply a write as if the caller had sent it. Takes effect and notifies
    /// immediately; there is no transaction around the whole handler.
    pub async fn set_state(&self, partial: StateMap) -> Result<StateChanges> {
        self.writer.write(partial, &self.caller.id).await
    }
}

impl fmt::Debug for ActionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionContext")
            .field("caller", &self.caller.id)
            .field("keys", &self.state.len())
            .finish_non_exhaustive()
    }
}
