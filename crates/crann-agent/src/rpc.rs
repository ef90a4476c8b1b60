use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crann_core::{CallId, CrannError, Result, RpcResponse};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::agent::Agent;

struct PendingCall {
    action: String,
    reply: oneshot::Sender<Result<Value>>,
}

/// In-flight RPC calls of one agent, keyed by correlation id.
///
/// Ids increase monotonically for the life of the agent and are never
/// reused, so a late reply can only ever match its own call.
#[derive(Default)]
pub(crate) struct PendingCalls {
    last_id: AtomicU64,
    waiting: Mutex<HashMap<CallId, PendingCall>>,
}

impl PendingCalls {
    /// Allocate a call id and the receiver its outcome will arrive on.
    pub(crate) fn register(&self, action: &str) -> (CallId, oneshot::Receiver<Result<Value>>) {
        let call_id = self.last_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (reply, rx) = oneshot::channel();
        self.waiting.lock().insert(
            call_id,
            PendingCall {
                action: action.to_string(),
                reply,
            },
        );
        (call_id, rx)
    }

    /// Settle the call `response` answers. Returns false for unknown ids.
    pub(crate) fn resolve(&self, response: RpcResponse) -> bool {
        let Some(call) = self.waiting.lock().remove(&response.call_id) else {
            debug!(call_id = response.call_id, "reply for unknown call");
            return false;
        };
        let outcome = if response.success {
            Ok(response.result.unwrap_or(Value::Null))
        } else {
            Err(CrannError::Remote {
                action: call.action,
                message: response.error.unwrap_or_default(),
            })
        };
        // The caller may have stopped waiting.
        let _ = call.reply.send(outcome);
        true
    }

    pub(crate) fn cancel(&self, call_id: CallId) {
        self.waiting.lock().remove(&call_id);
    }

    /// Fail every waiting call; returns how many there were.
    pub(crate) fn reject_all(&self, reason: &str) -> usize {
        let drained: Vec<PendingCall> = self.waiting.lock().drain().map(|(_, c)| c).collect();
        let count = drained.len();
        for call in drained {
            let _ = call.reply.send(Err(CrannError::Disconnected(format!(
                "{reason} while '{}' was in flight",
                call.action
            ))));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.waiting.lock().len()
    }
}

/// Drops a call's table entry when its caller stops waiting. Settled calls
/// are already gone, so dropping after a reply is a no-op.
pub(crate) struct CallGuard<'a> {
    calls: &'a PendingCalls,
    call_id: CallId,
}

impl<'a> CallGuard<'a> {
    pub(crate) fn new(calls: &'a PendingCalls, call_id: CallId) -> Self {
        Self { calls, call_id }
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.calls.cancel(self.call_id);
    }
}

/// A callable handle for one named action.
///
/// Stubs are cheap; build one per action name and keep it around.
#[derive(Clone)]
pub struct ActionStub {
    agent: Agent,
    name: String,
}

impl ActionStub {
    pub(crate) fn new(agent: Agent, name: String) -> Self {
        Self { agent, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn invoke(&self, args: Vec<Value>) -> Result<Value> {
        self.agent.call(&self.name, args).await
    }

    pub async fn invoke_as<T: DeserializeOwned>(&self, args: Vec<Value>) -> Result<T> {
        self.agent.call_as(&self.name, args).await
    }
}

impl std::fmt::Debug for ActionStub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionStub").field("name", &self.name).finish()
    }
}
