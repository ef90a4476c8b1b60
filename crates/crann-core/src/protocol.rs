use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ConnectionInfo, StateMap};

/// Correlation id of one RPC call, unique within one agent's connection.
pub type CallId = u64;

/// Every message exchanged between an agent and the store.
///
/// On the wire this is `{"action": "<name>", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "action",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Envelope {
    /// Agent → store: apply a partial update attributed to the sender.
    SetState { state: StateMap },
    /// Agent → store: invoke a named action.
    Rpc {
        call_id: CallId,
        action: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    /// Store → one agent: outcome of an `Rpc`.
    RpcResult(RpcResponse),
    /// Store → one agent: personalised snapshot pushed when the link is ready.
    InitialState { state: StateMap, info: ConnectionInfo },
    /// Store → agents: keys that changed.
    StateUpdate { state: StateMap },
}

impl Envelope {
    /// The wire name of this message.
    pub fn action(&self) -> &'static str {
        match self {
            Envelope::SetState { .. } => "setState",
            Envelope::Rpc { .. } => "rpc",
            Envelope::RpcResult(_) => "rpcResult",
            Envelope::InitialState { .. } => "initialState",
            Envelope::StateUpdate { .. } => "stateUpdate",
        }
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// `{success, result}` or `{success: false, error}` for one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse {
    pub call_id: CallId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn ok(call_id: CallId, result: Value) -> Self {
        Self {
            call_id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(call_id: CallId, error: impl Into<String>) -> Self {
        Self {
            call_id,
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}
