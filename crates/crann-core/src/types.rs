use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key → value map used for every state snapshot and partial update.
pub type StateMap = Map<String, Value>;

/// Identifier of one live agent ↔ store link.
pub type ConnectionId = String;

/// Identifier returned when registering a listener or subscriber.
pub type SubscriptionId = u64;

/// Where an agent lives (which context, which tab, which frame).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentLocation {
    /// Execution context, e.g. "popup", "content", "sidepanel", "worker".
    pub context: String,
    #[serde(default)]
    pub tab_id: Option<i64>,
    #[serde(default)]
    pub frame_id: Option<i64>,
}

impl AgentLocation {
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            tab_id: None,
            frame_id: None,
        }
    }

    pub fn with_tab(mut self, tab_id: i64) -> Self {
        self.tab_id = Some(tab_id);
        self
    }

    pub fn with_frame(mut self, frame_id: i64) -> Self {
        self.frame_id = Some(frame_id);
        self
    }
}

/// Identity of one connected agent as tracked by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    #[serde(flatten)]
    pub location: AgentLocation,
    pub connected_at: DateTime<Utc>,
}

impl ConnectionInfo {
    pub fn new(id: impl Into<ConnectionId>, location: AgentLocation) -> Self {
        Self {
            id: id.into(),
            location,
            connected_at: Utc::now(),
        }
    }

    pub fn context(&self) -> &str {
        &self.location.context
    }

    pub fn tab_id(&self) -> Option<i64> {
        self.location.tab_id
    }

    pub fn frame_id(&self) -> Option<i64> {
        self.location.frame_id
    }
}

/// Filter over connected agents. Every field that is set must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentQuery {
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub tab_id: Option<i64>,
    #[serde(default)]
    pub frame_id: Option<i64>,
}

impl AgentQuery {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn tab(mut self, tab_id: i64) -> Self {
        self.tab_id = Some(tab_id);
        self
    }

    pub fn frame(mut self, frame_id: i64) -> Self {
        self.frame_id = Some(frame_id);
        self
    }

    pub fn matches(&self, info: &ConnectionInfo) -> bool {
        if let Some(ref context) = self.context {
            if info.location.context != *context {
                return false;
            }
        }
        if self.tab_id.is_some() && info.location.tab_id != self.tab_id {
            return false;
        }
        if self.frame_id.is_some() && info.location.frame_id != self.frame_id {
            return false;
        }
        true
    }
}

/// The changes a write actually applied, split by scope.
///
/// Only keys whose value differs from the previous value appear here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateChanges {
    pub shared: StateMap,
    pub scoped: StateMap,
}

impl StateChanges {
    pub fn is_empty(&self) -> bool {
        self.shared.is_empty() && self.scoped.is_empty()
    }

    /// Shared and scoped changes in one map.
    pub fn merged(&self) -> StateMap {
        let mut all = self.shared.clone();
        for (k, v) in &self.scoped {
            all.insert(k.clone(), v.clone());
        }
        all
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.shared.keys().chain(self.scoped.keys())
    }
}

/// Overlay `patch` onto `base`, returning the combined map.
pub fn overlay(base: &StateMap, patch: &StateMap) -> StateMap {
    let mut out = base.clone();
    for (k, v) in patch {
        out.insert(k.clone(), v.clone());
    }
    out
}
