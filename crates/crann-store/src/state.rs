use std::collections::HashMap;
use std::sync::Arc;

use crann_core::{
    ConnectionId, CrannError, Result, Scope, StateChanges, StateMap, StoreConfig, UnknownKeys,
    overlay,
};
use tracing::debug;

/// What `clear()` reset: shared keys, and per connection its scoped keys.
#[derive(Debug, Default)]
pub struct ClearOutcome {
    pub shared: StateMap,
    pub scoped: HashMap<ConnectionId, StateMap>,
}

/// Canonical shared state plus one scoped map per live connection.
///
/// Every write goes through a key-by-key equality check; only values that
/// actually differ are applied and reported.
pub struct StateManager {
    config: Arc<StoreConfig>,
    shared_defaults: StateMap,
    agent_defaults: StateMap,
    shared: StateMap,
    scoped: HashMap<ConnectionId, StateMap>,
}

impl StateManager {
    pub fn new(config: Arc<StoreConfig>) -> Self {
        let shared_defaults = config.defaults_for(Scope::Shared);
        let agent_defaults = config.defaults_for(Scope::Agent);
        Self {
            shared: shared_defaults.clone(),
            shared_defaults,
            agent_defaults,
            scoped: HashMap::new(),
            config,
        }
    }

    pub fn get_shared_state(&self) -> StateMap {
        self.shared.clone()
    }

    /// Scoped state of one connection; defaults for an unknown id.
    pub fn get_agent_state(&self, id: &ConnectionId) -> StateMap {
        self.scoped
            .get(id)
            .cloned()
            .unwrap_or_else(|| self.agent_defaults.clone())
    }

    /// What one connection sees: shared state overlaid with its scoped state.
    pub fn get_full_state(&self, id: &ConnectionId) -> StateMap {
        overlay(&self.shared, &self.get_agent_state(id))
    }

    pub fn has_agent(&self, id: &ConnectionId) -> bool {
        self.scoped.contains_key(id)
    }

    pub fn agent_count(&self) -> usize {
        self.scoped.len()
    }

    /// Apply a partial update, routing each key by its scope.
    ///
    /// Agent-scoped keys need a `connection` with live scoped state;
    /// otherwise they are dropped. Undeclared keys follow the configured
    /// [`UnknownKeys`] policy.
    pub fn set_state(
        &mut self,
        partial: StateMap,
        connection: Option<&ConnectionId>,
    ) -> Result<StateChanges> {
        let partial = self.screen_unknown(partial)?;
        let mut changes = StateChanges::default();

        for (key, value) in partial {
            let Some(item) = self.config.item(&key) else {
                continue;
            };
            match item.scope {
                Scope::Shared => {
                    if self.shared.get(&key) != Some(&value) {
                        self.shared.insert(key.clone(), value.clone());
                        changes.shared.insert(key, value);
                    }
                }
                Scope::Agent => {
                    let Some(id) = connection else {
                        debug!(key = %key, "agent-scoped key without a connection, dropped");
                        continue;
                    };
                    let Some(scoped) = self.scoped.get_mut(id) else {
                        debug!(key = %key, connection = %id, "no scoped state for connection, dropped");
                        continue;
                    };
                    if scoped.get(&key) != Some(&value) {
                        scoped.insert(key.clone(), value.clone());
                        changes.scoped.insert(key, value);
                    }
                }
            }
        }
        Ok(changes)
    }

    /// Scoped-only write for one connection. Shared keys are ignored.
    pub fn set_agent_state(&mut self, id: &ConnectionId, partial: StateMap) -> Result<StateChanges> {
        let scoped_only: StateMap = self
            .screen_unknown(partial)?
            .into_iter()
            .filter(|(key, _)| {
                let agent = self
                    .config
                    .item(key)
                    .is_some_and(|item| item.scope == Scope::Agent);
                if !agent {
                    debug!(key = %key, "shared key in scoped write, dropped");
                }
                agent
            })
            .collect();
        self.set_state(scoped_only, Some(id))
    }

    /// Overlay persisted values onto shared state. Only declared shared keys
    /// are taken; the returned changes name what differed from before.
    pub fn hydrate_shared_state(&mut self, partial: StateMap) -> StateChanges {
        let mut changes = StateChanges::default();
        for (key, value) in partial {
            let shared = self
                .config
                .item(&key)
                .is_some_and(|item| item.scope == Scope::Shared);
            if shared && self.shared.get(&key) != Some(&value) {
                self.shared.insert(key.clone(), value.clone());
                changes.shared.insert(key, value);
            }
        }
        changes
    }

    pub fn initialize_agent_state(&mut self, id: &ConnectionId) {
        self.scoped
            .insert(id.clone(), self.agent_defaults.clone());
    }

    pub fn remove_agent_state(&mut self, id: &ConnectionId) -> bool {
        self.scoped.remove(id).is_some()
    }

    /// Reset shared and every scoped map to defaults. Reports only keys
    /// whose value moved.
    pub fn clear(&mut self) -> ClearOutcome {
        let mut outcome = ClearOutcome {
            shared: diff(&self.shared, &self.shared_defaults),
            scoped: HashMap::new(),
        };
        self.shared = self.shared_defaults.clone();

        for (id, scoped) in self.scoped.iter_mut() {
            let moved = diff(scoped, &self.agent_defaults);
            if !moved.is_empty() {
                outcome.scoped.insert(id.clone(), moved);
            }
            *scoped = self.agent_defaults.clone();
        }
        outcome
    }

    fn screen_unknown(&self, mut partial: StateMap) -> Result<StateMap> {
        let unknown: Vec<String> = partial
            .keys()
            .filter(|key| self.config.item(key).is_none())
            .cloned()
            .collect();
        if unknown.is_empty() {
            return Ok(partial);
        }
        match self.config.unknown_keys() {
            UnknownKeys::Reject => Err(CrannError::UnknownKeys { keys: unknown }),
            UnknownKeys::Ignore => {
                debug!(store = %self.config.name(), keys = ?unknown, "dropping undeclared keys");
                for key in &unknown {
                    partial.remove(key);
                }
                Ok(partial)
            }
        }
    }
}

/// Entries of `target` whose value differs from `current`.
fn diff(current: &StateMap, target: &StateMap) -> StateMap {
    target
        .iter()
        .filter(|(key, value)| current.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}
