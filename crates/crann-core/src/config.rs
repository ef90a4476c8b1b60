use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::ActionDef;
use crate::error::{CrannError, Result};
use crate::types::StateMap;

static STORE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").expect("store name pattern is valid")
});

/// Who can see a state key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// One copy, owned by the store, mirrored to every agent.
    #[default]
    Shared,
    /// One copy per connection, created on connect and dropped on disconnect.
    Agent,
}

/// Durability class of a shared key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Persist {
    /// Survives process restart.
    Durable,
    /// Survives only the current session.
    Session,
    /// Memory only.
    #[default]
    None,
}

impl Persist {
    pub fn is_persisted(self) -> bool {
        !matches!(self, Persist::None)
    }
}

/// What to do with keys a write names that the config does not declare.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownKeys {
    /// Drop them and apply the rest.
    #[default]
    Ignore,
    /// Fail the whole write.
    Reject,
}

/// Declaration of one state key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateItem {
    pub default: Value,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub persist: Persist,
}

impl StateItem {
    pub fn new(default: Value) -> Self {
        Self {
            default,
            scope: Scope::Shared,
            persist: Persist::None,
        }
    }

    /// A shared key with the given default.
    pub fn shared(default: Value) -> Self {
        Self::new(default)
    }

    /// An agent-scoped key with the given default.
    pub fn agent(default: Value) -> Self {
        Self::new(default).scope(Scope::Agent)
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn persist(mut self, persist: Persist) -> Self {
        self.persist = persist;
        self
    }
}

/// Full store definition: identity, state items and remote actions.
///
/// Built with [`StoreConfig::builder`]; identity is fixed once built.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    name: String,
    version: u32,
    items: BTreeMap<String, StateItem>,
    actions: BTreeMap<String, ActionDef>,
    unknown_keys: UnknownKeys,
}

impl StoreConfig {
    pub fn builder(name: impl Into<String>) -> StoreConfigBuilder {
        StoreConfigBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn items(&self) -> &BTreeMap<String, StateItem> {
        &self.items
    }

    pub fn item(&self, key: &str) -> Option<&StateItem> {
        self.items.get(key)
    }

    pub fn actions(&self) -> &BTreeMap<String, ActionDef> {
        &self.actions
    }

    pub fn action(&self, name: &str) -> Option<&ActionDef> {
        self.actions.get(name)
    }

    pub fn unknown_keys(&self) -> UnknownKeys {
        self.unknown_keys
    }

    /// Defaults for every key of the given scope.
    pub fn defaults_for(&self, scope: Scope) -> StateMap {
        self.items
            .iter()
            .filter(|(_, item)| item.scope == scope)
            .map(|(k, item)| (k.clone(), item.default.clone()))
            .collect()
    }

    /// Defaults for every declared key, as an agent sees them before connecting.
    pub fn all_defaults(&self) -> StateMap {
        self.items
            .iter()
            .map(|(k, item)| (k.clone(), item.default.clone()))
            .collect()
    }

    /// Shared keys that map to a storage tier.
    pub fn persisted_keys(&self) -> impl Iterator<Item = (&String, Persist)> {
        self.items
            .iter()
            .filter(|(_, item)| item.scope == Scope::Shared && item.persist.is_persisted())
            .map(|(k, item)| (k, item.persist))
    }

    /// Check identity, keys and actions. Called by [`StoreConfigBuilder::build`].
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        if self.version == 0 {
            return Err(CrannError::ConfigValidation {
                field: "version".into(),
                reason: "version must be a positive integer".into(),
            });
        }
        for (key, item) in &self.items {
            if key.is_empty() {
                return Err(CrannError::ConfigValidation {
                    field: "state".into(),
                    reason: "state keys must not be empty".into(),
                });
            }
            if item.scope == Scope::Agent && item.persist.is_persisted() {
                return Err(CrannError::ConfigValidation {
                    field: format!("state.{key}.persist"),
                    reason: "only shared keys can be persisted".into(),
                });
            }
        }
        if self.actions.keys().any(|name| name.is_empty()) {
            return Err(CrannError::ConfigValidation {
                field: "actions".into(),
                reason: "action names must not be empty".into(),
            });
        }
        Ok(())
    }
}

/// Validate a store name against `^[A-Za-z][A-Za-z0-9_-]*$`.
pub fn validate_name(name: &str) -> Result<()> {
    if STORE_NAME.is_match(name) {
        Ok(())
    } else {
        Err(CrannError::ConfigValidation {
            field: "name".into(),
            reason: format!(
                "'{name}' must start with a letter and contain only letters, digits, '_' or '-'"
            ),
        })
    }
}

/// Builder for [`StoreConfig`]. Problems are collected and reported by `build`.
#[derive(Debug)]
pub struct StoreConfigBuilder {
    name: String,
    version: u32,
    items: BTreeMap<String, StateItem>,
    actions: BTreeMap<String, ActionDef>,
    unknown_keys: UnknownKeys,
    problems: Vec<CrannError>,
}

impl StoreConfigBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 1,
            items: BTreeMap::new(),
            actions: BTreeMap::new(),
            unknown_keys: UnknownKeys::Ignore,
            problems: Vec::new(),
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn unknown_keys(mut self, policy: UnknownKeys) -> Self {
        self.unknown_keys = policy;
        self
    }

    pub fn item(mut self, key: impl Into<String>, item: StateItem) -> Self {
        let key = key.into();
        if self.items.contains_key(&key) {
            self.problems.push(CrannError::ConfigValidation {
                field: format!("state.{key}"),
                reason: "declared more than once".into(),
            });
        } else {
            self.items.insert(key, item);
        }
        self
    }

    pub fn action(mut self, name: impl Into<String>, action: ActionDef) -> Self {
        let name = name.into();
        if self.actions.contains_key(&name) {
            self.problems.push(CrannError::ConfigValidation {
                field: format!("actions.{name}"),
                reason: "declared more than once".into(),
            });
        } else {
            self.actions.insert(name, action);
        }
        self
    }

    pub fn build(mut self) -> Result<StoreConfig> {
        if !self.problems.is_empty() {
            return Err(self.problems.remove(0));
        }
        let config = StoreConfig {
            name: self.name,
            version: self.version,
            items: self.items,
            actions: self.actions,
            unknown_keys: self.unknown_keys,
        };
        config.validate()?;
        Ok(config)
    }
}
