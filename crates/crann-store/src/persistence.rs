use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use crann_core::{CrannError, Persist, Result, StateMap, StoreConfig};
use crann_storage::{KvArea, KvMap, StorageTiers};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const NAMESPACE: &str = "crann";
const META_SUFFIX: &str = "__meta";

/// `crann:{name}:v{version}:{key}`
pub fn value_key(name: &str, version: u32, key: &str) -> String {
    format!("{NAMESPACE}:{name}:v{version}:{key}")
}

/// `crann:{name}:__meta`
pub fn meta_key(name: &str) -> String {
    format!("{NAMESPACE}:{name}:{META_SUFFIX}")
}

/// Store name a persisted key belongs to, if it is a Crann key at all.
fn store_name_of(full_key: &str) -> Option<&str> {
    full_key
        .strip_prefix(NAMESPACE)?
        .strip_prefix(':')?
        .split(':')
        .next()
        .filter(|name| !name.is_empty())
}

/// Bookkeeping record kept next to a store's values in the durable tier.
/// Timestamps are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreMeta {
    pub version: u32,
    pub created_at: i64,
    pub last_accessed: i64,
}

/// Maps persisted shared keys of one store to and from its storage tiers.
pub struct Persistence {
    name: String,
    version: u32,
    keys: BTreeMap<String, Persist>,
    tiers: StorageTiers,
}

impl Persistence {
    pub fn new(config: &StoreConfig, tiers: StorageTiers) -> Self {
        Self {
            name: config.name().to_string(),
            version: config.version(),
            keys: config
                .persisted_keys()
                .map(|(key, persist)| (key.clone(), persist))
                .collect(),
            tiers,
        }
    }

    pub fn tiers(&self) -> &StorageTiers {
        &self.tiers
    }

    fn value_prefix(&self) -> String {
        format!("{NAMESPACE}:{}:v{}:", self.name, self.version)
    }

    /// Load every value persisted by this exact name and version.
    ///
    /// Keys of other stores, other versions, undeclared keys and keys
    /// found in the wrong tier are ignored. Refreshes the meta record.
    pub async fn hydrate(&self) -> Result<StateMap> {
        let prefix = self.value_prefix();
        let mut values = StateMap::new();
        for (persist, area) in self.tiers.all() {
            for (full_key, value) in area.get(None).await? {
                let Some(key) = full_key.strip_prefix(&prefix) else {
                    continue;
                };
                if self.keys.get(key) == Some(&persist) {
                    values.insert(key.to_string(), value);
                }
            }
        }
        self.touch_meta().await?;
        info!(store = %self.name, version = self.version, keys = values.len(), "hydrated persisted state");
        Ok(values)
    }

    /// Upsert the meta record, keeping the original `createdAt`.
    async fn touch_meta(&self) -> Result<StoreMeta> {
        let now = chrono::Utc::now().timestamp_millis();
        let created_at = self
            .meta()
            .await?
            .map(|meta| meta.created_at)
            .unwrap_or(now);
        let meta = StoreMeta {
            version: self.version,
            created_at,
            last_accessed: now,
        };
        let mut entry = KvMap::new();
        entry.insert(meta_key(&self.name), serde_json::to_value(&meta)?);
        self.tiers.durable.set(entry).await?;
        Ok(meta)
    }

    /// The meta record, if one exists and parses.
    pub async fn meta(&self) -> Result<Option<StoreMeta>> {
        let key = meta_key(&self.name);
        let mut found = self
            .tiers
            .durable
            .get(Some(std::slice::from_ref(&key)))
            .await?;
        Ok(found
            .remove(&key)
            .and_then(|raw| serde_json::from_value(raw).ok()))
    }

    /// Write changed shared values, one batch per tier. Keys that are not
    /// persisted are skipped.
    pub async fn persist(&self, changes: &StateMap) -> Result<()> {
        let mut durable = KvMap::new();
        let mut session = KvMap::new();
        for (key, value) in changes {
            let full_key = value_key(&self.name, self.version, key);
            match self.keys.get(key) {
                Some(Persist::Durable) => {
                    durable.insert(full_key, value.clone());
                }
                Some(Persist::Session) => {
                    session.insert(full_key, value.clone());
                }
                _ => {}
            }
        }
        if !durable.is_empty() {
            debug!(store = %self.name, keys = durable.len(), "persisting durable keys");
            self.tiers.durable.set(durable).await?;
        }
        if !session.is_empty() {
            debug!(store = %self.name, keys = session.len(), "persisting session keys");
            self.tiers.session.set(session).await?;
        }
        Ok(())
    }

    /// Remove every value of this name and version, and the meta record,
    /// from both tiers.
    pub async fn clear_all(&self) -> Result<()> {
        let prefix = self.value_prefix();
        let meta = meta_key(&self.name);
        for (_, area) in self.tiers.all() {
            let doomed: Vec<String> = area
                .get(None)
                .await?
                .into_keys()
                .filter(|key| key.starts_with(&prefix) || *key == meta)
                .collect();
            area.remove(&doomed).await?;
        }
        info!(store = %self.name, version = self.version, "cleared persisted state");
        Ok(())
    }

    /// Find (and unless `dry_run`, delete) every Crann key in either tier
    /// whose store name is not in `keep_names`. The matched keys are
    /// returned either way.
    pub async fn clear_orphaned_data(
        tiers: &StorageTiers,
        keep_names: &[&str],
        dry_run: bool,
    ) -> Result<BTreeSet<String>> {
        let mut matched = BTreeSet::new();
        for (_, area) in tiers.all() {
            let orphans = orphans_in(&**area, keep_names).await?;
            if !dry_run {
                area.remove(&orphans).await?;
            }
            matched.extend(orphans);
        }
        info!(orphans = matched.len(), dry_run, "scanned for orphaned store data");
        Ok(matched)
    }
}

async fn orphans_in(area: &dyn KvArea, keep_names: &[&str]) -> Result<Vec<String>> {
    Ok(area
        .get(None)
        .await?
        .into_keys()
        .filter(|key| store_name_of(key).is_some_and(|name| !keep_names.contains(&name)))
        .collect())
}

/// Advisory registry of store names in use in one process. Two stores with
/// one name would share a persisted key range; nothing enforces this
/// unless the caller checks.
#[derive(Clone, Default)]
pub struct StoreNameClaims {
    names: Arc<Mutex<HashSet<String>>>,
}

impl StoreNameClaims {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, name: &str) -> Result<()> {
        if self.names.lock().contains(name) {
            return Err(CrannError::StorageCollision(format!(
                "store name '{name}' is already in use; persisted keys would collide"
            )));
        }
        Ok(())
    }

    pub fn claim(&self, name: &str) -> Result<()> {
        let mut names = self.names.lock();
        if !names.insert(name.to_string()) {
            return Err(CrannError::StorageCollision(format!(
                "store name '{name}' is already in use; persisted keys would collide"
            )));
        }
        Ok(())
    }

    pub fn release(&self, name: &str) -> bool {
        self.names.lock().remove(name)
    }
}
