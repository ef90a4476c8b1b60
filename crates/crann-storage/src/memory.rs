use async_trait::async_trait;
use parking_lot::RwLock;

use crate::area::{KvArea, KvMap};

/// In-process storage area. Contents die with the process, which makes it
/// the natural session tier.
pub struct MemoryArea {
    label: String,
    entries: RwLock<KvMap>,
}

impl MemoryArea {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            entries: RwLock::new(KvMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl KvArea for MemoryArea {
    fn label(&self) -> &str {
        &self.label
    }

    async fn get(&self, keys: Option<&[String]>) -> crann_core::Result<KvMap> {
        let entries = self.entries.read();
        Ok(match keys {
            None => entries.clone(),
            Some(keys) => keys
                .iter()
                .filter_map(|k| entries.get(k).map(|v| (k.clone(), v.clone())))
                .collect(),
        })
    }

    async fn set(&self, items: KvMap) -> crann_core::Result<()> {
        self.entries.write().extend(items);
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> crann_core::Result<()> {
        let mut entries = self.entries.write();
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }
}
