use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

/// Raw key → JSON value map as read from or written to a storage area.
pub type KvMap = BTreeMap<String, Value>;

/// One independently namespaced key-value area.
///
/// Mirrors a browser-style storage area: read some or all keys, write a
/// batch, remove a batch. No transaction spans two areas.
#[async_trait]
pub trait KvArea: Send + Sync {
    /// Short name used in logs ("local", "session", ...).
    fn label(&self) -> &str;

    /// Read the given keys, or the whole area when `keys` is `None`.
    /// Missing keys are simply absent from the result.
    async fn get(&self, keys: Option<&[String]>) -> crann_core::Result<KvMap>;

    /// Write every entry of `items` in one batch.
    async fn set(&self, items: KvMap) -> crann_core::Result<()>;

    /// Delete the given keys. Unknown keys are ignored.
    async fn remove(&self, keys: &[String]) -> crann_core::Result<()>;
}
