use std::path::Path;
use std::sync::Arc;

use crann_config::StorageConfig;
use crann_core::Persist;

use crate::area::KvArea;
use crate::memory::MemoryArea;
use crate::sqlite::SqliteArea;

/// Label of the durable tier.
pub const DURABLE_AREA: &str = "local";
/// Label of the session tier.
pub const SESSION_AREA: &str = "session";

/// The two storage tiers a store persists into.
#[derive(Clone)]
pub struct StorageTiers {
    pub durable: Arc<dyn KvArea>,
    pub session: Arc<dyn KvArea>,
}

impl StorageTiers {
    pub fn new(durable: Arc<dyn KvArea>, session: Arc<dyn KvArea>) -> Self {
        Self { durable, session }
    }

    /// Both tiers in memory (for tests and ephemeral stores).
    pub fn in_memory() -> Self {
        Self {
            durable: Arc::new(MemoryArea::new(DURABLE_AREA)),
            session: Arc::new(MemoryArea::new(SESSION_AREA)),
        }
    }

    /// Durable tier in the SQLite file at `path`; session tier in memory.
    pub fn sqlite(path: &Path) -> crann_core::Result<Self> {
        Ok(Self {
            durable: Arc::new(SqliteArea::open(path, DURABLE_AREA)?),
            session: Arc::new(MemoryArea::new(SESSION_AREA)),
        })
    }

    /// SQLite when a path is given, memory otherwise.
    pub fn open(path: Option<&Path>) -> crann_core::Result<Self> {
        match path {
            Some(path) => Self::sqlite(path),
            None => Ok(Self::in_memory()),
        }
    }

    /// Tiers as the `[storage]` section of `crann.toml` describes them.
    pub fn from_config(config: &StorageConfig) -> crann_core::Result<Self> {
        Self::open(config.sqlite_path())
    }

    /// The tier a persist mode routes to; `None` for memory-only keys.
    pub fn area(&self, persist: Persist) -> Option<&Arc<dyn KvArea>> {
        match persist {
            Persist::Durable => Some(&self.durable),
            Persist::Session => Some(&self.session),
            Persist::None => None,
        }
    }

    /// Both tiers, durable first.
    pub fn all(&self) -> [(Persist, &Arc<dyn KvArea>); 2] {
        [
            (Persist::Durable, &self.durable),
            (Persist::Session, &self.session),
        ]
    }
}
