use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use crann_core::CrannError;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::area::{KvArea, KvMap};

fn storage_err(e: impl std::fmt::Display) -> CrannError {
    CrannError::Storage(e.to_string())
}

/// SQLite-backed storage area. Several areas may share one database file;
/// each row is keyed by `(area, key)`.
pub struct SqliteArea {
    area: String,
    db: Arc<Mutex<Connection>>,
}

impl SqliteArea {
    /// Open or create the database at `path` and bind to `area`.
    pub fn open(path: &Path, area: &str) -> crann_core::Result<Self> {
        info!(?path, area, "opening sqlite storage area");
        let conn = Connection::open(path).map_err(storage_err)?;
        Self::with_connection(Arc::new(Mutex::new(conn)), area)
    }

    /// Open an in-memory database (for tests).
    pub fn open_in_memory(area: &str) -> crann_core::Result<Self> {
        Self::open(Path::new(":memory:"), area)
    }

    /// Bind another area to an already opened connection.
    pub fn with_connection(db: Arc<Mutex<Connection>>, area: &str) -> crann_core::Result<Self> {
        {
            let conn = db.lock();
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
                .map_err(storage_err)?;
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS kv_entries (
                    area TEXT NOT NULL,
                    key TEXT NOT NULL,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (area, key)
                );
                ",
            )
            .map_err(storage_err)?;
        }
        Ok(Self {
            area: area.to_string(),
            db,
        })
    }

    /// The shared connection, so a sibling area can reuse it.
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.db)
    }
}

#[async_trait]
impl KvArea for SqliteArea {
    fn label(&self) -> &str {
        &self.area
    }

    async fn get(&self, keys: Option<&[String]>) -> crann_core::Result<KvMap> {
        let db = self.db.lock();
        let mut out = KvMap::new();
        match keys {
            None => {
                let mut stmt = db
                    .prepare("SELECT key, value FROM kv_entries WHERE area = ?1")
                    .map_err(storage_err)?;
                let rows = stmt
                    .query_map([&self.area], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })
                    .map_err(storage_err)?;
                for row in rows {
                    let (key, raw) = row.map_err(storage_err)?;
                    out.insert(key, serde_json::from_str(&raw)?);
                }
            }
            Some(keys) => {
                let mut stmt = db
                    .prepare("SELECT value FROM kv_entries WHERE area = ?1 AND key = ?2")
                    .map_err(storage_err)?;
                for key in keys {
                    let raw: Option<String> = stmt
                        .query_row(rusqlite::params![self.area, key], |row| row.get(0))
                        .optional()
                        .map_err(storage_err)?;
                    if let Some(raw) = raw {
                        out.insert(key.clone(), serde_json::from_str(&raw)?);
                    }
                }
            }
        }
        Ok(out)
    }

    async fn set(&self, items: KvMap) -> crann_core::Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let now = chrono::Utc::now().to_rfc3339();
        let mut db = self.db.lock();
        let tx = db.transaction().map_err(storage_err)?;
        for (key, value) in &items {
            let raw = serde_json::to_string(value)?;
            tx.execute(
                "INSERT INTO kv_entries (area, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(area, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                rusqlite::params![self.area, key, raw, now],
            )
            .map_err(storage_err)?;
        }
        tx.commit().map_err(storage_err)?;
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> crann_core::Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut db = self.db.lock();
        let tx = db.transaction().map_err(storage_err)?;
        for key in keys {
            tx.execute(
                "DELETE FROM kv_entries WHERE area = ?1 AND key = ?2",
                rusqlite::params![self.area, key],
            )
            .map_err(storage_err)?;
        }
        tx.commit().map_err(storage_err)?;
        Ok(())
    }
}
