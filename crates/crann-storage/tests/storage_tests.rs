#[cfg(test)]
mod tests {
    use crann_storage::*;
    use serde_json::json;

    fn kv(entries: &[(&str, serde_json::Value)]) -> KvMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    // ── Memory area ────────────────────────────────────────────

    mod memory {
        use super::*;

        #[tokio::test]
        async fn test_set_get_remove() {
            let area = MemoryArea::new("session");
            assert!(area.is_empty());
            area.set(kv(&[("a", json!(1)), ("b", json!({"x": true}))]))
                .await
                .unwrap();
            assert_eq!(area.len(), 2);

            let all = area.get(None).await.unwrap();
            assert_eq!(all["b"], json!({"x": true}));

            let some = area.get(Some(keys(&["a", "missing"]).as_slice())).await.unwrap();
            assert_eq!(some.len(), 1);
            assert_eq!(some["a"], json!(1));

            area.remove(&keys(&["a", "missing"])).await.unwrap();
            assert_eq!(area.get(None).await.unwrap().len(), 1);
            assert_eq!(area.label(), "session");
        }

        #[tokio::test]
        async fn test_set_overwrites() {
            let area = MemoryArea::new("local");
            area.set(kv(&[("a", json!(1))])).await.unwrap();
            area.set(kv(&[("a", json!(2))])).await.unwrap();
            assert_eq!(area.get(None).await.unwrap()["a"], json!(2));
        }
    }

    // ── SQLite area ────────────────────────────────────────────

    mod sqlite {
        use super::*;

        #[tokio::test]
        async fn test_roundtrip_in_memory() {
            let area = SqliteArea::open_in_memory("local").unwrap();
            area.set(kv(&[("crann:t:v1:count", json!(5)), ("x", json!([1, 2]))]))
                .await
                .unwrap();
            let all = area.get(None).await.unwrap();
            assert_eq!(all["crann:t:v1:count"], json!(5));
            assert_eq!(all["x"], json!([1, 2]));

            area.remove(&keys(&["x"])).await.unwrap();
            let some = area.get(Some(keys(&["x", "crann:t:v1:count"]).as_slice())).await.unwrap();
            assert_eq!(some.len(), 1);
        }

        #[tokio::test]
        async fn test_survives_reopen() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("crann.db");
            {
                let area = SqliteArea::open(&path, "local").unwrap();
                area.set(kv(&[("k", json!("persisted"))])).await.unwrap();
            }
            let reopened = SqliteArea::open(&path, "local").unwrap();
            assert_eq!(reopened.get(None).await.unwrap()["k"], json!("persisted"));
        }

        #[tokio::test]
        async fn test_areas_sharing_a_connection_are_isolated() {
            let local = SqliteArea::open_in_memory("local").unwrap();
            let other = SqliteArea::with_connection(local.connection(), "other").unwrap();
            local.set(kv(&[("k", json!(1))])).await.unwrap();
            other.set(kv(&[("k", json!(2))])).await.unwrap();
            assert_eq!(local.get(None).await.unwrap()["k"], json!(1));
            assert_eq!(other.get(None).await.unwrap()["k"], json!(2));
            other.remove(&keys(&["k"])).await.unwrap();
            assert_eq!(local.get(None).await.unwrap().len(), 1);
        }
    }

    // ── Tiers ──────────────────────────────────────────────────

    mod tiers {
        use super::*;
        use crann_core::Persist;

        #[tokio::test]
        async fn test_routing_by_persist_mode() {
            let tiers = StorageTiers::in_memory();
            assert_eq!(tiers.area(Persist::Durable).unwrap().label(), DURABLE_AREA);
            assert_eq!(tiers.area(Persist::Session).unwrap().label(), SESSION_AREA);
            assert!(tiers.area(Persist::None).is_none());
        }

        #[tokio::test]
        async fn test_sqlite_tiers_keep_session_in_memory() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("tiers.db");
            {
                let tiers = StorageTiers::sqlite(&path).unwrap();
                tiers.durable.set(kv(&[("d", json!(1))])).await.unwrap();
                tiers.session.set(kv(&[("s", json!(2))])).await.unwrap();
            }
            let tiers = StorageTiers::open(Some(&path)).unwrap();
            assert_eq!(tiers.durable.get(None).await.unwrap()["d"], json!(1));
            assert!(tiers.session.get(None).await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_tiers_from_storage_config() {
            use crann_config::{StorageBackend, StorageConfig};

            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("configured.db");
            let config = StorageConfig {
                backend: StorageBackend::Sqlite,
                path: Some(path.clone()),
            };
            {
                let tiers = StorageTiers::from_config(&config).unwrap();
                tiers.durable.set(kv(&[("k", json!("v"))])).await.unwrap();
            }
            assert!(path.exists());
            let reopened = SqliteArea::open(&path, DURABLE_AREA).unwrap();
            assert_eq!(reopened.get(None).await.unwrap()["k"], json!("v"));

            let memory = StorageTiers::from_config(&StorageConfig::default()).unwrap();
            memory.durable.set(kv(&[("k", json!(1))])).await.unwrap();
            assert_eq!(memory.durable.get(None).await.unwrap()["k"], json!(1));
        }
    }
}
