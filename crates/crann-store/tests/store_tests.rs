#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crann_core::*;
    use crann_storage::{KvArea, KvMap, MemoryArea, StorageTiers};
    use crann_store::*;
    use serde_json::{Value, json};

    fn map(value: Value) -> StateMap {
        value.as_object().cloned().unwrap()
    }

    fn kv(entries: &[(&str, Value)]) -> KvMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn config() -> Arc<StoreConfig> {
        Arc::new(
            StoreConfig::builder("t")
                .item("count", StateItem::shared(json!(0)).persist(Persist::Durable))
                .item("theme", StateItem::shared(json!("light")).persist(Persist::Session))
                .item("filter", StateItem::shared(json!({"tags": []})))
                .item("cursor", StateItem::agent(json!(0)))
                .build()
                .unwrap(),
        )
    }

    // ── StateManager ───────────────────────────────────────────

    mod state_manager {
        use super::*;

        fn manager() -> StateManager {
            StateManager::new(config())
        }

        #[test]
        fn test_starts_from_defaults() {
            let state = manager();
            assert_eq!(
                state.get_shared_state(),
                map(json!({"count": 0, "theme": "light", "filter": {"tags": []}}))
            );
            assert_eq!(state.get_agent_state(&"nobody".into()), map(json!({"cursor": 0})));
        }

        #[test]
        fn test_set_state_reports_only_real_changes() {
            let mut state = manager();
            let changes = state
                .set_state(map(json!({"count": 5, "theme": "light"})), None)
                .unwrap();
            assert_eq!(changes.shared, map(json!({"count": 5})));
            assert!(changes.scoped.is_empty());
            assert_eq!(state.get_shared_state()["count"], json!(5));
        }

        #[test]
        fn test_deep_equal_write_is_a_no_op() {
            let mut state = manager();
            let changes = state
                .set_state(map(json!({"filter": {"tags": []}})), None)
                .unwrap();
            assert!(changes.is_empty());

            state
                .set_state(map(json!({"filter": {"tags": ["a", "b"]}})), None)
                .unwrap();
            let again = state
                .set_state(map(json!({"filter": {"tags": ["a", "b"]}})), None)
                .unwrap();
            assert!(again.is_empty());
        }

        #[test]
        fn test_agent_keys_need_a_connection() {
            let mut state = manager();
            let changes = state.set_state(map(json!({"cursor": 3})), None).unwrap();
            assert!(changes.is_empty());
        }

        #[test]
        fn test_scoped_state_is_isolated() {
            let mut state = manager();
            let a: ConnectionId = "a".into();
            let b: ConnectionId = "b".into();
            state.initialize_agent_state(&a);
            state.initialize_agent_state(&b);

            let changes = state.set_agent_state(&a, map(json!({"cursor": 9}))).unwrap();
            assert_eq!(changes.scoped, map(json!({"cursor": 9})));
            assert_eq!(state.get_agent_state(&a)["cursor"], json!(9));
            assert_eq!(state.get_agent_state(&b)["cursor"], json!(0));
            assert_eq!(state.get_full_state(&a)["cursor"], json!(9));
            assert_eq!(state.get_full_state(&a)["count"], json!(0));
        }

        #[test]
        fn test_set_state_splits_by_scope() {
            let mut state = manager();
            let a: ConnectionId = "a".into();
            state.initialize_agent_state(&a);
            let changes = state
                .set_state(map(json!({"count": 1, "cursor": 2})), Some(&a))
                .unwrap();
            assert_eq!(changes.shared, map(json!({"count": 1})));
            assert_eq!(changes.scoped, map(json!({"cursor": 2})));
        }

        #[test]
        fn test_set_agent_state_ignores_shared_keys() {
            let mut state = manager();
            let a: ConnectionId = "a".into();
            state.initialize_agent_state(&a);
            let changes = state
                .set_agent_state(&a, map(json!({"count": 7, "cursor": 1})))
                .unwrap();
            assert!(changes.shared.is_empty());
            assert_eq!(state.get_shared_state()["count"], json!(0));
        }

        #[test]
        fn test_writes_for_removed_connection_are_dropped() {
            let mut state = manager();
            let a: ConnectionId = "a".into();
            state.initialize_agent_state(&a);
            assert!(state.remove_agent_state(&a));
            let changes = state.set_agent_state(&a, map(json!({"cursor": 5}))).unwrap();
            assert!(changes.is_empty());
            assert!(!state.has_agent(&a));
            assert_eq!(state.agent_count(), 0);
        }

        #[test]
        fn test_unknown_keys_dropped_by_default() {
            let mut state = manager();
            let changes = state
                .set_state(map(json!({"bogus": 1, "count": 2})), None)
                .unwrap();
            assert_eq!(changes.shared, map(json!({"count": 2})));
            assert!(!state.get_shared_state().contains_key("bogus"));
        }

        #[test]
        fn test_unknown_keys_rejected_when_configured() {
            let config = StoreConfig::builder("strict")
                .item("count", StateItem::shared(json!(0)))
                .unknown_keys(UnknownKeys::Reject)
                .build()
                .unwrap();
            let mut state = StateManager::new(Arc::new(config));
            let err = state
                .set_state(map(json!({"bogus": 1, "count": 2})), None)
                .unwrap_err();
            assert!(matches!(err, CrannError::UnknownKeys { ref keys } if keys == &vec!["bogus".to_string()]));
            assert_eq!(state.get_shared_state()["count"], json!(0));
        }

        #[test]
        fn test_hydrate_takes_only_shared_keys() {
            let mut state = manager();
            let changes =
                state.hydrate_shared_state(map(json!({"count": 4, "cursor": 8, "bogus": 1})));
            assert_eq!(changes.shared, map(json!({"count": 4})));
            assert_eq!(state.get_shared_state()["count"], json!(4));
            assert!(!state.get_shared_state().contains_key("cursor"));
        }

        #[test]
        fn test_clear_resets_and_reports_moved_keys() {
            let mut state = manager();
            let a: ConnectionId = "a".into();
            let b: ConnectionId = "b".into();
            state.initialize_agent_state(&a);
            state.initialize_agent_state(&b);
            state
                .set_state(map(json!({"count": 3, "cursor": 1})), Some(&a))
                .unwrap();

            let outcome = state.clear();
            assert_eq!(outcome.shared, map(json!({"count": 0})));
            assert_eq!(outcome.scoped.len(), 1);
            assert_eq!(outcome.scoped[&a], map(json!({"cursor": 0})));
            assert_eq!(state.get_shared_state()["count"], json!(0));
            assert_eq!(state.get_agent_state(&a)["cursor"], json!(0));
        }
    }

    // ── Persistence ────────────────────────────────────────────

    mod persistence {
        use super::*;

        #[test]
        fn test_key_layout() {
            assert_eq!(value_key("t", 1, "count"), "crann:t:v1:count");
            assert_eq!(meta_key("t"), "crann:t:__meta");
        }

        #[tokio::test]
        async fn test_persist_routes_by_tier() {
            let tiers = StorageTiers::in_memory();
            let persistence = Persistence::new(&config(), tiers.clone());
            persistence
                .persist(&map(json!({"count": 5, "theme": "dark", "filter": {"tags": [1]}})))
                .await
                .unwrap();

            let durable = tiers.durable.get(None).await.unwrap();
            let session = tiers.session.get(None).await.unwrap();
            assert_eq!(durable, kv(&[("crann:t:v1:count", json!(5))]));
            assert_eq!(session, kv(&[("crann:t:v1:theme", json!("dark"))]));
        }

        #[tokio::test]
        async fn test_hydrate_filters_foreign_and_stale_keys() {
            let tiers = StorageTiers::in_memory();
            tiers
                .durable
                .set(kv(&[
                    ("crann:t:v1:count", json!(7)),
                    ("crann:t:v2:count", json!(99)),
                    ("crann:other:v1:count", json!(42)),
                    ("crann:t:v1:cursor", json!(3)),
                    ("crann:t:v1:filter", json!({"tags": ["x"]})),
                    // session key sitting in the durable tier
                    ("crann:t:v1:theme", json!("wrong-tier")),
                    ("unrelated", json!(true)),
                ]))
                .await
                .unwrap();
            tiers
                .session
                .set(kv(&[("crann:t:v1:theme", json!("dark"))]))
                .await
                .unwrap();

            let persistence = Persistence::new(&config(), tiers.clone());
            let values = persistence.hydrate().await.unwrap();
            assert_eq!(values, map(json!({"count": 7, "theme": "dark"})));
        }

        #[tokio::test]
        async fn test_meta_keeps_created_at() {
            let tiers = StorageTiers::in_memory();
            let persistence = Persistence::new(&config(), tiers.clone());
            assert!(persistence.meta().await.unwrap().is_none());

            persistence.hydrate().await.unwrap();
            let first = persistence.meta().await.unwrap().unwrap();
            assert_eq!(first.version, 1);
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;

            persistence.hydrate().await.unwrap();
            let second = persistence.meta().await.unwrap().unwrap();
            assert_eq!(second.created_at, first.created_at);
            assert!(second.last_accessed >= first.last_accessed);

            let raw = tiers.durable.get(None).await.unwrap();
            let meta = &raw["crann:t:__meta"];
            assert!(meta.get("createdAt").is_some());
            assert!(meta.get("lastAccessed").is_some());
        }

        #[tokio::test]
        async fn test_versions_never_collide() {
            let tiers = StorageTiers::in_memory();
            let v1 = Persistence::new(&config(), tiers.clone());
            let v2_config = StoreConfig::builder("t")
                .version(2)
                .item("count", StateItem::shared(json!(0)).persist(Persist::Durable))
                .build()
                .unwrap();
            let v2 = Persistence::new(&v2_config, tiers.clone());
            let other_config = StoreConfig::builder("u")
                .item("count", StateItem::shared(json!(0)).persist(Persist::Durable))
                .build()
                .unwrap();
            let other = Persistence::new(&other_config, tiers.clone());

            v1.persist(&map(json!({"count": 1}))).await.unwrap();
            other.persist(&map(json!({"count": 3}))).await.unwrap();

            assert!(v2.hydrate().await.unwrap().is_empty());
            assert_eq!(v1.hydrate().await.unwrap()["count"], json!(1));
            assert_eq!(other.hydrate().await.unwrap()["count"], json!(3));
        }

        #[tokio::test]
        async fn test_clear_all_is_exact() {
            let tiers = StorageTiers::in_memory();
            let persistence = Persistence::new(&config(), tiers.clone());
            tiers
                .durable
                .set(kv(&[("crann:t:v2:count", json!(1)), ("crann:u:v1:count", json!(2))]))
                .await
                .unwrap();
            persistence.hydrate().await.unwrap();
            persistence
                .persist(&map(json!({"count": 5, "theme": "dark"})))
                .await
                .unwrap();

            persistence.clear_all().await.unwrap();
            let durable = tiers.durable.get(None).await.unwrap();
            assert_eq!(
                durable.keys().cloned().collect::<Vec<_>>(),
                vec!["crann:t:v2:count".to_string(), "crann:u:v1:count".to_string()]
            );
            assert!(tiers.session.get(None).await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_clear_orphaned_data() {
            let tiers = StorageTiers::in_memory();
            tiers
                .durable
                .set(kv(&[
                    ("crann:keep:v1:a", json!(1)),
                    ("crann:keep:__meta", json!({})),
                    ("crann:gone:v1:a", json!(2)),
                    ("crann:gone:__meta", json!({})),
                    ("other:thing", json!(3)),
                ]))
                .await
                .unwrap();
            tiers
                .session
                .set(kv(&[("crann:gone:v3:b", json!(4))]))
                .await
                .unwrap();

            let found = Persistence::clear_orphaned_data(&tiers, &["keep"], true)
                .await
                .unwrap();
            assert_eq!(found.len(), 3);
            assert!(found.contains("crann:gone:v3:b"));
            assert_eq!(tiers.durable.get(None).await.unwrap().len(), 5);

            let removed = Persistence::clear_orphaned_data(&tiers, &["keep"], false)
                .await
                .unwrap();
            assert_eq!(removed, found);
            let durable = tiers.durable.get(None).await.unwrap();
            assert_eq!(durable.len(), 3);
            assert!(durable.contains_key("other:thing"));
            assert!(tiers.session.get(None).await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_sqlite_tier_round_trip() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("crann.db");
            {
                let tiers = StorageTiers::sqlite(&path).unwrap();
                let persistence = Persistence::new(&config(), tiers);
                persistence.persist(&map(json!({"count": 11}))).await.unwrap();
            }
            let tiers = StorageTiers::sqlite(&path).unwrap();
            let persistence = Persistence::new(&config(), tiers);
            assert_eq!(persistence.hydrate().await.unwrap()["count"], json!(11));
        }

        #[test]
        fn test_name_claims() {
            let claims = StoreNameClaims::new();
            claims.claim("t").unwrap();
            assert!(matches!(claims.check("t"), Err(CrannError::StorageCollision(_))));
            assert!(claims.claim("t").is_err());
            assert!(claims.check("u").is_ok());
            assert!(claims.release("t"));
            assert!(claims.claim("t").is_ok());
        }

        #[tokio::test]
        async fn test_memory_area_sees_batched_writes() {
            let durable = Arc::new(MemoryArea::new("local"));
            let tiers = StorageTiers::new(durable.clone(), Arc::new(MemoryArea::new("session")));
            let persistence = Persistence::new(&config(), tiers);
            persistence.persist(&map(json!({"count": 1}))).await.unwrap();
            assert_eq!(durable.len(), 1);
        }
    }

    // ── ConnectionRegistry ─────────────────────────────────────

    mod registry {
        use super::*;
        use chrono::{TimeZone, Utc};

        fn info(id: &str, location: AgentLocation) -> ConnectionInfo {
            ConnectionInfo::new(id, location)
        }

        #[test]
        fn test_add_stamps_connected_at() {
            let mut registry = ConnectionRegistry::new();
            let mut stale = info("a", AgentLocation::new("popup"));
            stale.connected_at = Utc.timestamp_opt(0, 0).unwrap();
            let added = registry.add(stale).unwrap();
            assert!(added.connected_at.timestamp() > 0);
            assert!(registry.has(&"a".into()));
        }

        #[test]
        fn test_duplicate_add_is_an_error() {
            let mut registry = ConnectionRegistry::new();
            registry.add(info("a", AgentLocation::new("popup"))).unwrap();
            let err = registry
                .add(info("a", AgentLocation::new("popup")))
                .unwrap_err();
            assert!(matches!(err, CrannError::DuplicateConnection(_)));
            assert_eq!(registry.len(), 1);
        }

        #[test]
        fn test_remove_and_clear() {
            let mut registry = ConnectionRegistry::new();
            registry.add(info("a", AgentLocation::new("popup"))).unwrap();
            registry.add(info("b", AgentLocation::new("popup"))).unwrap();
            assert!(registry.remove(&"a".into()).is_some());
            assert!(registry.remove(&"a".into()).is_none());
            assert!(!registry.has(&"a".into()));
            registry.clear();
            assert!(registry.is_empty());
        }

        #[test]
        fn test_query_uses_and_semantics() {
            let mut registry = ConnectionRegistry::new();
            registry.add(info("a", AgentLocation::new("popup"))).unwrap();
            registry
                .add(info("b", AgentLocation::new("content").with_tab(1).with_frame(0)))
                .unwrap();
            registry
                .add(info("c", AgentLocation::new("content").with_tab(1).with_frame(2)))
                .unwrap();
            registry
                .add(info("d", AgentLocation::new("content").with_tab(2)))
                .unwrap();

            assert_eq!(registry.get_all().len(), 4);
            assert_eq!(registry.query(&AgentQuery::any().context("content")).len(), 3);
            assert_eq!(registry.query(&AgentQuery::any().tab(1)).len(), 2);
            let hit = registry.query(&AgentQuery::any().context("content").tab(1).frame(2));
            assert_eq!(hit.len(), 1);
            assert_eq!(hit[0].id, "c");
            assert!(registry.query(&AgentQuery::any().context("popup").tab(1)).is_empty());
        }
    }

    // ── ActionExecutor ─────────────────────────────────────────

    mod executor {
        use super::*;
        use async_trait::async_trait;
        use parking_lot::Mutex;
        use std::sync::atomic::{AtomicUsize, Ordering};

        #[derive(Default)]
        struct RecordingWriter {
            writes: Mutex<Vec<(StateMap, ConnectionId)>>,
        }

        #[async_trait]
        impl StateWriter for RecordingWriter {
            async fn write(&self, partial: StateMap, connection: &ConnectionId) -> Result<StateChanges> {
                self.writes.lock().push((partial.clone(), connection.clone()));
                Ok(StateChanges {
                    shared: partial,
                    scoped: StateMap::new(),
                })
            }
        }

        fn caller() -> ConnectionInfo {
            ConnectionInfo::new("caller-1", AgentLocation::new("popup").with_tab(4))
        }

        fn executor_with(calls: Arc<AtomicUsize>) -> ActionExecutor {
            let set_calls = calls.clone();
            let config = StoreConfig::builder("t")
                .item("count", StateItem::shared(json!(0)))
                .action(
                    "setCount",
                    ActionDef::new(move |ctx: ActionContext, args: Vec<Value>| {
                        let calls = set_calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            let value = args.first().cloned().unwrap_or(Value::Null);
                            ctx.set_state(map(json!({"count": value}))).await?;
                            Ok(json!({"caller": ctx.agent_id(), "tab": ctx.agent_location().tab_id}))
                        }
                    })
                    .with_validator(|args| {
                        match args.first().and_then(Value::as_i64) {
                            Some(n) if n >= 0 => Ok(()),
                            _ => anyhow::bail!("count must be a non-negative integer"),
                        }
                    }),
                )
                .action(
                    "fail",
                    ActionDef::new(|_ctx, _args| async { anyhow::bail!("boom") }),
                )
                .action(
                    "explode",
                    ActionDef::new(|_ctx, _args| async {
                        if true {
                            panic!("handler panicked");
                        }
                        Ok(Value::Null)
                    }),
                )
                .action(
                    "strict",
                    ActionDef::new(|_ctx, _args| async { Ok(Value::Null) })
                        .with_validator(|_args| panic!("validator panicked")),
                )
                .action(
                    "peek",
                    ActionDef::new(|ctx: ActionContext, _args| async move {
                        Ok(Value::Object(ctx.state().clone()))
                    }),
                )
                .build()
                .unwrap();
            ActionExecutor::new(Arc::new(config))
        }

        #[tokio::test]
        async fn test_unknown_action() {
            let executor = executor_with(Arc::new(AtomicUsize::new(0)));
            let err = executor
                .execute("missing", vec![], caller(), StateMap::new(), Arc::new(RecordingWriter::default()))
                .await
                .unwrap_err();
            assert!(matches!(err, CrannError::UnknownAction { ref action, ref store } if action == "missing" && store == "t"));
        }

        #[tokio::test]
        async fn test_store_without_actions_rejects_everything() {
            let config = StoreConfig::builder("bare").build().unwrap();
            let executor = ActionExecutor::new(Arc::new(config));
            let err = executor
                .execute("any", vec![], caller(), StateMap::new(), Arc::new(RecordingWriter::default()))
                .await
                .unwrap_err();
            assert!(matches!(err, CrannError::UnknownAction { .. }));
        }

        #[tokio::test]
        async fn test_validator_gates_handler() {
            let calls = Arc::new(AtomicUsize::new(0));
            let executor = executor_with(calls.clone());
            let writer = Arc::new(RecordingWriter::default());

            let err = executor
                .execute("setCount", vec![json!(-1)], caller(), StateMap::new(), writer.clone())
                .await
                .unwrap_err();
            assert!(matches!(err, CrannError::Validation { ref reason, .. } if reason.contains("non-negative")));
            assert_eq!(calls.load(Ordering::SeqCst), 0);

            let result = executor
                .execute("setCount", vec![json!(1)], caller(), StateMap::new(), writer.clone())
                .await
                .unwrap();
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(result, json!({"caller": "caller-1", "tab": 4}));

            let writes = writer.writes.lock();
            assert_eq!(writes.len(), 1);
            assert_eq!(writes[0].0, map(json!({"count": 1})));
            assert_eq!(writes[0].1, "caller-1");
        }

        #[tokio::test]
        async fn test_handler_error_is_wrapped() {
            let executor = executor_with(Arc::new(AtomicUsize::new(0)));
            let err = executor
                .execute("fail", vec![], caller(), StateMap::new(), Arc::new(RecordingWriter::default()))
                .await
                .unwrap_err();
            match err {
                CrannError::Action { action, store, message } => {
                    assert_eq!(action, "fail");
                    assert_eq!(store, "t");
                    assert_eq!(message, "boom");
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_handler_panic_is_wrapped() {
            let executor = executor_with(Arc::new(AtomicUsize::new(0)));
            let err = executor
                .execute("explode", vec![], caller(), StateMap::new(), Arc::new(RecordingWriter::default()))
                .await
                .unwrap_err();
            assert!(matches!(err, CrannError::Action { ref message, .. } if message.contains("handler panicked")));
        }

        #[tokio::test]
        async fn test_validator_panic_is_a_validation_failure() {
            let executor = executor_with(Arc::new(AtomicUsize::new(0)));
            let err = executor
                .execute("strict", vec![], caller(), StateMap::new(), Arc::new(RecordingWriter::default()))
                .await
                .unwrap_err();
            assert!(matches!(err, CrannError::Validation { ref reason, .. } if reason.contains("validator panicked")));
        }

        #[tokio::test]
        async fn test_handler_sees_snapshot() {
            let executor = executor_with(Arc::new(AtomicUsize::new(0)));
            let snapshot = map(json!({"count": 3, "cursor": 1}));
            let result = executor
                .execute("peek", vec![], caller(), snapshot.clone(), Arc::new(RecordingWriter::default()))
                .await
                .unwrap();
            assert_eq!(result, Value::Object(snapshot));
        }
    }
}
