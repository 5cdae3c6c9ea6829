//! Integration tests for ticksink-core.
//!
//! Engine-level properties are checked against the in-memory backend, which
//! supports fault injection, and against a real SQLite file where a
//! `RAISE(ABORT)` trigger stands in for a record that can never insert.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use ticksink_core::config::{FlushMode, StoreBackend};
use ticksink_core::engine::SessionStart;
use ticksink_core::queue::DropReason;
use ticksink_core::store::{schema, ComponentRegistry, MemoryStore, SqliteConnectionFactory};
use ticksink_core::{
    ComponentSlot, CompositeRecord, Config, Error, FailureClass, PersistenceEngine, PoolError,
    SessionId, StoreError,
};

fn memory_config(batch_size: usize, mode: FlushMode) -> Config {
    let mut config = Config::default();
    config.store.backend = StoreBackend::Memory;
    config.engine.batch_size_threshold = batch_size;
    config.engine.flush_mode = mode;
    config.engine.finalize_timeout_ms = 5_000;
    config.pool.connection_acquire_timeout_ms = 500;
    config
}

fn vitals_record(session: SessionId, seq: u64) -> CompositeRecord {
    CompositeRecord::builder()
        .session(session)
        .sequence(seq)
        .capture_duration(Duration::from_micros(250))
        .component(ComponentSlot::Vitals, json!({"hp": 10, "max_hp": 99}))
        .build()
}

fn sequences(store: &MemoryStore, session: SessionId) -> Vec<u64> {
    store
        .roots(session)
        .iter()
        .map(|r| r.sequence_number)
        .collect()
}

mod memory_backend {
    use super::*;

    /// A batch failure in a later table leaves no rows in earlier tables.
    #[test]
    fn test_batch_atomicity_across_tables() {
        let store = MemoryStore::new();
        let engine =
            PersistenceEngine::start(memory_config(3, FlushMode::Inline), Arc::new(store.clone()))
                .unwrap();
        let session = engine.begin_session().unwrap();
        store.fail_table("chat_messages", 1, FailureClass::Transient);

        for seq in 1..=3 {
            let record = CompositeRecord::builder()
                .session(session)
                .sequence(seq)
                .capture_duration_nanos(1_000)
                .component(ComponentSlot::Vitals, json!({"hp": seq}))
                .component(ComponentSlot::Location, json!({"world_x": 3222, "world_y": 3218, "plane": 0}))
                .component(ComponentSlot::Chat, json!([{"type": "public", "message": "gz"}]))
                .build();
            assert!(engine.submit(record));
        }

        assert_eq!(store.total_rows(), 0);
        assert_eq!(engine.queue_len(), 3);

        let report = engine.force_flush();
        assert_eq!(report.records_persisted, 3);
        assert_eq!(store.row_count("game_ticks"), 3);
        assert_eq!(store.row_count("player_vitals"), 3);
        assert_eq!(store.row_count("player_location"), 3);
        assert_eq!(store.row_count("chat_messages"), 3);
    }

    /// An empty record in the middle of a batch keeps later keys aligned.
    #[test]
    fn test_correlation_with_empty_record() {
        let store = MemoryStore::new();
        let engine =
            PersistenceEngine::start(memory_config(3, FlushMode::Inline), Arc::new(store.clone()))
                .unwrap();
        let session = engine.begin_session().unwrap();

        engine.submit(vitals_record(session, 1));
        engine.submit(
            CompositeRecord::builder()
                .session(session)
                .sequence(2)
                .capture_duration_nanos(1_000)
                .build(),
        );
        engine.submit(vitals_record(session, 3));

        let roots = store.roots(session);
        assert_eq!(roots.len(), 3);
        assert_eq!(roots[1].component_count, 0);

        let vitals = store.rows("player_vitals");
        assert_eq!(vitals.len(), 2);
        for row in &vitals {
            let root = roots.iter().find(|r| r.key == row.key).unwrap();
            assert_eq!(root.sequence_number, row.sequence_number);
        }
        assert_eq!(vitals[1].sequence_number, 3);
    }

    #[test]
    fn test_sequence_order_is_preserved() {
        let store = MemoryStore::new();
        let engine =
            PersistenceEngine::start(memory_config(7, FlushMode::Inline), Arc::new(store.clone()))
                .unwrap();
        let session = engine.begin_session().unwrap();

        for seq in 1..=100 {
            assert!(engine.submit(vitals_record(session, seq)));
        }
        let report = engine.finalize_session(session).unwrap();

        assert_eq!(report.total_recorded, 100);
        assert_eq!(sequences(&store, session), (1..=100).collect::<Vec<_>>());
    }

    /// One transient failure delays records but loses none and duplicates none.
    #[test]
    fn test_at_least_once_after_transient_failure() {
        let store = MemoryStore::new();
        let engine =
            PersistenceEngine::start(memory_config(5, FlushMode::Inline), Arc::new(store.clone()))
                .unwrap();
        let session = engine.begin_session().unwrap();
        store.fail_next_commits(1);

        for seq in 1..=5 {
            assert!(engine.submit(vitals_record(session, seq)));
        }
        assert!(store.roots(session).is_empty());
        assert_eq!(engine.queue_len(), 5);

        engine.force_flush();
        assert_eq!(sequences(&store, session), vec![1, 2, 3, 4, 5]);
        assert_eq!(engine.metrics().dropped_total(), 0);
        assert_eq!(engine.metrics().batches_rolled_back(), 1);
    }

    /// Under a dead backend the queue stays within the requeue bound and
    /// every submitted record is either queued or counted as dropped.
    #[test]
    fn test_requeue_is_bounded_under_outage() {
        let store = MemoryStore::new();
        let mut config = memory_config(10, FlushMode::Inline);
        config.engine.max_requeue_multiplier = 2;
        config.engine.max_record_attempts = 1_000;
        config.breaker.failure_threshold = 1_000;
        let engine = PersistenceEngine::start(config, Arc::new(store.clone())).unwrap();
        let session = engine.begin_session().unwrap();
        store.fail_always(Some(FailureClass::Transient));

        for seq in 1..=60 {
            assert!(engine.submit(vitals_record(session, seq)));
            assert!(engine.queue_len() <= 20, "queue grew to {}", engine.queue_len());
        }

        let metrics = engine.metrics();
        assert_eq!(engine.queue_len(), 20);
        assert_eq!(metrics.dropped_by_reason(DropReason::RequeueOverflow), 40);
        assert_eq!(metrics.dropped_total() as usize + engine.queue_len(), 60);
        assert!(store.roots(session).is_empty());
        assert!(!engine.is_healthy());
    }

    #[test]
    fn test_startup_fails_when_store_unreachable() {
        let store = MemoryStore::new();
        store.refuse_next_connects(100);
        let result = PersistenceEngine::start(memory_config(10, FlushMode::Inline), Arc::new(store));
        assert!(matches!(result, Err(Error::Pool(PoolError::Unavailable(_)))));
    }

    #[test]
    fn test_startup_fails_on_missing_tables() {
        let result = PersistenceEngine::start(
            memory_config(10, FlushMode::Inline),
            Arc::new(MemoryStore::unprovisioned()),
        );
        match result {
            Err(Error::Store(StoreError::Schema(message))) => {
                assert!(message.contains("game_ticks"));
                assert!(message.contains("player_vitals"));
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("engine started without tables"),
        }
    }

    /// batch size 1, synchronous mode: committed before `submit` returns.
    #[test]
    fn test_single_record_batch_inline() {
        let store = MemoryStore::new();
        let engine =
            PersistenceEngine::start(memory_config(1, FlushMode::Inline), Arc::new(store.clone()))
                .unwrap();
        let session = engine.begin_session().unwrap();

        let record = engine
            .new_record(1)
            .capture_duration_nanos(1_000)
            .component(ComponentSlot::Vitals, json!({"hp": 10}))
            .build();
        assert!(engine.submit(record));

        let roots = store.roots(session);
        let vitals = store.rows("player_vitals");
        assert_eq!(roots.len(), 1);
        assert_eq!(vitals.len(), 1);
        assert_eq!(vitals[0].key, roots[0].key);
        assert_eq!(vitals[0].session_id, session);
    }

    /// batch size 1, background mode: committed within one scheduler tick.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_single_record_batch_background() {
        let store = MemoryStore::new();
        let mut config = memory_config(1, FlushMode::Background);
        config.engine.flush_interval_ms = 100;
        let engine = PersistenceEngine::start(config, Arc::new(store.clone())).unwrap();
        let session = engine.begin_session().unwrap();

        assert!(engine.submit(vitals_record(session, 1)));

        let mut committed = false;
        for _ in 0..50 {
            if store.roots(session).len() == 1 && store.row_count("player_vitals") == 1 {
                committed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(committed, "record not committed within the flush interval");

        let roots = store.roots(session);
        assert_eq!(store.rows("player_vitals")[0].key, roots[0].key);

        let engine = Arc::new(engine);
        let finalizing = Arc::clone(&engine);
        let report = tokio::task::spawn_blocking(move || finalizing.finalize_session(session))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.total_recorded, 1);
    }

    #[test]
    fn test_prometheus_export_reflects_activity() {
        let store = MemoryStore::new();
        let engine =
            PersistenceEngine::start(memory_config(2, FlushMode::Inline), Arc::new(store))
                .unwrap();
        let session = engine.begin_session().unwrap();
        engine.submit(vitals_record(session, 1));
        engine.submit(vitals_record(session, 2));
        engine.submit(vitals_record(session, 2));

        let text = engine.export_prometheus_text();
        assert!(text.contains("ticksink_records_persisted_total 2"));
        assert!(text.contains("ticksink_records_rejected{reason=\"sequence_not_increasing\"} 1"));
    }
}

mod sqlite_backend {
    use super::*;

    fn sqlite_config(dir: &TempDir, batch_size: usize) -> Config {
        let mut config = Config::default();
        config.store.backend = StoreBackend::Sqlite;
        config.store.path = dir.path().join("ticks.db");
        config.engine.batch_size_threshold = batch_size;
        config.engine.max_requeue_multiplier = 10;
        config.engine.flush_mode = FlushMode::Inline;
        config.engine.finalize_timeout_ms = 10_000;
        config.pool.max_pool_connections = 2;
        config.pool.min_idle = 1;
        config
    }

    /// Create every table, then run extra SQL such as poison triggers.
    fn provision(config: &Config, extra_sql: &str) {
        let conn = rusqlite::Connection::open(&config.store.path).unwrap();
        for ddl in schema::ddl_statements(&ComponentRegistry::standard()) {
            conn.execute_batch(&ddl).unwrap();
        }
        conn.execute_batch(extra_sql).unwrap();
    }

    fn start(config: Config) -> PersistenceEngine {
        let factory = SqliteConnectionFactory::new(
            config.store.path.clone(),
            Duration::from_millis(config.store.busy_timeout_ms),
        );
        PersistenceEngine::start(config, Arc::new(factory)).unwrap()
    }

    /// 50 submitted, 5 permanently rejected by the store: total is 45.
    #[test]
    fn test_finalize_counts_only_persisted_records() {
        let dir = TempDir::new().unwrap();
        let config = sqlite_config(&dir, 10);
        provision(
            &config,
            "CREATE TRIGGER poison_ticks BEFORE INSERT ON game_ticks
             WHEN NEW.tick_number IN (7, 14, 21, 28, 35)
             BEGIN SELECT RAISE(ABORT, 'poison tick'); END;",
        );
        let engine = start(config);
        let session = engine
            .begin_session_with(SessionStart {
                player_name: Some("Lynx Titan".into()),
                activity_type: Some("agility".into()),
            })
            .unwrap();

        for seq in 1..=50 {
            assert!(engine.submit(vitals_record(session, seq)));
        }
        let report = engine.finalize_session(session).unwrap();

        assert_eq!(report.total_recorded, 45);
        assert!(report.drained);
        assert_eq!(
            engine.metrics().dropped_by_reason(DropReason::RetryExhausted),
            5
        );

        let stored = engine.load_session(session).unwrap();
        assert_eq!(stored.total_recorded, 45);
        assert!(stored.ended_at.is_some());
        assert_eq!(stored.activity_type.as_deref(), Some("agility"));
    }

    /// A component insert that always fails takes its root row down with it.
    #[test]
    fn test_poisoned_component_leaves_no_partial_record() {
        let dir = TempDir::new().unwrap();
        let config = sqlite_config(&dir, 3);
        provision(
            &config,
            "CREATE TRIGGER poison_chat BEFORE INSERT ON chat_messages
             BEGIN SELECT RAISE(ABORT, 'chat rejected'); END;",
        );
        let db_path = config.store.path.clone();
        let engine = start(config);
        let session = engine.begin_session().unwrap();

        engine.submit(vitals_record(session, 1));
        engine.submit(
            CompositeRecord::builder()
                .session(session)
                .sequence(2)
                .capture_duration_nanos(1_000)
                .component(ComponentSlot::Vitals, json!({"hp": 5}))
                .component(ComponentSlot::Chat, json!([{"type": "public", "message": "hi"}]))
                .build(),
        );
        engine.submit(vitals_record(session, 3));

        let report = engine.finalize_session(session).unwrap();
        assert_eq!(report.total_recorded, 2);

        let conn = rusqlite::Connection::open(db_path).unwrap();
        let ticks: Vec<i64> = conn
            .prepare("SELECT tick_number FROM game_ticks ORDER BY tick_id")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(ticks, vec![1, 3]);

        let orphans: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM player_vitals v
                 LEFT JOIN game_ticks t ON t.tick_id = v.tick_id
                 WHERE t.tick_id IS NULL OR v.tick_number = 2",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(orphans, 0);
    }

    #[test]
    fn test_recent_sessions_lists_completed_session() {
        let dir = TempDir::new().unwrap();
        let config = sqlite_config(&dir, 5);
        provision(&config, "");
        let engine = start(config);
        let session = engine.begin_session().unwrap();
        for seq in 1..=12 {
            engine.submit(vitals_record(session, seq));
        }
        engine.finalize_session(session).unwrap();

        let sessions = engine.recent_sessions(10).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, session);
        assert_eq!(sessions[0].total_recorded, 12);
    }
}
