use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::*;
use crate::config::{KeyPolicy, RecoverySection, ReloadSection};
use crate::lifecycle::ExtensionState;

// =============================================================================
// Fixtures
// =============================================================================

/// Store whose writes take `delay` and can be made to fail.
#[derive(Default)]
struct ScriptedStore {
    inner: MemoryStore,
    delay: Duration,
    fail: bool,
    writes: AtomicUsize,
}

#[async_trait]
impl KeyValueStore for ScriptedStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        if self.fail {
            anyhow::bail!("disk unavailable");
        }
        self.inner.get(key).await
    }

    async fn update(&self, key: &str, value: Option<Value>) -> anyhow::Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            anyhow::bail!("disk full");
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.update(key, value).await
    }
}

struct Fixture {
    state: Arc<StateManager>,
    coordinator: Arc<Coordinator>,
    recovery: Arc<ErrorRecoverySystem>,
    global: Arc<dyn KeyValueStore>,
    workspace: Arc<dyn KeyValueStore>,
}

impl Fixture {
    /// Another manager over the same stores, with an empty cache.
    fn fresh(&self) -> Arc<StateManager> {
        StateManager::new(
            StateSection::default(),
            Arc::clone(&self.global),
            Arc::clone(&self.workspace),
            Arc::clone(&self.coordinator),
            Arc::clone(&self.recovery),
            Logger::memory(),
        )
    }
}

async fn fixture_with(
    section: StateSection,
    global: Arc<dyn KeyValueStore>,
    workspace: Arc<dyn KeyValueStore>,
) -> Fixture {
    let logger = Logger::memory();
    let coordinator = Arc::new(Coordinator::new(ReloadSection::default(), logger.clone()));
    coordinator
        .emit_event(EventType::ExtensionReady, None, None)
        .await
        .unwrap();
    let recovery = Arc::new(ErrorRecoverySystem::new(
        RecoverySection::default(),
        logger.clone(),
    ));
    let state = StateManager::new(
        section,
        Arc::clone(&global),
        Arc::clone(&workspace),
        Arc::clone(&coordinator),
        Arc::clone(&recovery),
        logger,
    );
    Fixture {
        state,
        coordinator,
        recovery,
        global,
        workspace,
    }
}

async fn fixture() -> (Fixture, Arc<MemoryStore>, Arc<MemoryStore>) {
    let global = Arc::new(MemoryStore::new());
    let workspace = Arc::new(MemoryStore::new());
    let f = fixture_with(
        StateSection::default(),
        Arc::clone(&global) as Arc<dyn KeyValueStore>,
        Arc::clone(&workspace) as Arc<dyn KeyValueStore>,
    )
    .await;
    (f, global, workspace)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Layout {
    zoom: f64,
    pinned: Vec<String>,
}

fn layout() -> Layout {
    Layout {
        zoom: 1.5,
        pinned: vec!["src/main.ts".into(), "src/app.tsx".into()],
    }
}

// =============================================================================
// Save / load
// =============================================================================

#[tokio::test]
async fn test_save_then_load_round_trips() {
    let (f, _, workspace) = fixture().await;
    let cfg = StateConfig::new("layout", StateScope::Workspace);

    f.state.save_state(&cfg, &layout()).await.unwrap();
    assert_eq!(f.state.load_state::<Layout>(&cfg).await, Some(layout()));

    // Fresh cache reads back from storage
    assert_eq!(f.fresh().load_state::<Layout>(&cfg).await, Some(layout()));

    let stored = workspace.peek("vizcore.layout").unwrap();
    assert_eq!(stored["version"], "1.0");
    assert_eq!(stored["data"]["zoom"], 1.5);
    assert!(stored["checksum"].as_str().is_some_and(|c| !c.is_empty()));
}

#[tokio::test]
async fn test_scopes_are_separate() {
    let (f, global, workspace) = fixture().await;
    let cfg = StateConfig::new("k", StateScope::Global);
    f.state.save_state(&cfg, &json!({ "v": 1 })).await.unwrap();

    assert!(global.peek("vizcore.k").is_some());
    assert!(workspace.peek("vizcore.k").is_none());
    assert_eq!(
        f.state
            .load_state::<Value>(&StateConfig::new("k", StateScope::Workspace))
            .await,
        None
    );
}

#[tokio::test]
async fn test_load_missing_is_none() {
    let (f, _, _) = fixture().await;
    let cfg = StateConfig::new("missing", StateScope::Workspace);
    assert_eq!(f.state.load_state::<Value>(&cfg).await, None);
}

#[tokio::test]
async fn test_tampered_checksum_is_discarded() {
    let (f, global, _) = fixture().await;
    let cfg = StateConfig::new("k", StateScope::Global);
    f.state.save_state(&cfg, &json!({ "v": 1 })).await.unwrap();

    let mut stored = global.peek("vizcore.k").unwrap();
    stored["checksum"] = json!("bad");
    global.insert("vizcore.k", stored);

    // Same manager: the cached copy must not mask the corrupt record
    assert_eq!(f.state.load_state::<Value>(&cfg).await, None);
    assert_eq!(global.peek("vizcore.k"), None);
    assert_eq!(f.state.load_state::<Value>(&cfg).await, None);
}

#[tokio::test]
async fn test_tampered_payload_is_discarded() {
    let (f, global, _) = fixture().await;
    let cfg = StateConfig::new("k", StateScope::Global);
    f.state.save_state(&cfg, &json!({ "v": 1 })).await.unwrap();

    let mut stored = global.peek("vizcore.k").unwrap();
    stored["data"]["v"] = json!(2);
    global.insert("vizcore.k", stored);

    assert_eq!(f.fresh().load_state::<Value>(&cfg).await, None);
    assert_eq!(global.peek("vizcore.k"), None);
}

#[tokio::test]
async fn test_expired_snapshot_is_discarded() {
    let (f, _, workspace) = fixture().await;
    let mut snapshot = StateSnapshot::new(json!({ "v": 1 }));
    snapshot.timestamp = now_ms() - 120_000;
    workspace.insert("vizcore.old", serde_json::to_value(&snapshot).unwrap());

    let cfg = StateConfig::new("old", StateScope::Workspace).ttl(Duration::from_secs(60));
    assert_eq!(f.state.load_state::<Value>(&cfg).await, None);
    assert_eq!(workspace.peek("vizcore.old"), None);
}

#[tokio::test]
async fn test_ttl_falls_back_to_config() {
    let global = Arc::new(MemoryStore::new());
    let workspace = Arc::new(MemoryStore::new());
    let mut section = StateSection::default();
    section.keys.insert(
        "old".into(),
        KeyPolicy {
            ttl_secs: Some(60),
            max_size: None,
        },
    );
    let f = fixture_with(section, global, Arc::clone(&workspace) as _).await;

    let mut snapshot = StateSnapshot::new(json!(1));
    snapshot.timestamp = now_ms() - 120_000;
    workspace.insert("vizcore.old", serde_json::to_value(&snapshot).unwrap());

    let cfg = StateConfig::new("old", StateScope::Workspace);
    assert_eq!(f.state.load_state::<Value>(&cfg).await, None);
}

#[tokio::test]
async fn test_malformed_entry_is_discarded() {
    let (f, _, workspace) = fixture().await;
    workspace.insert("vizcore.k", json!("not a snapshot"));

    let cfg = StateConfig::new("k", StateScope::Workspace);
    assert_eq!(f.state.load_state::<Value>(&cfg).await, None);
    assert_eq!(workspace.peek("vizcore.k"), None);
}

#[tokio::test]
async fn test_clear_state() {
    let (f, _, workspace) = fixture().await;
    let cfg = StateConfig::new("k", StateScope::Workspace);
    f.state.save_state(&cfg, &json!(1)).await.unwrap();

    f.state.clear_state(&cfg).await.unwrap();
    assert_eq!(workspace.peek("vizcore.k"), None);
    assert_eq!(f.state.load_state::<Value>(&cfg).await, None);
}

// =============================================================================
// Save failures and skips
// =============================================================================

#[tokio::test]
async fn test_size_limit_is_enforced() {
    let (f, _, workspace) = fixture().await;
    let cfg = StateConfig::new("big", StateScope::Workspace).max_size(16);

    let err = f
        .state
        .save_state(&cfg, &json!({ "payload": "x".repeat(64) }))
        .await
        .unwrap_err();
    assert!(matches!(err, StateError::SizeExceeded { max: 16, .. }));
    assert_eq!(workspace.peek("vizcore.big"), None);

    let reports = f.recovery.recent_errors(10);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].category, ErrorCategory::StateManagement);
    assert_eq!(reports[0].severity, ErrorSeverity::Medium);
}

#[tokio::test]
async fn test_storage_failure_propagates_and_is_reported() {
    let failing = Arc::new(ScriptedStore {
        fail: true,
        ..Default::default()
    });
    let f = fixture_with(
        StateSection::default(),
        failing,
        Arc::new(MemoryStore::new()),
    )
    .await;

    let cfg = StateConfig::new("k", StateScope::Global);
    let err = f.state.save_state(&cfg, &json!(1)).await.unwrap_err();
    assert!(matches!(err, StateError::Storage { .. }));
    assert_eq!(
        f.recovery.error_count(ErrorCategory::StateManagement),
        1
    );
}

#[tokio::test]
async fn test_save_skipped_while_reloading() {
    let (f, _, workspace) = fixture().await;
    f.coordinator
        .transition_to(ExtensionState::Reloading)
        .unwrap();

    let cfg = StateConfig::new("k", StateScope::Workspace);
    f.state.save_state(&cfg, &json!(1)).await.unwrap();
    assert_eq!(workspace.peek("vizcore.k"), None);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_save_for_same_key_is_dropped() {
    let store = Arc::new(ScriptedStore {
        delay: Duration::from_millis(100),
        ..Default::default()
    });
    let f = fixture_with(
        StateSection::default(),
        Arc::new(MemoryStore::new()),
        Arc::clone(&store) as _,
    )
    .await;
    let cfg = StateConfig::new("k", StateScope::Workspace);

    let (v1, v2) = (json!({ "v": 1 }), json!({ "v": 2 }));
    let (first, second) = tokio::join!(
        f.state.save_state(&cfg, &v1),
        f.state.save_state(&cfg, &v2),
    );
    first.unwrap();
    second.unwrap();

    assert_eq!(store.writes.load(Ordering::SeqCst), 1);
    assert_eq!(store.inner.peek("vizcore.k").unwrap()["data"]["v"], 1);
}

#[tokio::test(start_paused = true)]
async fn test_flush_waits_for_in_flight_saves() {
    let store = Arc::new(ScriptedStore {
        delay: Duration::from_millis(100),
        ..Default::default()
    });
    let f = fixture_with(
        StateSection::default(),
        Arc::new(MemoryStore::new()),
        Arc::clone(&store) as _,
    )
    .await;

    let saver = {
        let state = Arc::clone(&f.state);
        tokio::spawn(async move {
            let cfg = StateConfig::new("k", StateScope::Workspace);
            state.save_state(&cfg, &json!(1)).await
        })
    };
    let key = (StateScope::Workspace, "vizcore.k".to_string());
    while !f.state.saving.contains(&key) {
        tokio::task::yield_now().await;
    }
    assert_eq!(store.writes.load(Ordering::SeqCst), 0);

    f.state.flush_all_pending_saves().await;
    assert_eq!(store.writes.load(Ordering::SeqCst), 1);
    saver.await.unwrap().unwrap();
}

// =============================================================================
// Aggregate snapshot
// =============================================================================

#[tokio::test]
async fn test_snapshot_create_and_restore() {
    let (f, _, workspace) = fixture().await;
    let a = StateConfig::new("a", StateScope::Global);
    let b = StateConfig::new("b", StateScope::Workspace);
    f.state.save_state(&a, &json!("alpha")).await.unwrap();
    f.state.save_state(&b, &json!("beta")).await.unwrap();

    assert_eq!(f.state.create_snapshot().await.unwrap(), 2);
    let aggregate = workspace.peek("vizcore.__snapshot__").unwrap();
    assert!(aggregate["snapshots"]["global:vizcore.a"].is_object());
    assert!(aggregate["snapshots"]["workspace:vizcore.b"].is_object());

    // Per-key records gone; the aggregate alone brings them back
    f.state.clear_state(&a).await.unwrap();
    let restored = f.fresh();
    assert_eq!(restored.restore_from_snapshot().await.unwrap(), 2);
    assert_eq!(restored.load_state::<String>(&a).await.as_deref(), Some("alpha"));
    assert_eq!(restored.load_state::<String>(&b).await.as_deref(), Some("beta"));
}

#[tokio::test]
async fn test_restore_skips_corrupt_entries() {
    let (f, _, workspace) = fixture().await;
    let mut bad = StateSnapshot::new(json!(1));
    bad.checksum = "bad".into();
    let aggregate = AggregateSnapshot {
        timestamp: now_ms(),
        snapshots: [
            ("workspace:vizcore.good".to_string(), StateSnapshot::new(json!(2))),
            ("workspace:vizcore.bad".to_string(), bad),
            ("nowhere:vizcore.odd".to_string(), StateSnapshot::new(json!(3))),
        ]
        .into_iter()
        .collect(),
    };
    workspace.insert(
        "vizcore.__snapshot__",
        serde_json::to_value(&aggregate).unwrap(),
    );

    assert_eq!(f.state.restore_from_snapshot().await.unwrap(), 1);
}

#[tokio::test]
async fn test_restore_without_snapshot_is_noop() {
    let (f, _, _) = fixture().await;
    assert_eq!(f.state.restore_from_snapshot().await.unwrap(), 0);
}

#[tokio::test]
async fn test_reload_cycle_writes_and_replays_snapshot() {
    let (f, _, workspace) = fixture().await;
    let cfg = StateConfig::new("layout", StateScope::Workspace);
    f.state.save_state(&cfg, &layout()).await.unwrap();

    f.coordinator
        .emit_event(EventType::ReloadRequested, None, None)
        .await
        .unwrap();
    assert!(workspace.peek("vizcore.__snapshot__").is_some());

    f.coordinator
        .emit_event(EventType::ReloadCompleted, None, None)
        .await
        .unwrap();
    assert_eq!(f.state.load_state::<Layout>(&cfg).await, Some(layout()));
}

#[tokio::test]
async fn test_snapshot_failure_does_not_abort_reload() {
    let failing = Arc::new(ScriptedStore {
        fail: true,
        ..Default::default()
    });
    let f = fixture_with(
        StateSection::default(),
        Arc::new(MemoryStore::new()),
        failing,
    )
    .await;

    f.coordinator
        .emit_event(EventType::ReloadRequested, None, None)
        .await
        .unwrap();
    assert!(f.coordinator.is_reloading());
    assert_eq!(
        f.recovery.error_count(ErrorCategory::StateManagement),
        1
    );
}

// =============================================================================
// Inspection
// =============================================================================

#[tokio::test]
async fn test_inspect_reports_validity() {
    let (f, global, _) = fixture().await;
    let cfg = StateConfig::new("k", StateScope::Global);
    f.state.save_state(&cfg, &json!({ "v": 1 })).await.unwrap();

    let inspection = f
        .state
        .inspect(StateScope::Global, "k")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(inspection.storage_key, "vizcore.k");
    assert!(inspection.checksum_valid);
    assert!(!inspection.expired);

    let mut stored = global.peek("vizcore.k").unwrap();
    stored["checksum"] = json!("bad");
    global.insert("vizcore.k", stored);
    let inspection = f
        .state
        .inspect(StateScope::Global, "k")
        .await
        .unwrap()
        .unwrap();
    assert!(!inspection.checksum_valid);

    assert!(f
        .state
        .inspect(StateScope::Workspace, "k")
        .await
        .unwrap()
        .is_none());
}

#[test]
fn test_scope_parse() {
    assert_eq!("global".parse::<StateScope>(), Ok(StateScope::Global));
    assert_eq!("workspace".parse::<StateScope>(), Ok(StateScope::Workspace));
    assert!("local".parse::<StateScope>().is_err());
}
