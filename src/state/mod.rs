//! State Persistence Manager
//!
//! Durable key/value state with integrity and staleness checks.
//!
//! Every value is wrapped in a [`StateSnapshot`] (version, timestamp,
//! checksum) and stored under `<namespace>.<key>` in one of two scopes.
//! Reads go through an in-memory cache that is checked against the stored
//! record; a snapshot that is past its TTL or fails its checksum is removed
//! and reported as absent.
//!
//! # Reload behaviour
//!
//! | Event              | Action                                   |
//! |--------------------|------------------------------------------|
//! | `ReloadRequested`  | wait for every in-flight save            |
//! | `StateSaving`      | write the aggregate of all cached values |
//! | `StateLoading`     | replay the aggregate into the cache      |
//!
//! Saves requested while the extension is reloading are skipped.

mod snapshot;
mod store;

#[cfg(test)]
mod tests;

pub use snapshot::{AggregateSnapshot, SNAPSHOT_VERSION, StateSnapshot, checksum};
pub use store::{FileStore, KeyValueStore, MemoryStore};

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::StateSection;
use crate::core::{PendingSet, now_ms};
use crate::lifecycle::{Coordinator, EventType};
use crate::logger::Logger;
use crate::recovery::{ErrorCategory, ErrorRecoverySystem, ErrorSeverity};
use crate::{debug, log, warn};

/// Key suffix of the aggregate record.
const AGGREGATE_KEY: &str = "__snapshot__";

/// Storage scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateScope {
    Global,
    #[default]
    Workspace,
}

impl StateScope {
    pub fn label(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Workspace => "workspace",
        }
    }
}

impl fmt::Display for StateScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for StateScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(Self::Global),
            "workspace" => Ok(Self::Workspace),
            other => Err(format!("unknown scope `{other}` (expected global or workspace)")),
        }
    }
}

/// Where and how one piece of state is persisted.
///
/// `ttl` and `max_size` override the `[state]` policy for the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateConfig {
    pub key: String,
    pub scope: StateScope,
    pub ttl: Option<Duration>,
    pub max_size: Option<usize>,
}

impl StateConfig {
    pub fn new(key: impl Into<String>, scope: StateScope) -> Self {
        Self {
            key: key.into(),
            scope,
            ttl: None,
            max_size: None,
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state `{key}` is {size} bytes, limit is {max}")]
    SizeExceeded { key: String, size: usize, max: usize },

    #[error("failed to serialize state `{key}`")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("stored value under `{key}` is not a snapshot")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("storage failure for `{key}`")]
    Storage {
        key: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Raw view of one stored snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Inspection {
    pub storage_key: String,
    pub snapshot: StateSnapshot,
    pub checksum_valid: bool,
    pub expired: bool,
    pub age: Duration,
}

type CacheKey = (StateScope, String);

/// Persists component state through the host's key/value stores.
pub struct StateManager {
    config: StateSection,
    global: Arc<dyn KeyValueStore>,
    workspace: Arc<dyn KeyValueStore>,
    cache: Mutex<FxHashMap<CacheKey, StateSnapshot>>,
    saving: PendingSet<CacheKey>,
    coordinator: Arc<Coordinator>,
    recovery: Arc<ErrorRecoverySystem>,
    logger: Logger,
}

impl StateManager {
    /// Create the manager and wire it to the reload events.
    pub fn new(
        config: StateSection,
        global: Arc<dyn KeyValueStore>,
        workspace: Arc<dyn KeyValueStore>,
        coordinator: Arc<Coordinator>,
        recovery: Arc<ErrorRecoverySystem>,
        logger: Logger,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            config,
            global,
            workspace,
            cache: Mutex::new(FxHashMap::default()),
            saving: PendingSet::new(),
            coordinator: Arc::clone(&coordinator),
            recovery,
            logger,
        });

        let weak = Arc::downgrade(&this);
        coordinator.on(EventType::ReloadRequested, move |_| {
            let weak = weak.clone();
            async move {
                if let Some(this) = weak.upgrade() {
                    this.flush_all_pending_saves().await;
                }
                Ok(())
            }
        });

        let weak = Arc::downgrade(&this);
        coordinator.on(EventType::StateSaving, move |_| {
            let weak = weak.clone();
            async move {
                if let Some(this) = weak.upgrade()
                    && let Err(e) = this.create_snapshot().await
                {
                    this.report(format!("failed to create snapshot: {}", error_chain(&e)), None)
                        .await;
                }
                Ok(())
            }
        });

        let weak = Arc::downgrade(&this);
        coordinator.on(EventType::StateLoading, move |_| {
            let weak = weak.clone();
            async move {
                if let Some(this) = weak.upgrade()
                    && let Err(e) = this.restore_from_snapshot().await
                {
                    this.report(format!("failed to restore snapshot: {}", error_chain(&e)), None)
                        .await;
                }
                Ok(())
            }
        });

        this
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}.{}", self.config.namespace, key)
    }

    fn store(&self, scope: StateScope) -> &Arc<dyn KeyValueStore> {
        match scope {
            StateScope::Global => &self.global,
            StateScope::Workspace => &self.workspace,
        }
    }

    fn ttl_for(&self, cfg: &StateConfig) -> Option<Duration> {
        cfg.ttl.or_else(|| self.config.ttl_for(&cfg.key))
    }

    // =========================================================================
    // Save / load
    // =========================================================================

    /// Persist `data` under `cfg`.
    ///
    /// Skipped while reloading. A save for a key that already has one in
    /// flight is dropped. Failures are reported and returned.
    pub async fn save_state<T: Serialize + ?Sized>(
        &self,
        cfg: &StateConfig,
        data: &T,
    ) -> Result<(), StateError> {
        if self.coordinator.is_reloading() {
            log!(self.logger, "state"; "skipping save of `{}` during reload", cfg.key);
            return Ok(());
        }

        let id = (cfg.scope, self.storage_key(&cfg.key));
        let Some(_guard) = self.saving.try_insert(id.clone(), cfg.key.as_str()) else {
            debug!(self.logger, "state"; "save of `{}` already in flight, dropped", cfg.key);
            return Ok(());
        };

        match self.persist(cfg, id, data).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.report(
                    format!("failed to save `{}`: {}", cfg.key, error_chain(&e)),
                    Some(serde_json::json!({ "key": cfg.key, "scope": cfg.scope })),
                )
                .await;
                Err(e)
            }
        }
    }

    async fn persist<T: Serialize + ?Sized>(
        &self,
        cfg: &StateConfig,
        (scope, storage_key): CacheKey,
        data: &T,
    ) -> Result<(), StateError> {
        let serialize_err = |source| StateError::Serialize {
            key: cfg.key.clone(),
            source,
        };
        let value = serde_json::to_value(data).map_err(serialize_err)?;
        let size = serde_json::to_string(&value).map_err(serialize_err)?.len();

        if let Some(max) = cfg.max_size.or_else(|| self.config.max_size_for(&cfg.key))
            && size > max
        {
            return Err(StateError::SizeExceeded {
                key: cfg.key.clone(),
                size,
                max,
            });
        }

        let snapshot = StateSnapshot::new(value);
        let encoded = serde_json::to_value(&snapshot).map_err(serialize_err)?;
        self.store(scope)
            .update(&storage_key, Some(encoded))
            .await
            .map_err(|source| StateError::Storage {
                key: cfg.key.clone(),
                source,
            })?;

        debug!(self.logger, "state"; "saved `{}` ({} bytes, {})", storage_key, size, scope);
        self.cache.lock().insert((scope, storage_key), snapshot);
        Ok(())
    }

    /// Load the value stored under `cfg`.
    ///
    /// Returns `None` when nothing is stored or the stored snapshot is
    /// expired, corrupt or not a `T`. Expired and corrupt entries are
    /// cleared.
    pub async fn load_state<T: DeserializeOwned>(&self, cfg: &StateConfig) -> Option<T> {
        let id = (cfg.scope, self.storage_key(&cfg.key));

        let cached = self.cache.lock().get(&id).cloned();
        let stored = match self.read(cfg.scope, &id.1).await {
            Ok(stored) => stored,
            Err(e @ StateError::Storage { .. }) if cached.is_some() => {
                warn!(self.logger, "state"; "{}, serving cached copy", error_chain(&e));
                None
            }
            Err(e) => {
                warn!(self.logger, "state"; "{}, discarding", error_chain(&e));
                self.discard(cfg).await;
                return None;
            }
        };
        // A stored record that moved on from the cached one wins
        let snapshot = match (cached, stored) {
            (Some(cached), Some(stored)) if stored.checksum != cached.checksum => {
                debug!(self.logger, "state"; "`{}` changed in storage, dropping cached copy", cfg.key);
                stored
            }
            (Some(cached), _) => cached,
            (None, Some(stored)) => stored,
            (None, None) => return None,
        };

        if snapshot.is_expired(self.ttl_for(cfg), now_ms()) {
            log!(self.logger, "state"; "`{}` expired, discarding", cfg.key);
            self.discard(cfg).await;
            return None;
        }
        if !snapshot.verify() {
            warn!(self.logger, "state"; "`{}` failed checksum validation, discarding", cfg.key);
            self.discard(cfg).await;
            return None;
        }

        let data = snapshot.data.clone();
        self.cache.lock().insert(id, snapshot);
        match serde_json::from_value(data) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(self.logger, "state"; "`{}` has an unexpected shape: {}", cfg.key, e);
                None
            }
        }
    }

    async fn read(
        &self,
        scope: StateScope,
        storage_key: &str,
    ) -> Result<Option<StateSnapshot>, StateError> {
        let raw = self
            .store(scope)
            .get(storage_key)
            .await
            .map_err(|source| StateError::Storage {
                key: storage_key.to_string(),
                source,
            })?;
        raw.map(|raw| {
            serde_json::from_value(raw).map_err(|source| StateError::Malformed {
                key: storage_key.to_string(),
                source,
            })
        })
        .transpose()
    }

    /// Clear on the load path, where failures only get logged.
    async fn discard(&self, cfg: &StateConfig) {
        if let Err(e) = self.clear_state(cfg).await {
            warn!(self.logger, "state"; "{}", error_chain(&e));
        }
    }

    /// Remove `cfg` from the cache and from storage.
    pub async fn clear_state(&self, cfg: &StateConfig) -> Result<(), StateError> {
        let storage_key = self.storage_key(&cfg.key);
        self.cache.lock().remove(&(cfg.scope, storage_key.clone()));
        self.store(cfg.scope)
            .update(&storage_key, None)
            .await
            .map_err(|source| StateError::Storage {
                key: cfg.key.clone(),
                source,
            })?;
        debug!(self.logger, "state"; "cleared `{}`", storage_key);
        Ok(())
    }

    /// Resolve once every in-flight save has settled.
    pub async fn flush_all_pending_saves(&self) {
        if !self.saving.is_empty() {
            log!(self.logger, "state"; "waiting for {} pending save(s)", self.saving.len());
        }
        self.saving.wait_empty().await;
    }

    // =========================================================================
    // Aggregate snapshot
    // =========================================================================

    fn aggregate_key(&self) -> String {
        self.storage_key(AGGREGATE_KEY)
    }

    /// Write every cached snapshot into the aggregate record.
    pub async fn create_snapshot(&self) -> Result<usize, StateError> {
        let snapshots: BTreeMap<String, StateSnapshot> = self
            .cache
            .lock()
            .iter()
            .map(|((scope, key), snapshot)| (format!("{scope}:{key}"), snapshot.clone()))
            .collect();
        let count = snapshots.len();
        let aggregate = AggregateSnapshot {
            timestamp: now_ms(),
            snapshots,
        };

        let key = self.aggregate_key();
        let encoded = serde_json::to_value(&aggregate).map_err(|source| StateError::Serialize {
            key: key.clone(),
            source,
        })?;
        self.workspace
            .update(&key, Some(encoded))
            .await
            .map_err(|source| StateError::Storage {
                key: key.clone(),
                source,
            })?;
        log!(self.logger, "state"; "snapshot created ({} key(s))", count);
        Ok(count)
    }

    /// Replay the aggregate record into the cache. Entries failing their
    /// checksum are skipped. Returns the number restored.
    pub async fn restore_from_snapshot(&self) -> Result<usize, StateError> {
        let key = self.aggregate_key();
        let raw = self
            .workspace
            .get(&key)
            .await
            .map_err(|source| StateError::Storage {
                key: key.clone(),
                source,
            })?;
        let Some(raw) = raw else {
            debug!(self.logger, "state"; "no snapshot to restore");
            return Ok(0);
        };
        let aggregate: AggregateSnapshot =
            serde_json::from_value(raw).map_err(|source| StateError::Malformed {
                key: key.clone(),
                source,
            })?;

        let mut restored = 0;
        let mut cache = self.cache.lock();
        for (id, snapshot) in aggregate.snapshots {
            let Some((scope, storage_key)) = id
                .split_once(':')
                .and_then(|(scope, key)| Some((scope.parse::<StateScope>().ok()?, key.to_string())))
            else {
                warn!(self.logger, "state"; "skipping snapshot entry `{}`: bad id", id);
                continue;
            };
            if !snapshot.verify() {
                warn!(self.logger, "state"; "skipping snapshot entry `{}`: checksum mismatch", id);
                continue;
            }
            cache.insert((scope, storage_key), snapshot);
            restored += 1;
        }
        drop(cache);

        log!(self.logger, "state"; "snapshot restored ({} key(s))", restored);
        Ok(restored)
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Read the stored snapshot for `key` without touching the cache.
    pub async fn inspect(
        &self,
        scope: StateScope,
        key: &str,
    ) -> Result<Option<Inspection>, StateError> {
        let storage_key = self.storage_key(key);
        let Some(snapshot) = self.read(scope, &storage_key).await? else {
            return Ok(None);
        };
        let now = now_ms();
        Ok(Some(Inspection {
            checksum_valid: snapshot.verify(),
            expired: snapshot.is_expired(self.config.ttl_for(key), now),
            age: snapshot.age(now),
            storage_key,
            snapshot,
        }))
    }

    async fn report(&self, message: String, context: Option<serde_json::Value>) {
        self.recovery
            .report_error(
                ErrorCategory::StateManagement,
                ErrorSeverity::Medium,
                message,
                context,
            )
            .await;
    }
}

/// `error: source: source` on one line.
fn error_chain(e: &StateError) -> String {
    let mut out = e.to_string();
    let mut source = std::error::Error::source(e);
    while let Some(s) = source {
        out.push_str(": ");
        out.push_str(&s.to_string());
        source = s.source();
    }
    out
}
