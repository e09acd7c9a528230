//! Debounced File Watcher
//!
//! Turns noisy backend notifications into one coordinated, pausable stream.
//!
//! ```text
//! backend threads --signal--> pump task --> queue_event (ignore, temp)
//!                                                 |
//!                                     trailing-edge debounce timer
//!                                                 v
//!                 process_event_queue: latest per path, re-check deletes
//!                                                 |
//!                           FileChanged event + per-kind callbacks
//! ```
//!
//! The watcher pauses on `ReloadRequested` and resumes on `ReloadCompleted`,
//! so files touched by the reload itself are delivered once afterwards
//! instead of triggering another cycle mid-reload.

mod backend;
mod debouncer;
mod types;


pub use backend::{NotifyProvider, SignalSink, WatchHandle, WatchProvider};
pub use types::{Backend, ChangeKind, FileChangeEvent, WatchSignal};

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use globset::{Glob, GlobSet, GlobSetBuilder};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::WatchSection;
use crate::lifecycle::{Coordinator, EventType};
use crate::logger::Logger;
use crate::recovery::{ErrorCategory, ErrorRecoverySystem, ErrorSeverity};
use crate::{debug, log, warn};
use debouncer::{Debouncer, is_temp_file};

/// Context tag on the report made when falling back to polling.
pub const FALLBACK_OPERATION: &str = "watch-fallback";

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watcher has been disposed")]
    Disposed,

    #[error("watcher was never started")]
    NotStarted,

    #[error("invalid glob `{pattern}`")]
    Pattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("no watch backend available for {}", .root.display())]
    Unavailable {
        root: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

/// Callback for coalesced changes of one kind.
pub type ChangeCallback = Arc<dyn Fn(&FileChangeEvent) + Send + Sync>;

#[derive(Default)]
struct Inner {
    root: Option<PathBuf>,
    handles: Vec<WatchHandle>,
    backend: Option<Backend>,
    debouncer: Debouncer,
    timer: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
    paused: bool,
    disposed: bool,
}

/// Debounced, pausable file watcher.
pub struct FileWatcher {
    me: Weak<Self>,
    config: WatchSection,
    /// Compiled `[watch] globs`, applied when the backend cannot filter
    include: GlobSet,
    ignore: GlobSet,
    provider: Arc<dyn WatchProvider>,
    inner: Mutex<Inner>,
    callbacks: RwLock<FxHashMap<ChangeKind, Vec<ChangeCallback>>>,
    signals: mpsc::UnboundedSender<WatchSignal>,
    signal_rx: Mutex<Option<mpsc::UnboundedReceiver<WatchSignal>>>,
    coordinator: Arc<Coordinator>,
    recovery: Arc<ErrorRecoverySystem>,
    logger: Logger,
}

impl FileWatcher {
    /// Create a stopped watcher wired to reload pause/resume.
    pub fn new(
        config: WatchSection,
        provider: Arc<dyn WatchProvider>,
        coordinator: Arc<Coordinator>,
        recovery: Arc<ErrorRecoverySystem>,
        logger: Logger,
    ) -> Result<Arc<Self>, WatchError> {
        let include = build_globset(&config.globs)?;
        let ignore = build_globset(&config.ignore)?;
        let (signals, signal_rx) = mpsc::unbounded_channel();

        let this = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            include,
            ignore,
            provider,
            inner: Mutex::new(Inner::default()),
            callbacks: RwLock::new(FxHashMap::default()),
            signals,
            signal_rx: Mutex::new(Some(signal_rx)),
            coordinator: Arc::clone(&coordinator),
            recovery,
            logger,
        });

        let weak = Arc::downgrade(&this);
        coordinator.on(EventType::ReloadRequested, move |_| {
            if let Some(this) = weak.upgrade() {
                this.pause();
            }
            async { Ok(()) }
        });

        let weak = Arc::downgrade(&this);
        coordinator.on(EventType::ReloadCompleted, move |_| {
            let weak = weak.clone();
            async move {
                if let Some(this) = weak.upgrade() {
                    this.resume().await;
                }
                Ok(())
            }
        });

        Ok(this)
    }

    // =========================================================================
    // Start / stop
    // =========================================================================

    /// Attach watches below `root`.
    ///
    /// Tries one native watch per glob; if any fails, drops the ones
    /// already attached, reports the fallback and polls the root instead.
    /// Calling it again replaces the current watches.
    pub async fn start(&self, root: &Path) -> Result<Backend, WatchError> {
        {
            let mut inner = self.inner.lock();
            if inner.disposed {
                return Err(WatchError::Disposed);
            }
            inner.handles.clear();
            inner.backend = None;
            inner.root = Some(root.to_path_buf());
        }
        self.ensure_pump();

        let signals = self.signals.clone();
        let sink: SignalSink = Arc::new(move |signal| {
            let _ = signals.send(signal);
        });

        let preferred = self.attach_patterns(root, &sink);
        let (backend, handles) = match preferred {
            Ok(handles) => (Backend::Native, handles),
            Err(e) => {
                let handle = self.provider.watch_directory(root, sink).map_err(|source| {
                    WatchError::Unavailable {
                        root: root.to_path_buf(),
                        source,
                    }
                })?;
                self.recovery
                    .report_error(
                        ErrorCategory::FileSystem,
                        ErrorSeverity::Medium,
                        format!("native watching unavailable, polling instead: {e:#}"),
                        Some(serde_json::json!({
                            "operation": FALLBACK_OPERATION,
                            "root": root.display().to_string(),
                        })),
                    )
                    .await;
                (Backend::Polling, vec![handle])
            }
        };

        let mut inner = self.inner.lock();
        if inner.disposed {
            return Err(WatchError::Disposed);
        }
        inner.handles = handles;
        inner.backend = Some(backend);
        log!(self.logger, "watch"; "watching {} ({} backend)", root.display(), backend);
        Ok(backend)
    }

    /// All-or-nothing: a partial set of handles is dropped on failure.
    fn attach_patterns(&self, root: &Path, sink: &SignalSink) -> anyhow::Result<Vec<WatchHandle>> {
        self.config
            .globs
            .iter()
            .map(|pattern| {
                self.provider
                    .watch_pattern(root, pattern, Arc::clone(sink))
            })
            .collect()
    }

    /// Re-attach watches on the current root.
    pub async fn restart(&self) -> Result<Backend, WatchError> {
        let root = self.inner.lock().root.clone().ok_or(WatchError::NotStarted)?;
        log!(self.logger, "watch"; "restarting watcher");
        self.start(&root).await
    }

    fn ensure_pump(&self) {
        let Some(mut rx) = self.signal_rx.lock().take() else {
            return;
        };
        let weak = self.me.clone();
        let pump = tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                let Some(this) = weak.upgrade() else { break };
                match signal {
                    WatchSignal::Change(event) => {
                        this.queue_event(event);
                    }
                    WatchSignal::Error(message) => {
                        let root = this.root().map(|r| r.display().to_string());
                        this.recovery
                            .report_error(
                                ErrorCategory::FileSystem,
                                ErrorSeverity::Medium,
                                format!("watch backend error: {message}"),
                                Some(serde_json::json!({ "root": root })),
                            )
                            .await;
                    }
                }
            }
        });
        self.inner.lock().pump = Some(pump);
    }

    /// Stop watching and drop all queued events. Idempotent.
    pub fn dispose(&self) {
        let mut inner = self.inner.lock();
        if inner.disposed {
            return;
        }
        inner.disposed = true;
        inner.handles.clear();
        inner.backend = None;
        inner.debouncer.clear();
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        if let Some(pump) = inner.pump.take()
            && tokio::task::try_id() != Some(pump.id())
        {
            pump.abort();
        }
        drop(inner);
        self.callbacks.write().clear();
        debug!(self.logger, "watch"; "disposed");
    }

    // =========================================================================
    // Queue
    // =========================================================================

    /// Queue a raw change and (re)arm the debounce timer.
    ///
    /// Returns false when the event was dropped.
    pub fn queue_event(&self, event: FileChangeEvent) -> bool {
        let mut inner = self.inner.lock();
        if inner.disposed {
            return false;
        }

        let relative = inner
            .root
            .as_deref()
            .and_then(|root| event.path.strip_prefix(root).ok())
            .unwrap_or(&event.path);
        if self.ignore.is_match(relative) || is_temp_file(&event.path) {
            debug!(self.logger, "watch"; "ignored {}", event.path.display());
            return false;
        }
        if inner.backend == Some(Backend::Polling) && !self.include.is_match(relative) {
            return false;
        }

        debug!(self.logger, "watch"; "{} {}", event.kind, event.path.display());
        let generation = inner.debouncer.push(event);
        if !inner.paused {
            self.arm_timer(&mut inner, generation);
        }
        true
    }

    fn arm_timer(&self, inner: &mut Inner, generation: u64) {
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        let weak = self.me.clone();
        let delay = self.config.debounce();
        inner.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(this) = weak.upgrade() else { return };
            {
                let mut inner = this.inner.lock();
                if !inner.debouncer.is_current(generation) || inner.paused || inner.disposed {
                    return;
                }
                // Detach so a new event cannot abort us mid-processing
                inner.timer = None;
            }
            this.process_event_queue().await;
        }));
    }

    /// Drain the queue: one event per path, deletes re-checked, then
    /// announced. Returns what was announced.
    pub async fn process_event_queue(&self) -> Vec<FileChangeEvent> {
        let events = self.inner.lock().debouncer.take();
        if events.is_empty() {
            return events;
        }

        let mut emitted = Vec::with_capacity(events.len());
        for mut event in events {
            if event.kind == ChangeKind::Delete && event.path.exists() {
                debug!(self.logger, "watch"; "{} still exists, treating delete as change", event.path.display());
                event.kind = ChangeKind::Change;
            }

            let payload = serde_json::json!({
                "path": event.path.display().to_string(),
                "kind": event.kind,
                "timestamp": event.timestamp,
            });
            if let Err(e) = self
                .coordinator
                .emit_event(EventType::FileChanged, Some(payload), Some("watcher"))
                .await
            {
                warn!(self.logger, "watch"; "file-changed listener failed: {}", e);
            }

            let callbacks = self
                .callbacks
                .read()
                .get(&event.kind)
                .cloned()
                .unwrap_or_default();
            for callback in callbacks {
                callback(&event);
            }
            emitted.push(event);
        }

        log!(self.logger, "watch"; "{} file change(s)", emitted.len());
        emitted
    }

    // =========================================================================
    // Pause / resume
    // =========================================================================

    /// Stop the timer. Queued events are kept.
    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        if inner.paused {
            return;
        }
        inner.paused = true;
        inner.debouncer.cancel();
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        debug!(self.logger, "watch"; "paused ({} queued)", inner.debouncer.len());
    }

    /// Unpause and immediately process anything queued meanwhile.
    pub async fn resume(&self) -> Vec<FileChangeEvent> {
        {
            let mut inner = self.inner.lock();
            if !inner.paused {
                return Vec::new();
            }
            inner.paused = false;
            debug!(self.logger, "watch"; "resumed ({} queued)", inner.debouncer.len());
            if inner.debouncer.is_empty() {
                return Vec::new();
            }
        }
        self.process_event_queue().await
    }

    // =========================================================================
    // Callbacks & queries
    // =========================================================================

    /// Run `callback` for every coalesced change of `kind`.
    pub fn on_change<F>(&self, kind: ChangeKind, callback: F)
    where
        F: Fn(&FileChangeEvent) + Send + Sync + 'static,
    {
        self.callbacks
            .write()
            .entry(kind)
            .or_default()
            .push(Arc::new(callback));
    }

    /// Active backend, `None` before start or after dispose.
    pub fn backend(&self) -> Option<Backend> {
        self.inner.lock().backend
    }

    pub fn root(&self) -> Option<PathBuf> {
        self.inner.lock().root.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }

    pub fn queued(&self) -> usize {
        self.inner.lock().debouncer.len()
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, WatchError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|source| WatchError::Pattern {
            pattern: pattern.clone(),
            source,
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| WatchError::Pattern {
        pattern: patterns.join(", "),
        source,
    })
}
