//! Activation and deactivation of the whole core.
//!
//! Components are built leaf to root:
//!
//! ```text
//! Coordinator, ErrorRecoverySystem
//!        |
//!        +--> StateManager, WebviewCoordinator, FileWatcher
//!                                 |
//!             default recovery strategies close the loop
//! ```
//!
//! Nothing talks to anything else directly. Components react to
//! coordinator events and report failures to the recovery system.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::VizConfig;
use crate::lifecycle::{Coordinator, EventType, LifecycleError};
use crate::logger::Logger;
use crate::recovery::{
    ErrorCategory, ErrorRecoverySystem, ErrorReport, ErrorSeverity, Notifier, RecoveryStrategy,
};
use crate::state::{KeyValueStore, StateManager};
use crate::watch::{FALLBACK_OPERATION, FileWatcher, WatchError, WatchProvider};
use crate::webview::{PanelHost, WebviewCoordinator};
use crate::{log, warn};

/// Minimum time between two watcher restarts.
const RESTART_COOLDOWN: Duration = Duration::from_secs(5);

/// Host collaborators the core runs against.
pub struct Host {
    pub global_store: Arc<dyn KeyValueStore>,
    pub workspace_store: Arc<dyn KeyValueStore>,
    pub panels: Arc<dyn PanelHost>,
    pub watch_provider: Arc<dyn WatchProvider>,
    pub notifier: Option<Arc<dyn Notifier>>,
}

#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// A running core.
pub struct Extension {
    pub coordinator: Arc<Coordinator>,
    pub recovery: Arc<ErrorRecoverySystem>,
    pub state: Arc<StateManager>,
    pub webviews: Arc<WebviewCoordinator>,
    pub watcher: Arc<FileWatcher>,
    root: PathBuf,
    logger: Logger,
}

impl Extension {
    /// Build every component, start watching `root` and emit
    /// `ExtensionReady`.
    ///
    /// A watcher that cannot attach is reported, not fatal: the core runs
    /// without file events and the recovery strategy retries later.
    pub async fn activate(
        config: VizConfig,
        host: Host,
        root: &Path,
        logger: Logger,
    ) -> Result<Self, ExtensionError> {
        let VizConfig {
            state,
            watch,
            reload,
            recovery,
        } = config;

        let coordinator = Arc::new(Coordinator::new(reload, logger.clone()));
        let recovery = {
            let system = ErrorRecoverySystem::new(recovery, logger.clone());
            Arc::new(match host.notifier {
                Some(notifier) => system.with_notifier(notifier),
                None => system,
            })
        };
        let state = StateManager::new(
            state,
            host.global_store,
            host.workspace_store,
            Arc::clone(&coordinator),
            Arc::clone(&recovery),
            logger.clone(),
        );
        let webviews = WebviewCoordinator::new(
            host.panels,
            Arc::clone(&coordinator),
            Arc::clone(&recovery),
            logger.clone(),
        );
        let watcher = FileWatcher::new(
            watch,
            host.watch_provider,
            Arc::clone(&coordinator),
            Arc::clone(&recovery),
            logger.clone(),
        )?;

        register_default_strategies(&recovery, &watcher, &webviews);
        recovery.start_monitoring();

        if let Err(e) = watcher.start(root).await {
            recovery
                .report_error(
                    ErrorCategory::FileSystem,
                    ErrorSeverity::High,
                    format!("{:#}", anyhow::Error::new(e)),
                    Some(serde_json::json!({ "root": root.display().to_string() })),
                )
                .await;
        }

        coordinator
            .emit_event(EventType::ExtensionReady, None, Some("extension"))
            .await?;
        log!(logger, "extension"; "activated for {}", root.display());

        Ok(Self {
            coordinator,
            recovery,
            state,
            webviews,
            watcher,
            root: root.to_path_buf(),
            logger,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shut down: announce, flush saves, then release every resource.
    pub async fn deactivate(&self) {
        if let Err(e) = self
            .coordinator
            .emit_event(EventType::Shutdown, None, Some("extension"))
            .await
        {
            warn!(self.logger, "extension"; "shutdown listener failed: {}", e);
        }
        self.state.flush_all_pending_saves().await;
        self.watcher.dispose();
        self.webviews.dispose_all().await;
        self.recovery.dispose();
        log!(self.logger, "extension"; "deactivated");
    }
}

/// FILE_SYSTEM: re-attach the watcher. WEBVIEW: drop the broken session.
fn register_default_strategies(
    recovery: &ErrorRecoverySystem,
    watcher: &Arc<FileWatcher>,
    webviews: &Arc<WebviewCoordinator>,
) {
    let weak = Arc::downgrade(watcher);
    recovery.register_strategy(
        ErrorCategory::FileSystem,
        RecoveryStrategy::new("restart-watcher", move |_| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(watcher) => watcher
                        .restart()
                        .await
                        .map(|_| true)
                        .map_err(anyhow::Error::from),
                    None => Ok(false),
                }
            }
        })
        // Falling back already is the recovery
        .when(|report| report.context_str("operation") != Some(FALLBACK_OPERATION))
        .cooldown(RESTART_COOLDOWN),
    );

    let weak = Arc::downgrade(webviews);
    recovery.register_strategy(
        ErrorCategory::Webview,
        RecoveryStrategy::new("dispose-webview", move |report: ErrorReport| {
            let weak = weak.clone();
            async move {
                let (Some(webviews), Some(id)) = (weak.upgrade(), report.context_str("webviewId"))
                else {
                    return Ok(false);
                };
                Ok(webviews.dispose_webview(id).await)
            }
        })
        .when(|report| report.context_str("webviewId").is_some()),
    );
}

impl std::fmt::Debug for Extension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extension")
            .field("root", &self.root)
            .field("state", &self.coordinator.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::*;
    use crate::lifecycle::ExtensionState;
    use crate::state::{MemoryStore, StateConfig, StateScope};
    use crate::watch::{SignalSink, WatchHandle};
    use crate::webview::{HeadlessPanelHost, PanelEvent, RenderPanel, SurfaceMessage};

    #[derive(Default)]
    struct CountingProvider {
        fail: bool,
        attached: AtomicUsize,
    }

    impl WatchProvider for CountingProvider {
        fn watch_pattern(&self, _: &Path, _: &str, _: SignalSink) -> anyhow::Result<WatchHandle> {
            if self.fail {
                anyhow::bail!("watch limit reached");
            }
            self.attached.fetch_add(1, Ordering::SeqCst);
            Ok(WatchHandle::new(()))
        }

        fn watch_directory(&self, _: &Path, _: SignalSink) -> anyhow::Result<WatchHandle> {
            if self.fail {
                anyhow::bail!("polling unsupported");
            }
            self.attached.fetch_add(1, Ordering::SeqCst);
            Ok(WatchHandle::new(()))
        }
    }

    struct SilentPanel {
        events: Mutex<Option<mpsc::UnboundedReceiver<PanelEvent>>>,
        _tx: mpsc::UnboundedSender<PanelEvent>,
        disposed: AtomicUsize,
    }

    impl SilentPanel {
        fn new() -> Arc<Self> {
            let (tx, rx) = mpsc::unbounded_channel();
            Arc::new(Self {
                events: Mutex::new(Some(rx)),
                _tx: tx,
                disposed: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RenderPanel for SilentPanel {
        async fn post_message(&self, _: &SurfaceMessage) -> anyhow::Result<()> {
            Ok(())
        }

        fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PanelEvent>> {
            self.events.lock().take()
        }

        fn dispose(&self) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn activate(provider: Arc<CountingProvider>) -> (Extension, Arc<MemoryStore>) {
        let workspace = Arc::new(MemoryStore::new());
        let host = Host {
            global_store: Arc::new(MemoryStore::new()),
            workspace_store: Arc::clone(&workspace) as Arc<dyn KeyValueStore>,
            panels: Arc::new(HeadlessPanelHost),
            watch_provider: provider,
            notifier: None,
        };
        let ext = Extension::activate(
            VizConfig::default(),
            host,
            Path::new("/workspace"),
            Logger::memory(),
        )
        .await
        .unwrap();
        (ext, workspace)
    }

    #[tokio::test]
    async fn test_activate_reaches_ready() {
        let provider = Arc::new(CountingProvider::default());
        let (ext, _) = activate(Arc::clone(&provider)).await;

        assert_eq!(ext.coordinator.state(), ExtensionState::Ready);
        assert_eq!(ext.watcher.root().as_deref(), Some(Path::new("/workspace")));
        assert_eq!(provider.attached.load(Ordering::SeqCst), 2);
        assert_eq!(ext.recovery.recent_errors(10).len(), 0);
    }

    #[tokio::test]
    async fn test_activate_survives_missing_watcher() {
        let provider = Arc::new(CountingProvider {
            fail: true,
            ..Default::default()
        });
        let (ext, _) = activate(provider).await;

        assert!(ext.coordinator.is_ready());
        assert_eq!(ext.watcher.backend(), None);
        assert_eq!(ext.recovery.error_count(ErrorCategory::FileSystem), 1);
        assert_eq!(ext.recovery.recent_errors(1)[0].severity, ErrorSeverity::High);
    }

    #[tokio::test]
    async fn test_file_system_errors_restart_the_watcher() {
        let provider = Arc::new(CountingProvider::default());
        let (ext, _) = activate(Arc::clone(&provider)).await;

        let recovered = ext
            .recovery
            .report_error(
                ErrorCategory::FileSystem,
                ErrorSeverity::Medium,
                "watch backend error: overflow",
                None,
            )
            .await;
        assert!(recovered);
        assert_eq!(provider.attached.load(Ordering::SeqCst), 4);

        // A fallback report is not a reason to restart
        let recovered = ext
            .recovery
            .report_error(
                ErrorCategory::FileSystem,
                ErrorSeverity::Medium,
                "polling instead",
                Some(serde_json::json!({ "operation": FALLBACK_OPERATION })),
            )
            .await;
        assert!(!recovered);
        assert_eq!(provider.attached.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_webview_errors_dispose_the_session() {
        let (ext, _) = activate(Arc::new(CountingProvider::default())).await;
        let panel = SilentPanel::new();
        ext.webviews.register_webview("graph", panel.clone());

        let recovered = ext
            .recovery
            .report_error(
                ErrorCategory::Webview,
                ErrorSeverity::High,
                "surface stopped answering",
                Some(serde_json::json!({ "webviewId": "graph" })),
            )
            .await;
        assert!(recovered);
        assert!(ext.webviews.session_ids().is_empty());
        assert_eq!(panel.disposed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deactivate_releases_everything() {
        let (ext, workspace) = activate(Arc::new(CountingProvider::default())).await;
        ext.webviews.register_webview("graph", SilentPanel::new());
        let cfg = StateConfig::new("layout", StateScope::Workspace);
        ext.state.save_state(&cfg, &serde_json::json!({ "zoom": 2 })).await.unwrap();

        ext.deactivate().await;

        assert!(ext.coordinator.is_shutting_down());
        assert!(ext.watcher.is_disposed());
        assert!(ext.webviews.session_ids().is_empty());
        assert!(workspace.peek("vizcore.layout").is_some());
        assert!(ext.recovery.recent_errors(10).is_empty());
    }

    #[tokio::test]
    async fn test_headless_panel_host_refuses() {
        let (ext, _) = activate(Arc::new(CountingProvider::default())).await;
        let options = crate::webview::PanelOptions::new("vizcore.graph", "Graph");
        assert!(ext.webviews.create_webview("graph", &options).await.is_err());
    }
}
