//! Webview Message Coordinator
//!
//! Delivery contract between the host and independently loading render
//! surfaces.
//!
//! ```text
//! send_message --> session pending? --yes--> per-session FIFO queue
//!                        |                          |
//!                        no             "ready" from surface: flush in order
//!                        v                          v
//!                  panel.post_message  <------------+
//! ```
//!
//! Outbound delivery is best-effort: failures go to the recovery system
//! and never reach the caller. Inbound messages are routed to handlers by
//! exact type whether or not the session is ready.

mod delivery;
mod host;
mod message;


pub use host::{HeadlessPanelHost, PanelEvent, PanelHost, PanelOptions, Placement, RenderPanel};
pub use message::SurfaceMessage;

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::core::BoxFuture;
use crate::lifecycle::{Coordinator, EventType};
use crate::logger::Logger;
use crate::recovery::{ErrorCategory, ErrorRecoverySystem, ErrorSeverity};
use crate::{debug, log, warn};

#[derive(Debug, Error)]
pub enum WebviewError {
    #[error("unknown webview `{0}`")]
    Unknown(String),

    #[error("failed to create webview `{id}`")]
    Create {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("webview `{id}` not ready after {timeout:?}")]
    ReadyTimeout { id: String, timeout: Duration },

    #[error("webview `{0}` disposed before becoming ready")]
    Disposed(String),
}

/// Inbound message handler: `(webview id, data)`.
pub type MessageHandler = Arc<
    dyn Fn(String, Option<serde_json::Value>) -> BoxFuture<'static, anyhow::Result<()>>
        + Send
        + Sync,
>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for the surface's "ready"
    Pending,
    /// Handshake received, queue being flushed
    Flushing,
    Ready,
}

struct Session {
    panel: Arc<dyn RenderPanel>,
    phase: Phase,
    queue: VecDeque<SurfaceMessage>,
    visible: bool,
    ready: watch::Sender<bool>,
    pump: Option<JoinHandle<()>>,
}

/// Owns every webview session and its outbound queue.
pub struct WebviewCoordinator {
    sessions: Mutex<FxHashMap<String, Session>>,
    handlers: RwLock<FxHashMap<String, Vec<MessageHandler>>>,
    panels: Arc<dyn PanelHost>,
    coordinator: Arc<Coordinator>,
    recovery: Arc<ErrorRecoverySystem>,
    logger: Logger,
}

impl WebviewCoordinator {
    /// Create the coordinator and subscribe it to reload requests, which
    /// dispose every session.
    pub fn new(
        panels: Arc<dyn PanelHost>,
        coordinator: Arc<Coordinator>,
        recovery: Arc<ErrorRecoverySystem>,
        logger: Logger,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            sessions: Mutex::new(FxHashMap::default()),
            handlers: RwLock::new(FxHashMap::default()),
            panels,
            coordinator: Arc::clone(&coordinator),
            recovery,
            logger,
        });

        let weak = Arc::downgrade(&this);
        coordinator.on(EventType::ReloadRequested, move |_| {
            let weak = weak.clone();
            async move {
                if let Some(this) = weak.upgrade() {
                    this.dispose_all().await;
                }
                Ok(())
            }
        });
        this
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Open a panel through the host and register it under `id`.
    ///
    /// An existing session with the same id is kept as is.
    pub async fn create_webview(
        self: &Arc<Self>,
        id: &str,
        options: &PanelOptions,
    ) -> Result<(), WebviewError> {
        if self.sessions.lock().contains_key(id) {
            warn!(self.logger, "webview"; "webview `{}` already exists", id);
            return Ok(());
        }
        let panel = self
            .panels
            .create_panel(options)
            .await
            .map_err(|source| WebviewError::Create {
                id: id.to_string(),
                source,
            })?;
        self.register_webview(id, panel);
        Ok(())
    }

    /// Adopt an existing panel as session `id`.
    ///
    /// Duplicate registration warns and leaves the first session in place.
    pub fn register_webview(self: &Arc<Self>, id: &str, panel: Arc<dyn RenderPanel>) {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(id) {
            warn!(self.logger, "webview"; "webview `{}` already registered", id);
            return;
        }

        let pump = match panel.take_events() {
            Some(events) => Some(self.spawn_pump(id.to_string(), events)),
            None => {
                warn!(self.logger, "webview"; "webview `{}` has no event stream", id);
                None
            }
        };
        sessions.insert(
            id.to_string(),
            Session {
                panel,
                phase: Phase::Pending,
                queue: VecDeque::new(),
                visible: true,
                ready: watch::Sender::new(false),
                pump,
            },
        );
        log!(self.logger, "webview"; "registered `{}`", id);
    }

    fn spawn_pump(
        self: &Arc<Self>,
        id: String,
        mut events: mpsc::UnboundedReceiver<PanelEvent>,
    ) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(this) = weak.upgrade() else { break };
                let disposed = matches!(event, PanelEvent::Disposed);
                this.handle_panel_event(&id, event).await;
                if disposed {
                    break;
                }
            }
        })
    }

    async fn handle_panel_event(&self, id: &str, event: PanelEvent) {
        match event {
            PanelEvent::Message(message) if message.is_ready_signal() => {
                self.complete_handshake(id).await;
            }
            PanelEvent::Message(message) => self.route_message(id, message).await,
            PanelEvent::VisibilityChanged(visible) => {
                if let Some(session) = self.sessions.lock().get_mut(id) {
                    session.visible = visible;
                }
                debug!(self.logger, "webview"; "`{}` visible: {}", id, visible);
            }
            PanelEvent::Disposed => {
                self.teardown(id, false).await;
            }
        }
    }

    /// Close session `id`. Returns false if it did not exist.
    pub async fn dispose_webview(&self, id: &str) -> bool {
        self.teardown(id, true).await
    }

    /// Close every session.
    pub async fn dispose_all(&self) {
        let ids = self.session_ids();
        if !ids.is_empty() {
            log!(self.logger, "webview"; "disposing {} webview(s)", ids.len());
        }
        for id in ids {
            self.teardown(&id, true).await;
        }
    }

    /// Remove the session and announce it. The map removal makes this
    /// run at most once per session.
    async fn teardown(&self, id: &str, close_panel: bool) -> bool {
        let Some(session) = self.sessions.lock().remove(id) else {
            return false;
        };

        if close_panel {
            session.panel.dispose();
        }
        if let Some(pump) = session.pump
            && tokio::task::try_id() != Some(pump.id())
        {
            pump.abort();
        }
        if !session.queue.is_empty() {
            debug!(self.logger, "webview"; "dropping {} queued message(s) for `{}`", session.queue.len(), id);
        }
        log!(self.logger, "webview"; "disposed `{}`", id);

        let payload = serde_json::json!({ "webviewId": id });
        if let Err(e) = self
            .coordinator
            .emit_event(EventType::WebviewDisposed, Some(payload), Some("webview"))
            .await
        {
            warn!(self.logger, "webview"; "webview-disposed listener failed: {}", e);
        }
        true
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Handle inbound messages of exactly `kind`.
    pub fn on_message<F, Fut>(&self, kind: &str, handler: F)
    where
        F: Fn(String, Option<serde_json::Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: MessageHandler = Arc::new(move |id, data| handler(id, data).boxed());
        self.handlers
            .write()
            .entry(kind.to_string())
            .or_default()
            .push(handler);
    }

    async fn route_message(&self, id: &str, message: SurfaceMessage) {
        let handlers = self
            .handlers
            .read()
            .get(&message.kind)
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            log!(self.logger, "webview"; "unhandled message `{}` from `{}`", message.kind, id);
            return;
        }

        for handler in handlers {
            if let Err(e) = handler(id.to_string(), message.data.clone()).await {
                self.recovery
                    .report_error(
                        ErrorCategory::Communication,
                        ErrorSeverity::Medium,
                        format!("handler for `{}` failed: {:#}", message.kind, e),
                        Some(serde_json::json!({
                            "webviewId": id,
                            "messageType": message.kind,
                        })),
                    )
                    .await;
            }
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Whether `id` has completed its handshake.
    pub fn is_ready(&self, id: &str) -> bool {
        self.sessions
            .lock()
            .get(id)
            .is_some_and(|s| s.phase == Phase::Ready)
    }

    pub fn is_visible(&self, id: &str) -> bool {
        self.sessions.lock().get(id).is_some_and(|s| s.visible)
    }

    /// Registered session ids, sorted.
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Messages waiting for the handshake of `id`.
    pub fn queued_messages(&self, id: &str) -> usize {
        self.sessions.lock().get(id).map_or(0, |s| s.queue.len())
    }

    /// Wait until `id` is ready, failing with
    /// [`WebviewError::ReadyTimeout`] after `timeout`.
    pub async fn wait_for_ready(&self, id: &str, timeout: Duration) -> Result<(), WebviewError> {
        let mut ready = self
            .sessions
            .lock()
            .get(id)
            .map(|s| s.ready.subscribe())
            .ok_or_else(|| WebviewError::Unknown(id.to_string()))?;

        let outcome = tokio::time::timeout(timeout, ready.wait_for(|r| *r))
            .await
            .map(|r| r.map(|_| ()));
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(WebviewError::Disposed(id.to_string())),
            Err(_) => {
                let err = WebviewError::ReadyTimeout {
                    id: id.to_string(),
                    timeout,
                };
                self.recovery
                    .report_error(
                        ErrorCategory::Webview,
                        ErrorSeverity::High,
                        err.to_string(),
                        Some(serde_json::json!({ "webviewId": id })),
                    )
                    .await;
                Err(err)
            }
        }
    }
}
