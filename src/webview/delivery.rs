//! Outbound delivery: queueing, handshake flush and fan-out.

use std::sync::Arc;

use crate::lifecycle::EventType;
use crate::recovery::{ErrorCategory, ErrorSeverity};
use crate::{debug, log, warn};

use super::{Phase, RenderPanel, SurfaceMessage, WebviewCoordinator};

impl WebviewCoordinator {
    /// Deliver `message` to `id`, or queue it until the handshake.
    ///
    /// Never fails: delivery errors are reported to the recovery system.
    pub async fn send_message(&self, id: &str, message: SurfaceMessage) {
        let panel = {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.get_mut(id) else {
                warn!(self.logger, "webview"; "dropping `{}`: unknown webview `{}`", message.kind, id);
                return;
            };
            if session.phase != Phase::Ready {
                debug!(self.logger, "webview"; "queued `{}` for `{}`", message.kind, id);
                session.queue.push_back(message);
                return;
            }
            Arc::clone(&session.panel)
        };
        self.deliver(id, &panel, message).await;
    }

    /// Send `message` to every session.
    pub async fn broadcast_message(&self, message: SurfaceMessage) {
        let ids = self.session_ids();
        if ids.is_empty() {
            debug!(self.logger, "webview"; "no webviews for `{}`", message.kind);
            return;
        }
        for id in &ids {
            self.send_message(id, message.clone()).await;
        }
        debug!(self.logger, "webview"; "broadcast `{}` to {} webview(s)", message.kind, ids.len());
    }

    /// Flush the queue in order, then mark the session ready.
    ///
    /// Sends arriving mid-flush keep queueing behind the flushed batch;
    /// the session turns ready only once the queue is observed empty.
    pub(super) async fn complete_handshake(&self, id: &str) {
        {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.get_mut(id) else {
                return;
            };
            if session.phase != Phase::Pending {
                debug!(self.logger, "webview"; "ignoring repeated ready from `{}`", id);
                return;
            }
            session.phase = Phase::Flushing;
        }

        let mut flushed = 0;
        loop {
            let (panel, batch) = {
                let mut sessions = self.sessions.lock();
                let Some(session) = sessions.get_mut(id) else {
                    return;
                };
                if session.queue.is_empty() {
                    session.phase = Phase::Ready;
                    session.ready.send_replace(true);
                    break;
                }
                let batch: Vec<_> = session.queue.drain(..).collect();
                (Arc::clone(&session.panel), batch)
            };
            for message in batch {
                self.deliver(id, &panel, message).await;
                flushed += 1;
            }
        }
        log!(self.logger, "webview"; "`{}` ready, flushed {} queued message(s)", id, flushed);

        let payload = serde_json::json!({ "webviewId": id });
        if let Err(e) = self
            .coordinator
            .emit_event(EventType::WebviewReady, Some(payload), Some("webview"))
            .await
        {
            warn!(self.logger, "webview"; "webview-ready listener failed: {}", e);
        }
    }

    async fn deliver(&self, id: &str, panel: &Arc<dyn RenderPanel>, message: SurfaceMessage) {
        if let Err(e) = panel.post_message(&message).await {
            self.recovery
                .report_error(
                    ErrorCategory::Communication,
                    ErrorSeverity::High,
                    format!("failed to deliver `{}` to `{}`: {:#}", message.kind, id, e),
                    Some(serde_json::json!({
                        "webviewId": id,
                        "messageType": message.kind,
                    })),
                )
                .await;
        }
    }
}
