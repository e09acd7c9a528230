//! Lifecycle event definitions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::now_ms;

/// Closed set of events the Coordinator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    ExtensionReady,
    ReloadRequested,
    ReloadStarted,
    ReloadCompleted,
    AnalysisStarted,
    AnalysisCompleted,
    StateSaving,
    StateLoading,
    FileChanged,
    WebviewReady,
    WebviewDisposed,
    Shutdown,
}

impl EventType {
    pub const ALL: [Self; 12] = [
        Self::ExtensionReady,
        Self::ReloadRequested,
        Self::ReloadStarted,
        Self::ReloadCompleted,
        Self::AnalysisStarted,
        Self::AnalysisCompleted,
        Self::StateSaving,
        Self::StateLoading,
        Self::FileChanged,
        Self::WebviewReady,
        Self::WebviewDisposed,
        Self::Shutdown,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::ExtensionReady => "extension-ready",
            Self::ReloadRequested => "reload-requested",
            Self::ReloadStarted => "reload-started",
            Self::ReloadCompleted => "reload-completed",
            Self::AnalysisStarted => "analysis-started",
            Self::AnalysisCompleted => "analysis-completed",
            Self::StateSaving => "state-saving",
            Self::StateLoading => "state-loading",
            Self::FileChanged => "file-changed",
            Self::WebviewReady => "webview-ready",
            Self::WebviewDisposed => "webview-disposed",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A queued event. Consumed exactly once by the drain loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    #[serde(rename = "type")]
    pub kind: EventType,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl LifecycleEvent {
    pub fn new(kind: EventType, payload: Option<serde_json::Value>, source: Option<&str>) -> Self {
        Self {
            kind,
            timestamp: now_ms(),
            payload,
            source: source.map(str::to_string),
        }
    }

    /// Look up a string field in the payload.
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.as_ref()?.get(field)?.as_str()
    }
}
