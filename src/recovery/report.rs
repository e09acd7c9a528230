//! Error taxonomy and reports.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Subsystem an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    FileSystem,
    Webview,
    StateManagement,
    Analysis,
    Communication,
    Lifecycle,
}

impl ErrorCategory {
    pub const ALL: [Self; 6] = [
        Self::FileSystem,
        Self::Webview,
        Self::StateManagement,
        Self::Analysis,
        Self::Communication,
        Self::Lifecycle,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::FileSystem => "file_system",
            Self::Webview => "webview",
            Self::StateManagement => "state_management",
            Self::Analysis => "analysis",
            Self::Communication => "communication",
            Self::Lifecycle => "lifecycle",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How bad an error is. Orthogonal to [`ErrorCategory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn label(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A single reported error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub id: String,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub message: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    pub recovery_attempted: bool,
    pub recovered: bool,
}

impl ErrorReport {
    /// Look up a string field in the report context.
    pub fn context_str(&self, field: &str) -> Option<&str> {
        self.context.as_ref()?.get(field)?.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_names() {
        let report = ErrorReport {
            id: "e1".into(),
            category: ErrorCategory::StateManagement,
            severity: ErrorSeverity::Critical,
            message: "boom".into(),
            timestamp: 1,
            context: Some(serde_json::json!({ "key": "layout" })),
            recovery_attempted: true,
            recovered: false,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["category"], "state_management");
        assert_eq!(json["severity"], "CRITICAL");
        assert_eq!(json["recoveryAttempted"], true);
        assert_eq!(report.context_str("key"), Some("layout"));
        assert_eq!(report.context_str("missing"), None);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(ErrorSeverity::Critical > ErrorSeverity::High);
        assert!(ErrorSeverity::Medium > ErrorSeverity::Low);
    }
}
