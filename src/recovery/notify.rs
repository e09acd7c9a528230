//! User-facing notifications for reported errors.

use async_trait::async_trait;
use owo_colors::OwoColorize;

use super::ErrorSeverity;

/// Presentation level of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    /// Blocking dialog
    Error,
    /// Passive toast
    Warning,
    Info,
}

impl NotificationLevel {
    /// Level for a severity. LOW is never surfaced.
    pub fn for_severity(severity: ErrorSeverity) -> Option<Self> {
        match severity {
            ErrorSeverity::Critical | ErrorSeverity::High => Some(Self::Error),
            ErrorSeverity::Medium => Some(Self::Warning),
            ErrorSeverity::Low => None,
        }
    }
}

/// Actions offered on error dialogs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationAction {
    ViewDetails,
    ReportIssue,
}

impl NotificationAction {
    pub fn label(self) -> &'static str {
        match self {
            Self::ViewDetails => "View Details",
            Self::ReportIssue => "Report Issue",
        }
    }
}

/// Host notification primitive.
///
/// Resolves with the action the user picked, or `None` if the
/// notification was dismissed.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn show(
        &self,
        message: &str,
        level: NotificationLevel,
        actions: &[NotificationAction],
    ) -> Option<NotificationAction>;
}

/// Notifier for headless runs: prints and never picks an action.
pub struct ConsoleNotifier;

#[async_trait]
impl Notifier for ConsoleNotifier {
    async fn show(
        &self,
        message: &str,
        level: NotificationLevel,
        _actions: &[NotificationAction],
    ) -> Option<NotificationAction> {
        match level {
            NotificationLevel::Error => eprintln!("{} {}", "✗".red(), message),
            NotificationLevel::Warning => eprintln!("{} {}", "⚠".yellow(), message),
            NotificationLevel::Info => eprintln!("{message}"),
        }
        None
    }
}
