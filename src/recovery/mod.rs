//! Error Recovery System
//!
//! Uniform error intake for every component:
//!
//! ```text
//! report_error --> history (bounded) --> breaker open? --yes--> fast fail
//!                                             |
//!                                             no
//!                                             v
//!                              strategies in registration order
//!                                             |
//!                                   success resets breaker,
//!                                   failure counts towards opening it
//! ```
//!
//! A periodic rate check force-opens the breaker of any category that
//! produces a burst of errors, even when each error on its own recovered
//! or never reached the failure threshold.

mod breaker;
mod notify;
mod report;
mod strategy;


pub use breaker::CircuitBreaker;
pub use notify::{ConsoleNotifier, NotificationAction, NotificationLevel, Notifier};
pub use report::{ErrorCategory, ErrorReport, ErrorSeverity};
pub use strategy::RecoveryStrategy;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::RecoverySection;
use crate::core::now_ms;
use crate::logger::Logger;
use crate::{debug, error, log, warn};
use strategy::StrategySlot;

struct Recorded {
    at: Instant,
    report: ErrorReport,
}

/// Error intake, strategy-based recovery and circuit breakers.
pub struct ErrorRecoverySystem {
    config: RecoverySection,
    /// Oldest first, bounded by `history_limit`
    history: Mutex<VecDeque<Recorded>>,
    strategies: RwLock<FxHashMap<ErrorCategory, Vec<Arc<StrategySlot>>>>,
    /// Created lazily per category
    breakers: Mutex<FxHashMap<ErrorCategory, CircuitBreaker>>,
    notifier: Option<Arc<dyn Notifier>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    seq: AtomicU64,
    logger: Logger,
}

impl ErrorRecoverySystem {
    pub fn new(config: RecoverySection, logger: Logger) -> Self {
        Self {
            config,
            history: Mutex::new(VecDeque::new()),
            strategies: RwLock::new(FxHashMap::default()),
            breakers: Mutex::new(FxHashMap::default()),
            notifier: None,
            monitor: Mutex::new(None),
            seq: AtomicU64::new(0),
            logger,
        }
    }

    /// Surface reports through a host notifier.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Add a strategy for `category`. Strategies run in registration order.
    pub fn register_strategy(&self, category: ErrorCategory, strategy: RecoveryStrategy) {
        debug!(self.logger, "recovery"; "strategy `{}` registered for {}", strategy.name, category);
        self.strategies
            .write()
            .entry(category)
            .or_default()
            .push(Arc::new(StrategySlot::new(strategy)));
    }

    /// Record an error and try to recover from it.
    ///
    /// Returns whether a strategy recovered. Never fails: strategy errors
    /// are absorbed and count as failed attempts.
    pub async fn report_error(
        &self,
        category: ErrorCategory,
        severity: ErrorSeverity,
        message: impl Into<String>,
        context: Option<serde_json::Value>,
    ) -> bool {
        let mut report = ErrorReport {
            id: self.next_id(),
            category,
            severity,
            message: message.into(),
            timestamp: now_ms(),
            context,
            recovery_attempted: false,
            recovered: false,
        };
        self.log_report(&report);

        if self.is_circuit_open(category) {
            debug!(self.logger, "recovery"; "circuit open for {}, skipping recovery", category);
            self.record(report.clone());
            self.notify(report);
            return false;
        }

        let (attempted, recovered) = self.attempt_recovery(&report).await;
        self.update_breaker(category, recovered);

        report.recovery_attempted = attempted;
        report.recovered = recovered;
        self.record(report.clone());

        if recovered {
            log!(self.logger, "recovery"; "recovered from {} error: {}", category, report.message);
        } else {
            self.notify(report);
        }
        recovered
    }

    /// Run applicable strategies until one succeeds.
    ///
    /// Returns `(attempted, recovered)`.
    async fn attempt_recovery(&self, report: &ErrorReport) -> (bool, bool) {
        let slots = self
            .strategies
            .read()
            .get(&report.category)
            .cloned()
            .unwrap_or_default();

        let mut attempted = false;
        for slot in slots {
            let name = &slot.strategy.name;
            if let Some(reason) = slot.skip_reason(report) {
                debug!(self.logger, "recovery"; "skip `{}`: {}", name, reason);
                continue;
            }

            attempted = true;
            slot.begin_attempt();
            match slot.strategy.recover(report.clone()).await {
                Ok(true) => {
                    slot.succeeded();
                    debug!(self.logger, "recovery"; "`{}` succeeded", name);
                    return (true, true);
                }
                Ok(false) => {
                    slot.failed();
                    debug!(self.logger, "recovery"; "`{}` did not recover (attempt {})", name, slot.attempt_count());
                }
                Err(e) => {
                    slot.failed();
                    warn!(self.logger, "recovery"; "`{}` failed: {:#}", name, e);
                }
            }
        }
        (attempted, false)
    }

    fn update_breaker(&self, category: ErrorCategory, recovered: bool) {
        let mut breakers = self.breakers.lock();
        let breaker = breakers
            .entry(category)
            .or_insert_with(|| CircuitBreaker::new(category));
        if recovered {
            breaker.record_success();
        } else if breaker.record_failure(self.config.breaker_threshold) {
            warn!(self.logger, "recovery"; "circuit opened for {} after {} failures", category, breaker.failure_count);
        }
    }

    /// Whether `category` currently fast-fails. Expired breakers close here.
    pub fn is_circuit_open(&self, category: ErrorCategory) -> bool {
        let cooldown = self.config.breaker_cooldown();
        self.breakers
            .lock()
            .get_mut(&category)
            .is_some_and(|b| b.is_open(cooldown))
    }

    /// Snapshot of a category's breaker, if one was created.
    pub fn breaker(&self, category: ErrorCategory) -> Option<CircuitBreaker> {
        self.breakers.lock().get(&category).cloned()
    }

    // ========================================================================
    // Rate monitoring
    // ========================================================================

    /// Force-open breakers for categories that crossed the rate threshold in
    /// the trailing window. Returns the categories opened by this pass.
    pub fn check_error_rates(&self) -> Vec<ErrorCategory> {
        let window = self.config.rate_window();
        let now = Instant::now();

        let mut counts: FxHashMap<ErrorCategory, usize> = FxHashMap::default();
        for recorded in self.history.lock().iter() {
            if now.duration_since(recorded.at) <= window {
                *counts.entry(recorded.report.category).or_default() += 1;
            }
        }

        let cooldown = self.config.breaker_cooldown();
        let mut opened = Vec::new();
        let mut breakers = self.breakers.lock();
        for category in ErrorCategory::ALL {
            let count = counts.get(&category).copied().unwrap_or(0);
            if count < self.config.rate_threshold {
                continue;
            }
            let breaker = breakers
                .entry(category)
                .or_insert_with(|| CircuitBreaker::new(category));
            if breaker.is_open(cooldown) {
                continue;
            }
            breaker.force_open(self.config.breaker_threshold);
            warn!(self.logger, "recovery"; "{} errors in {} within {:?}, circuit opened", count, category, window);
            opened.push(category);
        }
        opened
    }

    /// Start the periodic rate check. No-op if already running.
    pub fn start_monitoring(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.rate_check_interval();
        *monitor = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // First tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(this) = weak.upgrade() else { break };
                this.check_error_rates();
            }
        }));
    }

    // ========================================================================
    // History
    // ========================================================================

    fn record(&self, report: ErrorReport) {
        let mut history = self.history.lock();
        history.push_back(Recorded {
            at: Instant::now(),
            report,
        });
        while history.len() > self.config.history_limit {
            history.pop_front();
        }
    }

    /// Up to `limit` most recent reports, oldest first.
    pub fn recent_errors(&self, limit: usize) -> Vec<ErrorReport> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).map(|r| r.report.clone()).collect()
    }

    pub fn error_count(&self, category: ErrorCategory) -> usize {
        self.history
            .lock()
            .iter()
            .filter(|r| r.report.category == category)
            .count()
    }

    fn next_id(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("err-{}-{}", now_ms(), seq)
    }

    // ========================================================================
    // Presentation
    // ========================================================================

    fn log_report(&self, report: &ErrorReport) {
        let (category, message) = (report.category, &report.message);
        match report.severity {
            ErrorSeverity::Critical | ErrorSeverity::High => {
                error!(self.logger, "recovery"; "[{}] {}: {}", report.severity, category, message)
            }
            ErrorSeverity::Medium => {
                warn!(self.logger, "recovery"; "[{}] {}: {}", report.severity, category, message)
            }
            ErrorSeverity::Low => {
                log!(self.logger, "recovery"; "[{}] {}: {}", report.severity, category, message)
            }
        }
    }

    /// Surface a report to the user without waiting for their answer.
    fn notify(&self, report: ErrorReport) {
        let Some(notifier) = self.notifier.clone() else {
            return;
        };
        let Some(level) = NotificationLevel::for_severity(report.severity) else {
            return;
        };

        let logger = self.logger.clone();
        tokio::spawn(async move {
            let actions: &[NotificationAction] = match level {
                NotificationLevel::Error => {
                    &[NotificationAction::ViewDetails, NotificationAction::ReportIssue]
                }
                _ => &[],
            };
            let message = format!("{} error: {}", report.category, report.message);
            match notifier.show(&message, level, actions).await {
                Some(NotificationAction::ViewDetails) => {
                    let details = serde_json::to_string_pretty(&report).unwrap_or_default();
                    log!(logger, "recovery"; "error details:\n{}", details);
                }
                Some(NotificationAction::ReportIssue) => {
                    let body = serde_json::json!({
                        "title": format!("[{}] {}", report.severity, report.category),
                        "body": report,
                    });
                    log!(logger, "recovery"; "issue report:\n{}", body);
                }
                None => {}
            }
        });
    }

    /// Stop monitoring and drop all in-memory state.
    pub fn dispose(&self) {
        if let Some(handle) = self.monitor.lock().take() {
            handle.abort();
        }
        self.history.lock().clear();
        self.breakers.lock().clear();
        self.strategies.write().clear();
        debug!(self.logger, "recovery"; "disposed");
    }
}

impl Drop for ErrorRecoverySystem {
    fn drop(&mut self) {
        if let Some(handle) = self.monitor.get_mut().take() {
            handle.abort();
        }
    }
}
