use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::ErrorReport;
use crate::core::BoxFuture;

type Predicate = Arc<dyn Fn(&ErrorReport) -> bool + Send + Sync>;
type RecoverFn = Arc<dyn Fn(ErrorReport) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

/// A way of healing one kind of error.
///
/// `recover` resolves to `Ok(true)` when the error was dealt with. `Ok(false)`
/// and `Err(_)` both count as a failed attempt.
#[derive(Clone)]
pub struct RecoveryStrategy {
    pub name: String,
    can_recover: Predicate,
    recover: RecoverFn,
    pub max_attempts: u32,
    pub cooldown: Duration,
}

impl RecoveryStrategy {
    pub fn new<F, Fut>(name: impl Into<String>, recover: F) -> Self
    where
        F: Fn(ErrorReport) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        Self {
            name: name.into(),
            can_recover: Arc::new(|_| true),
            recover: Arc::new(move |report| recover(report).boxed()),
            max_attempts: 3,
            cooldown: Duration::ZERO,
        }
    }

    /// Only handle errors accepted by `predicate`.
    pub fn when(mut self, predicate: impl Fn(&ErrorReport) -> bool + Send + Sync + 'static) -> Self {
        self.can_recover = Arc::new(predicate);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Minimum time between two attempts of this strategy.
    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn can_recover(&self, report: &ErrorReport) -> bool {
        (self.can_recover)(report)
    }

    pub(super) fn recover(&self, report: ErrorReport) -> BoxFuture<'static, anyhow::Result<bool>> {
        (self.recover)(report)
    }
}

impl std::fmt::Debug for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryStrategy")
            .field("name", &self.name)
            .field("max_attempts", &self.max_attempts)
            .field("cooldown", &self.cooldown)
            .finish_non_exhaustive()
    }
}

/// A registered strategy plus its attempt bookkeeping.
pub(super) struct StrategySlot {
    pub(super) strategy: RecoveryStrategy,
    attempts: Mutex<Attempts>,
}

#[derive(Default)]
struct Attempts {
    count: u32,
    last: Option<Instant>,
}

impl StrategySlot {
    pub(super) fn new(strategy: RecoveryStrategy) -> Self {
        Self {
            strategy,
            attempts: Mutex::new(Attempts::default()),
        }
    }

    /// Why this slot must be skipped for `report`, if it must.
    pub(super) fn skip_reason(&self, report: &ErrorReport) -> Option<&'static str> {
        if !self.strategy.can_recover(report) {
            return Some("not applicable");
        }
        let attempts = self.attempts.lock();
        if attempts.count >= self.strategy.max_attempts {
            return Some("attempts exhausted");
        }
        if let Some(last) = attempts.last
            && last.elapsed() < self.strategy.cooldown
        {
            return Some("cooling down");
        }
        None
    }

    pub(super) fn begin_attempt(&self) {
        self.attempts.lock().last = Some(Instant::now());
    }

    pub(super) fn succeeded(&self) {
        self.attempts.lock().count = 0;
    }

    pub(super) fn failed(&self) {
        self.attempts.lock().count += 1;
    }

    pub(super) fn attempt_count(&self) -> u32 {
        self.attempts.lock().count
    }
}
