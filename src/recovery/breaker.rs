use std::time::Duration;

use tokio::time::Instant;

use super::ErrorCategory;

/// Per-category circuit breaker.
///
/// Open only while `failure_count >= threshold` and the cooldown since the
/// last failure has not elapsed. An expired breaker closes itself on the
/// next check.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    pub category: ErrorCategory,
    pub failure_count: u32,
    pub last_failure: Option<Instant>,
    pub open: bool,
}

impl CircuitBreaker {
    pub fn new(category: ErrorCategory) -> Self {
        Self {
            category,
            failure_count: 0,
            last_failure: None,
            open: false,
        }
    }

    /// Check the breaker, closing it if the cooldown has elapsed.
    pub fn is_open(&mut self, cooldown: Duration) -> bool {
        if !self.open {
            return false;
        }
        let expired = self
            .last_failure
            .is_none_or(|at| at.elapsed() >= cooldown);
        if expired {
            self.reset();
            return false;
        }
        true
    }

    pub fn record_success(&mut self) {
        self.reset();
    }

    /// Count a failed recovery. Returns true if this opened the breaker.
    pub fn record_failure(&mut self, threshold: u32) -> bool {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());
        if !self.open && self.failure_count >= threshold {
            self.open = true;
            return true;
        }
        false
    }

    /// Open regardless of the failure count (rate check).
    pub fn force_open(&mut self, threshold: u32) {
        self.failure_count = self.failure_count.max(threshold);
        self.last_failure = Some(Instant::now());
        self.open = true;
    }

    fn reset(&mut self) {
        self.failure_count = 0;
        self.last_failure = None;
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold() {
        let mut breaker = CircuitBreaker::new(ErrorCategory::Webview);
        assert!(!breaker.record_failure(3));
        assert!(!breaker.record_failure(3));
        assert!(!breaker.is_open(COOLDOWN));
        assert!(breaker.record_failure(3));
        assert!(breaker.is_open(COOLDOWN));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closes_after_cooldown() {
        let mut breaker = CircuitBreaker::new(ErrorCategory::Webview);
        breaker.force_open(5);
        assert!(breaker.is_open(COOLDOWN));
        assert_eq!(breaker.failure_count, 5);

        tokio::time::advance(COOLDOWN).await;
        assert!(!breaker.is_open(COOLDOWN));
        assert_eq!(breaker.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets() {
        let mut breaker = CircuitBreaker::new(ErrorCategory::Analysis);
        breaker.record_failure(2);
        breaker.record_failure(2);
        breaker.record_success();
        assert!(!breaker.open);
        assert_eq!(breaker.failure_count, 0);
    }
}
