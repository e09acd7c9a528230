//! Configuration sections.
//!
//! Every section is plain data with defaults. The component that consumes a
//! section is the one that knows its limits, so each section validates
//! itself into a shared [`ConfigDiagnostics`].
//!
//! # Example
//!
//! ```toml
//! [state]
//! namespace = "vizcore"
//! default_ttl_secs = 86400
//!
//! [state.keys.layout]
//! ttl_secs = 3600
//! max_size = 65536
//!
//! [watch]
//! globs = ["**/*.{ts,tsx}"]
//! ignore = ["**/node_modules/**"]
//! debounce_ms = 300
//!
//! [reload]
//! debounce_ms = 500
//! delay_ms = 100
//! max_per_minute = 10
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigDiagnostics;

// ============================================================================
// [state]
// ============================================================================

/// Persisted state settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSection {
    /// Prefix for every storage key (`<namespace>.<key>`).
    pub namespace: String,
    /// TTL applied to keys without their own policy.
    pub default_ttl_secs: Option<u64>,
    /// Per-key policies.
    pub keys: BTreeMap<String, KeyPolicy>,
}

/// TTL and size limits for a single state key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyPolicy {
    pub ttl_secs: Option<u64>,
    pub max_size: Option<usize>,
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            namespace: "vizcore".into(),
            default_ttl_secs: None,
            keys: BTreeMap::new(),
        }
    }
}

impl StateSection {
    pub fn ttl_for(&self, key: &str) -> Option<Duration> {
        self.keys
            .get(key)
            .and_then(|p| p.ttl_secs)
            .or(self.default_ttl_secs)
            .map(Duration::from_secs)
    }

    pub fn max_size_for(&self, key: &str) -> Option<usize> {
        self.keys.get(key).and_then(|p| p.max_size)
    }

    pub fn validate(&self, diag: &mut ConfigDiagnostics) {
        if self.namespace.is_empty() || self.namespace.chars().any(char::is_whitespace) {
            diag.error_with_hint(
                "state.namespace",
                format!("invalid namespace `{}`", self.namespace),
                "use a non-empty identifier without spaces",
            );
        }
        if self.default_ttl_secs == Some(0) {
            diag.error("state.default_ttl_secs", "must be greater than 0");
        }
        for (key, policy) in &self.keys {
            if policy.ttl_secs == Some(0) {
                diag.error(format!("state.keys.{key}.ttl_secs"), "must be greater than 0");
            }
            if policy.max_size == Some(0) {
                diag.error(format!("state.keys.{key}.max_size"), "must be greater than 0");
            }
        }
    }
}

// ============================================================================
// [watch]
// ============================================================================

/// File watcher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchSection {
    /// Globs to watch, relative to the workspace root.
    pub globs: Vec<String>,
    /// Globs whose events are dropped.
    pub ignore: Vec<String>,
    /// Trailing-edge debounce window.
    pub debounce_ms: u64,
}

impl Default for WatchSection {
    fn default() -> Self {
        Self {
            globs: vec!["**/*.{ts,tsx,js,jsx,mjs,cjs}".into(), "**/package.json".into()],
            ignore: vec![
                "**/node_modules/**".into(),
                "**/.git/**".into(),
                "**/dist/**".into(),
                "**/out/**".into(),
            ],
            debounce_ms: 300,
        }
    }
}

impl WatchSection {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn validate(&self, diag: &mut ConfigDiagnostics) {
        if self.globs.is_empty() {
            diag.error("watch.globs", "at least one glob is required");
        }
        for (field, patterns) in [("watch.globs", &self.globs), ("watch.ignore", &self.ignore)] {
            for pattern in patterns {
                if let Err(e) = globset::Glob::new(pattern) {
                    diag.error(field, format!("invalid glob `{pattern}`: {e}"));
                }
            }
        }
        if self.debounce_ms == 0 || self.debounce_ms > 10_000 {
            diag.error_with_hint(
                "watch.debounce_ms",
                format!("{} is out of range", self.debounce_ms),
                "use a value between 1 and 10000",
            );
        }
    }
}

// ============================================================================
// [reload]
// ============================================================================

/// Reload throttling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloadSection {
    /// Reload requests closer than this to the previous one are skipped.
    pub debounce_ms: u64,
    /// Pause between reload-requested and reload-completed.
    pub delay_ms: u64,
    pub max_per_minute: u32,
}

impl Default for ReloadSection {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            delay_ms: 100,
            max_per_minute: 10,
        }
    }
}

impl ReloadSection {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn validate(&self, diag: &mut ConfigDiagnostics) {
        if self.max_per_minute == 0 {
            diag.error("reload.max_per_minute", "must be greater than 0");
        }
    }
}

// ============================================================================
// [recovery]
// ============================================================================

/// Error recovery and circuit breaker tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    /// Maximum number of error reports kept in memory.
    pub history_limit: usize,
    /// Consecutive failed recoveries that open a category's breaker.
    pub breaker_threshold: u32,
    pub breaker_cooldown_ms: u64,
    /// Trailing window for the periodic rate check.
    pub rate_window_ms: u64,
    /// Errors per window that force a category's breaker open.
    pub rate_threshold: usize,
    pub rate_check_interval_ms: u64,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            history_limit: 100,
            breaker_threshold: 5,
            breaker_cooldown_ms: 60_000,
            rate_window_ms: 60_000,
            rate_threshold: 10,
            rate_check_interval_ms: 10_000,
        }
    }
}

impl RecoverySection {
    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.breaker_cooldown_ms)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }

    pub fn rate_check_interval(&self) -> Duration {
        Duration::from_millis(self.rate_check_interval_ms)
    }

    pub fn validate(&self, diag: &mut ConfigDiagnostics) {
        let positive = [
            ("recovery.history_limit", self.history_limit as u64),
            ("recovery.breaker_threshold", u64::from(self.breaker_threshold)),
            ("recovery.breaker_cooldown_ms", self.breaker_cooldown_ms),
            ("recovery.rate_window_ms", self.rate_window_ms),
            ("recovery.rate_threshold", self.rate_threshold as u64),
            ("recovery.rate_check_interval_ms", self.rate_check_interval_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                diag.error(field, "must be greater than 0");
            }
        }
    }
}
