//! Core types - small abstractions shared across components.

mod pending;

pub use pending::{PendingGuard, PendingSet};

use std::time::{SystemTime, UNIX_EPOCH};

pub use futures::future::BoxFuture;

/// Milliseconds since the Unix epoch.
///
/// Used for persisted and reported timestamps. In-process timing
/// (debounce, cooldowns) uses `tokio::time::Instant` instead.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
