//! Filesystem watch backends.
//!
//! ```text
//! preferred:  one recursive native watcher per glob --(globset)--> sink
//! fallback:   one polling watcher over the root ------------------> sink
//!                                                 (FileWatcher filters)
//! ```

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use globset::{Glob, GlobMatcher};
use notify::{PollWatcher, RecursiveMode, Watcher};

use super::types::{ChangeKind, FileChangeEvent, WatchSignal};

/// Receives backend signals. Called from backend threads.
pub type SignalSink = Arc<dyn Fn(WatchSignal) + Send + Sync>;

/// Keeps a watch alive. Dropping it stops the watch.
pub struct WatchHandle {
    _guard: Box<dyn Any + Send>,
}

impl WatchHandle {
    pub fn new<T: Send + 'static>(guard: T) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WatchHandle")
    }
}

/// Host filesystem-watch primitive.
pub trait WatchProvider: Send + Sync {
    /// Watch files under `root` matching `pattern` (relative to `root`).
    fn watch_pattern(
        &self,
        root: &Path,
        pattern: &str,
        sink: SignalSink,
    ) -> anyhow::Result<WatchHandle>;

    /// Coarse watch over everything below `dir`.
    fn watch_directory(&self, dir: &Path, sink: SignalSink) -> anyhow::Result<WatchHandle>;
}

/// `notify`-based provider.
#[derive(Debug, Clone)]
pub struct NotifyProvider {
    poll_interval: Duration,
}

impl NotifyProvider {
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Default for NotifyProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchProvider for NotifyProvider {
    fn watch_pattern(
        &self,
        root: &Path,
        pattern: &str,
        sink: SignalSink,
    ) -> anyhow::Result<WatchHandle> {
        let matcher = Glob::new(pattern)
            .with_context(|| format!("invalid glob `{pattern}`"))?
            .compile_matcher();
        let filter = PatternFilter {
            root: root.to_path_buf(),
            matcher,
        };

        let mut watcher = notify::recommended_watcher(move |res| {
            forward(res, &sink, |path| filter.matches(path));
        })?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch {}", root.display()))?;
        Ok(WatchHandle::new(watcher))
    }

    fn watch_directory(&self, dir: &Path, sink: SignalSink) -> anyhow::Result<WatchHandle> {
        let config = notify::Config::default().with_poll_interval(self.poll_interval);
        let mut watcher = PollWatcher::new(move |res| forward(res, &sink, |_| true), config)?;
        watcher
            .watch(dir, RecursiveMode::Recursive)
            .with_context(|| format!("failed to poll {}", dir.display()))?;
        Ok(WatchHandle::new(watcher))
    }
}

/// Translate one notify callback into signals.
fn forward(
    res: notify::Result<notify::Event>,
    sink: &SignalSink,
    accept: impl Fn(&Path) -> bool,
) {
    match res {
        Ok(event) => {
            let Some(kind) = ChangeKind::from_notify(&event.kind) else {
                return;
            };
            for path in event.paths.into_iter().filter(|p| accept(p)) {
                sink(WatchSignal::Change(FileChangeEvent::new(path, kind)));
            }
        }
        Err(e) => sink(WatchSignal::Error(e.to_string())),
    }
}

/// Matches absolute paths against a glob relative to `root`.
pub(super) struct PatternFilter {
    root: PathBuf,
    matcher: GlobMatcher,
}

impl PatternFilter {
    pub(super) fn matches(&self, path: &Path) -> bool {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        self.matcher.is_match(relative)
    }
}
