use std::path::Path;

use super::types::FileChangeEvent;

/// Pure debouncer: coalescing and timer generations.
/// No timers of its own, no I/O.
#[derive(Debug, Default)]
pub(super) struct Debouncer {
    /// At most one event per path, ordered by last arrival
    pending: Vec<FileChangeEvent>,
    /// Bumped on every push and cancel; a timer only fires for the
    /// generation it was armed with
    generation: u64,
}

impl Debouncer {
    /// Queue `event`, replacing any earlier event for the same path.
    /// Returns the generation the timer should be armed with.
    pub(super) fn push(&mut self, event: FileChangeEvent) -> u64 {
        self.pending.retain(|e| e.path != event.path);
        self.pending.push(event);
        self.generation += 1;
        self.generation
    }

    /// Invalidate any armed timer without dropping queued events.
    pub(super) fn cancel(&mut self) {
        self.generation += 1;
    }

    pub(super) fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    pub(super) fn take(&mut self) -> Vec<FileChangeEvent> {
        std::mem::take(&mut self.pending)
    }

    pub(super) fn clear(&mut self) {
        self.pending.clear();
        self.cancel();
    }

    pub(super) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Check if path is a temp/backup file (editor artifacts).
///
/// Ordinary dot-files such as `.env` are not artifacts; hiding those is
/// left to `[watch] ignore`.
pub(super) fn is_temp_file(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

    matches!(ext, "bck" | "bak" | "backup" | "swp" | "swo" | "tmp")
        || name.ends_with('~')
        // emacs lock and autosave files
        || name.starts_with(".#")
        || (name.len() > 1 && name.starts_with('#') && name.ends_with('#'))
        // vim write check file
        || name == "4913"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::ChangeKind;

    fn event(path: &str, kind: ChangeKind) -> FileChangeEvent {
        FileChangeEvent::new(path, kind)
    }

    #[test]
    fn test_latest_event_per_path_wins() {
        let mut d = Debouncer::default();
        d.push(event("a.ts", ChangeKind::Create));
        d.push(event("b.ts", ChangeKind::Change));
        d.push(event("a.ts", ChangeKind::Change));
        d.push(event("a.ts", ChangeKind::Delete));

        let events = d.take();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].path, Path::new("b.ts"));
        assert_eq!(events[1].kind, ChangeKind::Delete);
        assert!(d.is_empty());
    }

    #[test]
    fn test_generations() {
        let mut d = Debouncer::default();
        let first = d.push(event("a.ts", ChangeKind::Change));
        let second = d.push(event("b.ts", ChangeKind::Change));
        assert!(!d.is_current(first));
        assert!(d.is_current(second));

        d.cancel();
        assert!(!d.is_current(second));
        assert_eq!(d.len(), 2);

        d.clear();
        assert!(d.is_empty());
    }

    #[test]
    fn test_temp_files() {
        let artifacts = [
            "a.ts.swp", ".a.ts.swp", "notes.tmp", "main.ts~", "x.bak", ".#main.ts", "#main.ts#",
            "4913",
        ];
        for path in artifacts {
            assert!(is_temp_file(Path::new(path)), "{path}");
        }
        for path in ["src/main.ts", "package.json", "a.d.ts", ".eslintrc.json", ".env", "#"] {
            assert!(!is_temp_file(Path::new(path)), "{path}");
        }
    }
}
