use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::now_ms;

/// What happened to a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Change,
    Delete,
}

impl ChangeKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Change => "change",
            Self::Delete => "delete",
        }
    }

    /// Map a notify event kind. Access and metadata-only events are noise.
    pub fn from_notify(kind: &notify::EventKind) -> Option<Self> {
        use notify::EventKind;
        use notify::event::ModifyKind;

        match kind {
            EventKind::Create(_) => Some(Self::Create),
            EventKind::Remove(_) => Some(Self::Delete),
            EventKind::Modify(ModifyKind::Metadata(_)) => None,
            EventKind::Modify(_) => Some(Self::Change),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A single raw or coalesced file change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl FileChangeEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            timestamp: now_ms(),
        }
    }
}

/// What a watch backend reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchSignal {
    Change(FileChangeEvent),
    /// The backend hit an error but may keep running
    Error(String),
}

/// Which backend is delivering events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// One native recursive watch per glob
    Native,
    /// Polling over the whole root
    Polling,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Native => "native",
            Self::Polling => "polling",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::EventKind;
    use notify::event::{CreateKind, MetadataKind, ModifyKind, RemoveKind};

    #[test]
    fn test_from_notify() {
        assert_eq!(
            ChangeKind::from_notify(&EventKind::Create(CreateKind::File)),
            Some(ChangeKind::Create)
        );
        assert_eq!(
            ChangeKind::from_notify(&EventKind::Remove(RemoveKind::Any)),
            Some(ChangeKind::Delete)
        );
        assert_eq!(
            ChangeKind::from_notify(&EventKind::Modify(ModifyKind::Any)),
            Some(ChangeKind::Change)
        );
        assert_eq!(
            ChangeKind::from_notify(&EventKind::Modify(ModifyKind::Metadata(
                MetadataKind::WriteTime
            ))),
            None
        );
    }

    #[test]
    fn test_kind_serializes_lowercase() {
        assert_eq!(serde_json::to_value(ChangeKind::Delete).unwrap(), "delete");
    }
}
