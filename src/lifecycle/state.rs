//! Extension state machine.
//!
//! ```text
//! INITIALIZING --ready--> READY <--reload-requested/completed--> RELOADING
//!                           ^ |
//!      analysis-completed   | |  analysis-started
//!                           | v
//!                           BUSY
//!
//! READY | BUSY | RELOADING --shutdown--> SHUTTING_DOWN (terminal)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use super::EventType;

/// Current lifecycle phase. Owned and mutated only by the Coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExtensionState {
    Initializing,
    Ready,
    Busy,
    Reloading,
    ShuttingDown,
}

impl ExtensionState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::Ready => "READY",
            Self::Busy => "BUSY",
            Self::Reloading => "RELOADING",
            Self::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

impl fmt::Display for ExtensionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Work attached to a transition, run right after the state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionHook {
    /// Drain pending operations, then queue state-saving and reload-started
    BeginReload,
    /// Queue state-loading
    CompleteReload,
}

/// One edge of the static transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: ExtensionState,
    pub to: ExtensionState,
    pub trigger: EventType,
    pub hook: Option<TransitionHook>,
}

const fn edge(
    from: ExtensionState,
    to: ExtensionState,
    trigger: EventType,
    hook: Option<TransitionHook>,
) -> StateTransition {
    StateTransition {
        from,
        to,
        trigger,
        hook,
    }
}

use self::ExtensionState as S;
use super::EventType as E;

/// The complete transition table. Nothing else may change state.
pub const TRANSITIONS: &[StateTransition] = &[
    edge(S::Initializing, S::Ready, E::ExtensionReady, None),
    edge(S::Ready, S::Reloading, E::ReloadRequested, Some(TransitionHook::BeginReload)),
    edge(S::Reloading, S::Ready, E::ReloadCompleted, Some(TransitionHook::CompleteReload)),
    edge(S::Ready, S::Busy, E::AnalysisStarted, None),
    edge(S::Busy, S::Ready, E::AnalysisCompleted, None),
    edge(S::Ready, S::ShuttingDown, E::Shutdown, None),
    edge(S::Busy, S::ShuttingDown, E::Shutdown, None),
    edge(S::Reloading, S::ShuttingDown, E::Shutdown, None),
];

/// Transition triggered by `event` in state `from`, if any.
pub fn find_transition(from: ExtensionState, event: EventType) -> Option<&'static StateTransition> {
    TRANSITIONS
        .iter()
        .find(|t| t.from == from && t.trigger == event)
}

/// Whether the table has an edge `from -> to`.
pub fn is_valid_transition(from: ExtensionState, to: ExtensionState) -> bool {
    TRANSITIONS.iter().any(|t| t.from == from && t.to == to)
}
