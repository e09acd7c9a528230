//! vizcore - coordination core for an embedded visualization plugin.
//!
//! Five cooperating components, wired together by [`Extension`]:
//!
//! | Component                          | Owns                                         |
//! |------------------------------------|----------------------------------------------|
//! | [`lifecycle::Coordinator`]         | extension state, serialized event queue      |
//! | [`webview::WebviewCoordinator`]    | render-surface sessions, readiness handshake |
//! | [`state::StateManager`]            | checksummed, TTL-bound persisted snapshots   |
//! | [`watch::FileWatcher`]             | debounced, pausable file change stream       |
//! | [`recovery::ErrorRecoverySystem`]  | error intake, strategies, circuit breakers   |

pub mod config;
pub mod core;
pub mod extension;
pub mod lifecycle;
pub mod logger;
pub mod recovery;
pub mod state;
pub mod watch;
pub mod webview;

pub use extension::{Extension, ExtensionError, Host};
pub use logger::Logger;
