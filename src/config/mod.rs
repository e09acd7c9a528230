//! Configuration management for `vizcore.toml`.
//!
//! # Sections
//!
//! | Section      | Purpose                                         |
//! |--------------|-------------------------------------------------|
//! | `[state]`    | Storage namespace, per-key TTL and size limits  |
//! | `[watch]`    | Watch globs, ignore globs, debounce window      |
//! | `[reload]`   | Reload debounce, delay and rate limit           |
//! | `[recovery]` | Error history, breaker and rate-check tuning    |

mod error;
mod section;

pub use error::{ConfigDiagnostic, ConfigDiagnostics, ConfigError};
pub use section::{KeyPolicy, RecoverySection, ReloadSection, StateSection, WatchSection};

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Default config file name, looked up in the workspace root.
pub const CONFIG_FILE: &str = "vizcore.toml";

// ============================================================================
// root configuration
// ============================================================================

/// Root configuration structure representing vizcore.toml
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VizConfig {
    pub state: StateSection,
    pub watch: WatchSection,
    pub reload: ReloadSection,
    pub recovery: RecoverySection,
}

impl VizConfig {
    /// Parse and validate configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::parse(&content)
    }

    /// Validate every section, collecting all diagnostics before failing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut diag = ConfigDiagnostics::new();
        self.state.validate(&mut diag);
        self.watch.validate(&mut diag);
        self.reload.validate(&mut diag);
        self.recovery.validate(&mut diag);
        diag.into_result()
    }
}
