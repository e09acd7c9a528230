//! Errors raised while loading `vizcore.toml`.

use std::fmt;
use std::path::PathBuf;

use owo_colors::OwoColorize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read `{}`", .0.display())]
    Io(PathBuf, #[source] std::io::Error),

    #[error("invalid TOML")]
    Toml(#[from] toml::de::Error),

    /// Every validation problem found, not just the first
    #[error("{0}")]
    Diagnostics(ConfigDiagnostics),
}

/// One rejected field.
#[derive(Debug, Clone)]
pub struct ConfigDiagnostic {
    /// Dotted path, e.g. `watch.debounce_ms`
    pub field: String,
    pub message: String,
    pub hint: Option<String>,
}

impl fmt::Display for ConfigDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field.cyan(), self.message)?;
        match &self.hint {
            Some(hint) => write!(f, " ({} {})", "hint:".yellow(), hint),
            None => Ok(()),
        }
    }
}

/// Collector shared by the per-section `validate` calls.
#[derive(Debug, Default)]
pub struct ConfigDiagnostics(Vec<ConfigDiagnostic>);

impl ConfigDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.push(field.into(), message.into(), None);
    }

    pub fn error_with_hint(
        &mut self,
        field: impl Into<String>,
        message: impl Into<String>,
        hint: impl Into<String>,
    ) {
        self.push(field.into(), message.into(), Some(hint.into()));
    }

    fn push(&mut self, field: String, message: String, hint: Option<String>) {
        self.0.push(ConfigDiagnostic {
            field,
            message,
            hint,
        });
    }

    pub fn errors(&self) -> &[ConfigDiagnostic] {
        &self.0
    }

    pub fn into_result(self) -> Result<(), ConfigError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Diagnostics(self))
        }
    }
}

impl fmt::Display for ConfigDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", "invalid config".red().bold(), self.0.len())?;
        for diag in &self.0 {
            write!(f, "\n  - {diag}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostics_into_result() {
        assert!(ConfigDiagnostics::new().into_result().is_ok());

        let mut diag = ConfigDiagnostics::new();
        diag.error("reload.max_per_minute", "must be greater than 0");
        diag.error_with_hint("watch.debounce_ms", "must be positive", "try 300");
        assert_eq!(diag.errors().len(), 2);

        let display = diag.into_result().unwrap_err().to_string();
        assert!(display.contains("reload.max_per_minute"));
        assert!(display.contains("watch.debounce_ms"));
        assert!(display.contains("try 300"));
    }

    #[test]
    fn test_io_error_names_path() {
        let err = ConfigError::Io(
            PathBuf::from("vizcore.toml"),
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        assert!(err.to_string().contains("vizcore.toml"));
    }
}
