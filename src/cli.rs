//! Command-line interface definitions.

use std::path::PathBuf;

use clap::{ColorChoice, Parser, Subcommand, ValueEnum};

use vizcore::state::StateScope;

/// Headless runner for the vizcore coordination core
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None, arg_required_else_help = true)]
pub struct Cli {
    /// Control colored output (auto, always, never)
    #[arg(long, global = true, default_value = "auto")]
    pub color: ColorChoice,

    /// Config file path, relative to ROOT (default: vizcore.toml)
    #[arg(short = 'C', long, global = true, default_value = vizcore::config::CONFIG_FILE, value_hint = clap::ValueHint::FilePath)]
    pub config: PathBuf,

    /// Enable verbose output for debugging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Watch ROOT and print coordinated file changes until Ctrl+C
    #[command(visible_alias = "w")]
    Watch {
        /// Workspace root (default: current directory)
        #[arg(value_hint = clap::ValueHint::DirPath)]
        root: Option<PathBuf>,
    },

    /// Print a stored snapshot and whether it still validates
    #[command(visible_alias = "i")]
    Inspect {
        /// Workspace root (default: current directory)
        #[arg(value_hint = clap::ValueHint::DirPath)]
        root: Option<PathBuf>,

        /// State key, without namespace
        #[arg(short, long)]
        key: String,

        /// Storage scope
        #[arg(short, long, value_enum, default_value = "workspace")]
        scope: ScopeArg,
    },
}

impl Commands {
    /// Workspace root, defaulting to the current directory.
    pub fn root(&self) -> PathBuf {
        let root = match self {
            Self::Watch { root } | Self::Inspect { root, .. } => root.clone(),
        };
        root.unwrap_or_else(|| PathBuf::from("."))
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeArg {
    Global,
    Workspace,
}

impl From<ScopeArg> for StateScope {
    fn from(scope: ScopeArg) -> Self {
        match scope {
            ScopeArg::Global => StateScope::Global,
            ScopeArg::Workspace => StateScope::Workspace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_defaults() {
        let cli = Cli::try_parse_from(["vizcore", "watch"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("vizcore.toml"));
        assert!(!cli.verbose);
        assert_eq!(cli.command.root(), PathBuf::from("."));
    }

    #[test]
    fn test_inspect_args() {
        let cli = Cli::try_parse_from([
            "vizcore", "-v", "inspect", "/work", "--key", "layout", "--scope", "global",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.command.root(), PathBuf::from("/work"));
        let Commands::Inspect { key, scope, .. } = cli.command else {
            panic!("expected inspect");
        };
        assert_eq!(key, "layout");
        assert_eq!(StateScope::from(scope), StateScope::Global);
    }

    #[test]
    fn test_inspect_requires_key() {
        assert!(Cli::try_parse_from(["vizcore", "inspect"]).is_err());
    }
}
