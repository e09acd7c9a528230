//! vizcore - headless runner for the coordination core.

mod cli;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ColorChoice, Parser};
use owo_colors::OwoColorize;
use tokio::sync::mpsc;

use cli::{Cli, Commands};
use vizcore::config::VizConfig;
use vizcore::lifecycle::{Coordinator, EventType};
use vizcore::recovery::{ConsoleNotifier, ErrorRecoverySystem};
use vizcore::state::{FileStore, KeyValueStore, StateManager, StateScope};
use vizcore::watch::NotifyProvider;
use vizcore::webview::HeadlessPanelHost;
use vizcore::{Extension, Host, Logger, log};

/// Directory under ROOT holding the state files.
const STATE_DIR: &str = ".vizcore";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.color {
        ColorChoice::Always => owo_colors::set_override(true),
        ColorChoice::Never => owo_colors::set_override(false),
        ColorChoice::Auto => {} // owo-colors auto-detects TTY
    }

    let logger = Logger::stdout().verbose(cli.verbose);
    let root = cli.command.root();
    let root = root
        .canonicalize()
        .with_context(|| format!("workspace root {} not found", root.display()))?;
    let config_path = root.join(&cli.config);
    let config = VizConfig::load(&config_path)
        .with_context(|| format!("invalid config {}", config_path.display()))?;

    match cli.command {
        Commands::Watch { .. } => watch(config, &root, logger).await,
        Commands::Inspect { key, scope, .. } => {
            inspect(config, &root, &key, scope.into(), logger).await
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

fn open_store(root: &Path, scope: StateScope) -> Result<Arc<dyn KeyValueStore>> {
    let path = root.join(STATE_DIR).join(format!("{scope}.json"));
    Ok(Arc::new(FileStore::open(path)?))
}

/// Run the core over `root` until Ctrl+C.
async fn watch(config: VizConfig, root: &Path, logger: Logger) -> Result<()> {
    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })
    .context("failed to install Ctrl+C handler")?;

    let host = Host {
        global_store: open_store(root, StateScope::Global)?,
        workspace_store: open_store(root, StateScope::Workspace)?,
        panels: Arc::new(HeadlessPanelHost),
        watch_provider: Arc::new(NotifyProvider::new()),
        notifier: Some(Arc::new(ConsoleNotifier)),
    };
    let ext = Extension::activate(config, host, root, logger.clone()).await?;

    ext.coordinator.on(EventType::FileChanged, |event| {
        if let Some(payload) = &event.payload {
            let kind = payload["kind"].as_str().unwrap_or("?");
            let path = payload["path"].as_str().unwrap_or("?");
            println!("{} {}", kind.cyan(), path);
        }
        async { Ok(()) }
    });

    if let Some(backend) = ext.watcher.backend() {
        log!(logger, "watch"; "press Ctrl+C to stop ({} backend)", backend);
    }
    shutdown_rx.recv().await;

    log!(logger, "extension"; "shutting down...");
    ext.deactivate().await;
    Ok(())
}

/// Print the stored snapshot for `key`.
async fn inspect(
    config: VizConfig,
    root: &Path,
    key: &str,
    scope: StateScope,
    logger: Logger,
) -> Result<()> {
    let store = open_store(root, scope)?;
    let coordinator = Arc::new(Coordinator::new(config.reload, logger.clone()));
    let recovery = Arc::new(ErrorRecoverySystem::new(config.recovery, logger.clone()));
    let state = StateManager::new(
        config.state,
        Arc::clone(&store),
        store,
        coordinator,
        recovery,
        logger,
    );

    let Some(found) = state.inspect(scope, key).await? else {
        println!("{} no `{}` in {} state", "-".dimmed(), key, scope);
        return Ok(());
    };

    let verdict = |ok: bool| if ok { "ok".green().to_string() } else { "FAILED".red().to_string() };
    println!("{}", found.storage_key.bold());
    println!("  version   {}", found.snapshot.version);
    println!("  age       {:.1}s", found.age.as_secs_f64());
    println!("  checksum  {}", verdict(found.checksum_valid));
    println!("  ttl       {}", verdict(!found.expired));
    println!("{}", serde_json::to_string_pretty(&found.snapshot.data)?);
    Ok(())
}
