//! genai-cache: maintenance CLI for durable cache state.
//!
//! Opens the configured file store, rehydrates a named cache profile and
//! reports on it or prunes it. Output is JSON on stdout; logs go to stderr.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::{json, Value};
use tracing::info;

use genai_cache::config::{Cli, Command, Config};
use genai_cache::{CacheManager, DurableStore, FileStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "genai_cache=debug"
    } else {
        "genai_cache=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    info!("genai-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?;
    info!(
        storage = %config.storage.path.display(),
        quota_bytes = ?config.storage.quota_bytes,
        profiles = config.caches.len(),
        "Configuration loaded"
    );

    let report = match cli.command {
        Command::Profiles => serde_json::to_value(&config.caches)?,
        Command::Stats { profile } => {
            let manager = open_profile(&config, &profile)?;
            json!({
                "profile": profile,
                "namespace": manager.namespace(),
                "stats": manager.stats(),
                "counters": manager.counters(),
                "lookup_hit_ratio": manager.lookup_hit_ratio(),
                "sweep": config.sweep,
                "preload": config.preload,
            })
        }
        Command::Sweep { profile } => {
            let manager = open_profile(&config, &profile)?;
            // Rehydration already drops records past the stale window.
            let removed = manager.sweep();
            json!({
                "profile": profile,
                "removed": removed,
                "remaining": manager.len(),
            })
        }
        Command::Clear { profile } => {
            let manager = open_profile(&config, &profile)?;
            let dropped = manager.len();
            manager.destroy();
            json!({
                "profile": profile,
                "cleared": dropped,
            })
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Rehydrate the manager for `name` from the configured file store.
fn open_profile(config: &Config, name: &str) -> anyhow::Result<CacheManager<Value>> {
    let store = FileStore::open(&config.storage.path, config.storage.quota_bytes)
        .with_context(|| format!("opening durable store at {}", config.storage.path.display()))?;
    info!(
        profile = name,
        path = %store.root().display(),
        used_bytes = store.used_bytes(),
        "Durable store opened"
    );

    let store: Arc<dyn DurableStore> = Arc::new(store);
    Ok(CacheManager::open(config, name, store)?)
}
