//! Launcher subcommands.

pub mod cat;
pub mod ls;
pub mod run;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use nestpack_core::EntryIndex;
use nestpack_runtime::BootstrapConfig;

/// Environment configuration with the `--container` flag applied.
pub fn config(container: Option<PathBuf>) -> BootstrapConfig {
    let mut config = BootstrapConfig::from_env();
    if container.is_some() {
        config.container = container;
    }
    config
}

/// Scan the configured container.
pub fn scan(config: &BootstrapConfig) -> anyhow::Result<Arc<EntryIndex>> {
    let location = config.container_location()?;
    let index = EntryIndex::new(location, config.index.clone());
    let report = index
        .scan()
        .with_context(|| format!("Failed to index {}", index.location().path().display()))?;
    for skipped in &report.skipped {
        eprintln!("skipped {}: {}", skipped.locator, skipped.reason);
    }
    Ok(Arc::new(index))
}
