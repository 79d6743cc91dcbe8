//! `nestpack cat`: resolve a locator through the installed resolver.

use std::io;
use std::path::PathBuf;

use anyhow::Context;
use nestpack_core::resolver;

pub fn execute(container: Option<PathBuf>, locator: &str) -> anyhow::Result<()> {
    let config = super::config(container);
    let index = super::scan(&config)?;
    resolver::install_nested(resolver::global(), index)?;

    let mut stream =
        resolver::open(locator).with_context(|| format!("Failed to open {}", locator))?;
    io::copy(&mut stream, &mut io::stdout().lock())?;
    Ok(())
}
