//! `nestpack ls`: print the locator of every entry in the container.

use std::io::{self, Write};
use std::path::PathBuf;

pub fn execute(container: Option<PathBuf>, units_only: bool) -> anyhow::Result<()> {
    let config = super::config(container);
    let index = super::scan(&config)?;
    let suffix = &config.index.code_unit_suffix;

    let mut out = io::stdout().lock();
    for descriptor in index.descriptors() {
        if units_only && !descriptor.path.ends_with(suffix.as_str()) {
            continue;
        }
        let marker = if descriptor.is_nested_archive {
            "archive"
        } else if descriptor.is_dir {
            "dir"
        } else {
            "entry"
        };
        writeln!(out, "{:<8} {:>10} {}", marker, descriptor.size, descriptor.locator())?;
    }
    Ok(())
}
