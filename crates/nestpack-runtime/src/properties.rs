//! Process-wide diagnostic properties
//!
//! The bootstrap stamps its milestones here as microseconds since the Unix
//! epoch, under the `nestpack.bootstrap:` prefix. They are cleared when the
//! bootstrap terminates.

use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

pub const PREFIX: &str = "nestpack.bootstrap:";

pub const BEGIN: &str = "begin";
pub const SCAN_BEGIN: &str = "scan.begin";
pub const SCAN_END: &str = "scan.end";
pub const MAIN_INVOKE: &str = "main.invoke";

static PROPERTIES: LazyLock<RwLock<FxHashMap<String, String>>> =
    LazyLock::new(|| RwLock::new(FxHashMap::default()));

fn qualified(key: &str) -> String {
    format!("{}{}", PREFIX, key)
}

/// Current time in microseconds since the Unix epoch.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_micros() as u64)
}

pub fn set(key: &str, value: impl Into<String>) {
    PROPERTIES.write().insert(qualified(key), value.into());
}

/// Stamp `key` with the current time and return the stamp.
pub fn set_timestamp(key: &str) -> u64 {
    let now = now_micros();
    set(key, now.to_string());
    now
}

pub fn get(key: &str) -> Option<String> {
    PROPERTIES.read().get(&qualified(key)).cloned()
}

/// Value of `key` as a timestamp.
pub fn timestamp(key: &str) -> Option<u64> {
    get(key).and_then(|v| v.parse().ok())
}

/// All bootstrap properties, sorted by key (prefix included).
pub fn snapshot() -> Vec<(String, String)> {
    let mut entries: Vec<_> = PROPERTIES
        .read()
        .iter()
        .filter(|(k, _)| k.starts_with(PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    entries.sort();
    entries
}

/// Remove every bootstrap property.
pub fn clear() {
    PROPERTIES.write().retain(|k, _| !k.starts_with(PREFIX));
}
