//! Bootstrap configuration
//!
//! Built from defaults, then environment variables. The launcher applies its
//! command-line flags on top.

use std::path::PathBuf;
use std::time::Duration;

use nestpack_core::{ContainerLocation, IndexOptions};

use crate::error::BootstrapError;
use crate::shutdown::ShutdownPolicy;

/// Entry module used when neither the configuration nor the container's
/// descriptor names one.
pub const DEFAULT_ENTRY_MODULE: &str = "app.Main";

/// Procedure invoked on the entry module.
pub const DEFAULT_ENTRY_PROCEDURE: &str = "main";

pub const ENV_CONTAINER: &str = "NESTPACK_CONTAINER";
pub const ENV_ENTRY: &str = "NESTPACK_ENTRY";
pub const ENV_THREAD_REPORT_ONLY: &str = "NESTPACK_THREAD_REPORT_ONLY";
pub const ENV_SYSTEM_EXIT: &str = "NESTPACK_SYSTEM_EXIT";
pub const ENV_STOP_TIMEOUT_MS: &str = "NESTPACK_STOP_TIMEOUT_MS";

#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Container archive; the running executable when unset.
    pub container: Option<PathBuf>,
    /// Entry module; falls back to the descriptor's `main`, then the default.
    pub entry_module: Option<String>,
    pub entry_procedure: String,
    pub index: IndexOptions,
    pub shutdown: ShutdownPolicy,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            container: None,
            entry_module: None,
            entry_procedure: DEFAULT_ENTRY_PROCEDURE.to_string(),
            index: IndexOptions::default(),
            shutdown: ShutdownPolicy::default(),
        }
    }
}

impl BootstrapConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(path) = lookup(ENV_CONTAINER).filter(|v| !v.is_empty()) {
            config.container = Some(PathBuf::from(path));
        }
        if let Some(entry) = lookup(ENV_ENTRY).filter(|v| !v.is_empty()) {
            config.entry_module = Some(entry);
        }
        if let Some(value) = lookup(ENV_THREAD_REPORT_ONLY) {
            config.shutdown.report_only = parse_flag(&value);
        }
        if let Some(value) = lookup(ENV_SYSTEM_EXIT) {
            config.shutdown.system_exit = parse_flag(&value);
        }
        if let Some(value) = lookup(ENV_STOP_TIMEOUT_MS) {
            match value.trim().parse::<u64>() {
                Ok(ms) => config.shutdown.stop_timeout = Duration::from_millis(ms),
                Err(_) => tracing::warn!(
                    variable = ENV_STOP_TIMEOUT_MS,
                    value = %value,
                    "Ignoring invalid stop timeout"
                ),
            }
        }
        config
    }

    /// Where the container lives.
    pub fn container_location(&self) -> Result<ContainerLocation, BootstrapError> {
        match &self.container {
            Some(path) => Ok(ContainerLocation::from_path(path)?),
            None => ContainerLocation::current_exe().map_err(BootstrapError::Locate),
        }
    }
}

/// `true` (any case) is true, anything else is false.
pub fn parse_flag(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}
